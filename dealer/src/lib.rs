pub mod cluster;
pub mod config;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod monitor;
pub mod push;

pub use config::{DealerConfig, ManagerContextConfig};
pub use error::{DealerError, DealerResult};
pub use jobs::{JobManager, ManagerContext, Request, Response};
