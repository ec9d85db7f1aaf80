//! Motor de asignación: tareas, jobs, procesos, deployments y el manager
//! que los serializa.

pub mod deployment;
pub mod job;
pub mod manager;
pub mod process;
pub mod request;
pub mod store;
pub mod task;

pub use deployment::{Deployment, JobRemoval, ProcessMap, ReportOutcome};
pub use job::{Job, JobMap, PendingChange};
pub use manager::{JobManager, ManagerContext};
pub use process::{Process, TaskUpdates};
pub use request::{Request, RequestMessage, Response};
pub use store::{FileJobStore, JobRecord, JobStore, MemoryJobStore, TaskCheckpoint};
pub use task::Task;
