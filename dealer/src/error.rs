use thiserror::Error;

#[derive(Error, Debug)]
pub enum DealerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("manager is not running")]
    ManagerStopped,
}

pub type DealerResult<T> = std::result::Result<T, DealerError>;
