use thiserror::Error;

pub type Result<T> = std::result::Result<T, LatticeError>;

#[derive(Debug, Error)]
pub enum LatticeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("transient backend error: {0}")]
    Transient(String),
    #[error("query cancelled")]
    Cancelled,
    #[error("query deadline exceeded")]
    Timeout,
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LatticeError {
    /// Transient errors are the only kind the data loader retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, LatticeError::Transient(_))
    }
}
