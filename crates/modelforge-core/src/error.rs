use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    ConflictOrBusy(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Prediction error: {0}")]
    Prediction(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Security violation: {0}")]
    Security(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ForgeError {
    /// Whether a caller can reasonably retry the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ForgeError::ConflictOrBusy(_) | ForgeError::ResourceLimit(_) | ForgeError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;
