use modelforge_core::ForgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrepError {
    #[error("empty training dataset")]
    EmptyDataset,

    #[error("target '{0}' is missing from every training row")]
    TargetMissing(String),

    #[error("invalid target value: {0}")]
    InvalidTarget(String),

    #[error("schema violation: {0}")]
    Schema(String),
}

impl From<PrepError> for ForgeError {
    fn from(err: PrepError) -> Self {
        match err {
            PrepError::Schema(msg) => ForgeError::Validation(msg),
            other => ForgeError::Training(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PrepError>;
