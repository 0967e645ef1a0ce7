use modelforge_core::ForgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NnError {
    #[error("invalid architecture: {0}")]
    Build(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<NnError> for ForgeError {
    fn from(err: NnError) -> Self {
        match err {
            NnError::Manifest(msg) => ForgeError::Storage(msg),
            NnError::Io(e) => ForgeError::Io(e),
            NnError::Serialization(e) => ForgeError::Serialization(e),
            other => ForgeError::Training(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, NnError>;
