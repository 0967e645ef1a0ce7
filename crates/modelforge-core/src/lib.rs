//! Core types for the Modelforge platform: the shared data model, the error
//! taxonomy, environment-driven configuration, and the provider traits that
//! the composition root wires together.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::Settings;
pub use error::{ForgeError, Result};
pub use traits::{
    resolve_provider, DataProvider, DocumentProvider, DocumentStore, EmbeddingProvider,
    MemoryDocumentStore,
};
pub use types::{
    Algorithm, FeatureValue, ModelConfig, ModelId, ModelKind, ModelRecord, ModelStatus,
    ModelVersionEntry, PredictionFeedback, PredictionId, PredictionOutput, PredictionRecord, Row,
    TrainingDataInfo, VersionStage,
};
