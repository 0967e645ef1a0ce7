//! Serving for Modelforge: the prediction service with preprocessing
//! replay and SLA enforcement, the bounded prediction log, named input
//! transformers, and offline evaluation with permutation importance.

pub mod evaluation;
pub mod history;
pub mod service;
pub mod transformer;

pub use evaluation::{Evaluator, FeatureImportance};
pub use history::PredictionLog;
pub use service::{BatchItem, BatchOutcome, PredictOptions, PredictionService};
pub use transformer::{TransformOp, TransformerRegistry, TransformerSpec};
