//! Model registry for Modelforge: version histories with stage control,
//! evaluation metric routines, offline version comparison, and the A/B
//! coordinator that routes live traffic between two versions.

pub mod ab;
pub mod compare;
pub mod metrics;
pub mod registry;

pub use ab::{AbCoordinator, AbResults, AbSideSummary, AbTestConfig, TestSide};
pub use compare::{ComparisonResult, ComparisonWinner, ModelComparator};
pub use metrics::{
    classification_metrics, regression_metrics, ClassMetrics, ClassificationMetrics,
    RegressionMetrics,
};
pub use registry::ModelRegistry;
