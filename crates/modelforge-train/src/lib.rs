//! Training for Modelforge: the orchestrator that takes a created model to
//! a ready, versioned artifact, the advisory locking that keeps writers
//! exclusive per model, and the incremental learner that folds feedback
//! into the current version.

pub mod incremental;
pub mod lock;
pub mod orchestrator;
pub mod version;

pub use incremental::{IncrementalLearner, UpdateRecord};
pub use lock::{clear_stale_lock, LockRegistry, ModelLockGuard};
pub use orchestrator::{TrainOutcome, TrainingOrchestrator};
pub use version::{bump_minor, bump_patch, next_training_version, INITIAL_VERSION};
