//! Network layer for Modelforge: dense and recurrent architectures on
//! ndarray with minibatch training, early stopping, and manifest-based
//! persistence. The training orchestrator and prediction service consume
//! this crate; nothing here knows about storage backends or HTTP.

pub mod activation;
pub mod builder;
pub mod error;
pub mod layer;
pub mod loss;
pub mod manifest;
pub mod network;
pub mod optimizer;

pub use activation::Activation;
pub use builder::{build_spec, ArchitectureOptions};
pub use error::NnError;
pub use layer::{Layer, LayerSpec};
pub use loss::Loss;
pub use manifest::{load_from_dir, save_to_dir, ModelManifest, ShardEntry, MANIFEST_FILE};
pub use network::{FitConfig, FitReport, Network, NetworkSpec};
pub use optimizer::OptimizerSpec;
