//! Storage adapter for model version directories.
//!
//! Three interchangeable backends hide where artifacts live: the local
//! filesystem, an S3-style object store, or a GCS-style object store. The
//! contract is directory-shaped: a version directory holds the model
//! manifest, the weight shards it names, and `prep.json`. Fetch always
//! resolves manifest first so the local copy is complete before any load.

mod local;
mod object;

pub use local::LocalBackend;
pub use object::{ObjectFlavor, ObjectStoreBackend};

use async_trait::async_trait;
use modelforge_core::config::StorageSettings;
use modelforge_core::{ForgeError, ModelId, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File the prediction path reads alongside the weights.
pub const PREP_FILE: &str = "prep.json";

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Canonical URI of the version directory.
    fn uri(&self, model_id: ModelId, version: &str) -> String;

    /// Local cache path of the version directory.
    fn local_dir(&self, model_id: ModelId, version: &str) -> PathBuf;

    /// Publish every file under `local_dir` to the canonical location and
    /// return the canonical URI. A no-op upload for the local backend.
    async fn save(&self, model_id: ModelId, version: &str, local_dir: &Path) -> Result<String>;

    /// Ensure the version directory is complete locally: manifest, every
    /// weight shard it references, and preprocessing metadata. Returns the
    /// local directory.
    async fn fetch(&self, model_id: ModelId, version: &str) -> Result<PathBuf>;

    /// Whether the manifest exists at the canonical location.
    async fn exists(&self, model_id: ModelId, version: &str) -> Result<bool>;

    /// Remove all stored versions of a model. Used on model deletion.
    async fn delete_model(&self, model_id: ModelId) -> Result<()>;
}

/// Select a backend from configuration.
pub fn from_settings(settings: &StorageSettings) -> Result<Arc<dyn StorageBackend>> {
    match settings.backend.as_str() {
        "local" => Ok(Arc::new(LocalBackend::new(&settings.local_root))),
        "s3" => Ok(Arc::new(ObjectStoreBackend::new(
            ObjectFlavor::S3,
            settings,
        )?)),
        "gcs" => Ok(Arc::new(ObjectStoreBackend::new(
            ObjectFlavor::Gcs,
            settings,
        )?)),
        other => Err(ForgeError::Configuration(format!(
            "unknown storage backend '{other}'"
        ))),
    }
}

/// Move a fully-written temporary directory into its final location.
///
/// Rename is atomic on one filesystem, which is what keeps partially
/// written versions invisible to readers.
pub async fn publish_dir(tmp: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::metadata(target).await.is_ok() {
        return Err(ForgeError::Storage(format!(
            "version directory {} already exists",
            target.display()
        )));
    }
    tokio::fs::rename(tmp, target).await?;
    Ok(())
}
