//! Local-filesystem backend: the canonical location and the cache are the
//! same directory tree, so saves and fetches reduce to path resolution.

use crate::{publish_dir, StorageBackend};
use async_trait::async_trait;
use modelforge_core::{ForgeError, ModelId, Result};
use modelforge_nn::MANIFEST_FILE;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn version_dir(&self, model_id: ModelId, version: &str) -> PathBuf {
        self.root.join(model_id.to_string()).join(version)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn uri(&self, model_id: ModelId, version: &str) -> String {
        format!("file://{}", self.version_dir(model_id, version).display())
    }

    fn local_dir(&self, model_id: ModelId, version: &str) -> PathBuf {
        self.version_dir(model_id, version)
    }

    async fn save(&self, model_id: ModelId, version: &str, local_dir: &Path) -> Result<String> {
        let target = self.version_dir(model_id, version);
        if local_dir != target {
            publish_dir(local_dir, &target).await?;
        }
        debug!(model_id = %model_id, version, dir = %target.display(), "version published");
        Ok(self.uri(model_id, version))
    }

    async fn fetch(&self, model_id: ModelId, version: &str) -> Result<PathBuf> {
        let dir = self.version_dir(model_id, version);
        let manifest = dir.join(MANIFEST_FILE);
        if tokio::fs::metadata(&manifest).await.is_err() {
            return Err(ForgeError::Storage(format!(
                "model {model_id} version {version} not found at {}",
                dir.display()
            )));
        }
        Ok(dir)
    }

    async fn exists(&self, model_id: ModelId, version: &str) -> Result<bool> {
        let manifest = self.version_dir(model_id, version).join(MANIFEST_FILE);
        Ok(tokio::fs::metadata(manifest).await.is_ok())
    }

    async fn delete_model(&self, model_id: ModelId) -> Result<()> {
        let dir = self.root.join(model_id.to_string());
        if tokio::fs::metadata(&dir).await.is_ok() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn write_version(dir: &Path) {
        tokio::fs::create_dir_all(dir).await.unwrap();
        tokio::fs::write(dir.join(MANIFEST_FILE), "{}").await.unwrap();
        tokio::fs::write(dir.join("weights-000.bin"), [0u8; 8])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn uris_use_the_file_scheme() {
        let backend = LocalBackend::new("/data/models");
        let id = Uuid::new_v4();
        let uri = backend.uri(id, "1.0.0");
        assert!(uri.starts_with("file:///data/models/"));
        assert!(uri.ends_with("/1.0.0"));
    }

    #[tokio::test]
    async fn save_renames_staging_into_place() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path());
        let id = Uuid::new_v4();

        let tmp = staging.path().join("build");
        write_version(&tmp).await;
        backend.save(id, "1.0.0", &tmp).await.unwrap();

        assert!(backend.exists(id, "1.0.0").await.unwrap());
        let fetched = backend.fetch(id, "1.0.0").await.unwrap();
        assert!(fetched.join("weights-000.bin").exists());
    }

    #[tokio::test]
    async fn saving_an_existing_version_fails() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path());
        let id = Uuid::new_v4();

        let tmp = staging.path().join("a");
        write_version(&tmp).await;
        backend.save(id, "1.0.0", &tmp).await.unwrap();

        let tmp2 = staging.path().join("b");
        write_version(&tmp2).await;
        let err = backend.save(id, "1.0.0", &tmp2).await.unwrap_err();
        assert!(matches!(err, ForgeError::Storage(_)));
    }

    #[tokio::test]
    async fn fetch_of_unknown_version_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path());
        assert!(backend.fetch(Uuid::new_v4(), "9.9.9").await.is_err());
    }

    #[tokio::test]
    async fn delete_model_removes_all_versions() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path());
        let id = Uuid::new_v4();
        let tmp = staging.path().join("v");
        write_version(&tmp).await;
        backend.save(id, "1.0.0", &tmp).await.unwrap();

        backend.delete_model(id).await.unwrap();
        assert!(!backend.exists(id, "1.0.0").await.unwrap());
    }
}
