//! Object-store backends speaking plain HTTP: an S3-style path layout and a
//! GCS-style JSON API layout. Both share the manifest-first fetch routine
//! that makes the local cache directory self-sufficient for loading.

use crate::{StorageBackend, PREP_FILE};
use async_trait::async_trait;
use modelforge_core::config::StorageSettings;
use modelforge_core::{ForgeError, ModelId, Result};
use modelforge_nn::{ModelManifest, MANIFEST_FILE};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFlavor {
    S3,
    Gcs,
}

pub struct ObjectStoreBackend {
    flavor: ObjectFlavor,
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    prefix: String,
    cache_root: PathBuf,
}

fn encode_key(key: &str) -> String {
    key.replace('/', "%2F")
}

impl ObjectStoreBackend {
    pub fn new(flavor: ObjectFlavor, settings: &StorageSettings) -> Result<Self> {
        if settings.bucket.is_empty() || settings.endpoint.is_empty() {
            return Err(ForgeError::Configuration(
                "object storage requires MODEL_STORAGE_BUCKET and MODEL_STORAGE_ENDPOINT".into(),
            ));
        }
        Ok(Self {
            flavor,
            client: reqwest::Client::new(),
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            bucket: settings.bucket.clone(),
            prefix: settings.prefix.trim_matches('/').to_string(),
            cache_root: PathBuf::from(&settings.local_root),
        })
    }

    fn key(&self, model_id: ModelId, version: &str, file: &str) -> String {
        if self.prefix.is_empty() {
            format!("{model_id}/{version}/{file}")
        } else {
            format!("{}/{model_id}/{version}/{file}", self.prefix)
        }
    }

    fn download_url(&self, key: &str) -> String {
        match self.flavor {
            ObjectFlavor::S3 => format!("{}/{}/{key}", self.endpoint, self.bucket),
            ObjectFlavor::Gcs => format!(
                "{}/storage/v1/b/{}/o/{}?alt=media",
                self.endpoint,
                self.bucket,
                encode_key(key)
            ),
        }
    }

    fn upload_url(&self, key: &str) -> String {
        match self.flavor {
            ObjectFlavor::S3 => format!("{}/{}/{key}", self.endpoint, self.bucket),
            ObjectFlavor::Gcs => format!(
                "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
                self.endpoint,
                self.bucket,
                encode_key(key)
            ),
        }
    }

    fn head_url(&self, key: &str) -> String {
        match self.flavor {
            ObjectFlavor::S3 => format!("{}/{}/{key}", self.endpoint, self.bucket),
            ObjectFlavor::Gcs => format!(
                "{}/storage/v1/b/{}/o/{}",
                self.endpoint,
                self.bucket,
                encode_key(key)
            ),
        }
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let url = self.upload_url(key);
        let request = match self.flavor {
            ObjectFlavor::S3 => self.client.put(&url),
            ObjectFlavor::Gcs => self.client.post(&url),
        };
        let response = request
            .body(bytes)
            .send()
            .await
            .map_err(|e| ForgeError::Storage(format!("upload of {key} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ForgeError::Storage(format!(
                "upload of {key} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let url = self.download_url(key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ForgeError::Storage(format!("download of {key} failed: {e}")))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ForgeError::NotFound(format!("object {key} not found"))),
            status if status.is_success() => Ok(response
                .bytes()
                .await
                .map_err(|e| ForgeError::Storage(e.to_string()))?
                .to_vec()),
            status => Err(ForgeError::Storage(format!(
                "download of {key} returned {status}"
            ))),
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn uri(&self, model_id: ModelId, version: &str) -> String {
        let scheme = match self.flavor {
            ObjectFlavor::S3 => "s3",
            ObjectFlavor::Gcs => "gs",
        };
        if self.prefix.is_empty() {
            format!("{scheme}://{}/{model_id}/{version}", self.bucket)
        } else {
            format!(
                "{scheme}://{}/{}/{model_id}/{version}",
                self.bucket, self.prefix
            )
        }
    }

    fn local_dir(&self, model_id: ModelId, version: &str) -> PathBuf {
        self.cache_root.join(model_id.to_string()).join(version)
    }

    async fn save(&self, model_id: ModelId, version: &str, local_dir: &Path) -> Result<String> {
        let mut entries = tokio::fs::read_dir(local_dir).await?;
        let mut uploaded = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            // The manifest goes last so exists() only turns true once the
            // shards it references are in place.
            if name == MANIFEST_FILE {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            self.upload(&self.key(model_id, version, &name), bytes)
                .await?;
            uploaded += 1;
        }
        let manifest_bytes = tokio::fs::read(local_dir.join(MANIFEST_FILE)).await?;
        self.upload(&self.key(model_id, version, MANIFEST_FILE), manifest_bytes)
            .await?;
        debug!(model_id = %model_id, version, files = uploaded + 1, "version uploaded");
        Ok(self.uri(model_id, version))
    }

    async fn fetch(&self, model_id: ModelId, version: &str) -> Result<PathBuf> {
        let dir = self.local_dir(model_id, version);
        tokio::fs::create_dir_all(&dir).await?;

        let manifest_bytes = self
            .download(&self.key(model_id, version, MANIFEST_FILE))
            .await?;
        tokio::fs::write(dir.join(MANIFEST_FILE), &manifest_bytes).await?;

        let manifest = ModelManifest::parse(
            std::str::from_utf8(&manifest_bytes)
                .map_err(|_| ForgeError::Storage("manifest is not valid UTF-8".into()))?,
        )?;
        for shard in manifest.shard_files() {
            let bytes = self.download(&self.key(model_id, version, shard)).await?;
            tokio::fs::write(dir.join(shard), bytes).await?;
        }

        match self.download(&self.key(model_id, version, PREP_FILE)).await {
            Ok(bytes) => tokio::fs::write(dir.join(PREP_FILE), bytes).await?,
            Err(err) => {
                warn!(model_id = %model_id, version, error = %err, "no preprocessing metadata for version")
            }
        }

        Ok(dir)
    }

    async fn exists(&self, model_id: ModelId, version: &str) -> Result<bool> {
        let url = self.head_url(&self.key(model_id, version, MANIFEST_FILE));
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| ForgeError::Storage(e.to_string()))?;
        Ok(response.status().is_success())
    }

    async fn delete_model(&self, model_id: ModelId) -> Result<()> {
        // Remote object deletion is deliberately left to bucket lifecycle
        // rules; only the local cache is cleared here.
        let dir = self.cache_root.join(model_id.to_string());
        if tokio::fs::metadata(&dir).await.is_ok() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> StorageSettings {
        StorageSettings {
            backend: "s3".into(),
            local_root: "/tmp/cache".into(),
            bucket: "models".into(),
            prefix: "ai".into(),
            endpoint: "http://store.internal:9000".into(),
        }
    }

    #[test]
    fn s3_uris_and_urls() {
        let backend = ObjectStoreBackend::new(ObjectFlavor::S3, &settings()).unwrap();
        let id = uuid::Uuid::nil();
        assert_eq!(
            backend.uri(id, "1.0.0"),
            format!("s3://models/ai/{id}/1.0.0")
        );
        assert_eq!(
            backend.download_url(&backend.key(id, "1.0.0", "model.json")),
            format!("http://store.internal:9000/models/ai/{id}/1.0.0/model.json")
        );
    }

    #[test]
    fn gcs_urls_encode_the_key() {
        let backend = ObjectStoreBackend::new(ObjectFlavor::Gcs, &settings()).unwrap();
        let id = uuid::Uuid::nil();
        let url = backend.download_url(&backend.key(id, "1.0.0", "model.json"));
        assert!(url.contains("/storage/v1/b/models/o/"));
        assert!(url.contains("%2F"));
        assert!(url.ends_with("alt=media"));
    }

    #[test]
    fn missing_bucket_is_a_configuration_error() {
        let mut bad = settings();
        bad.bucket.clear();
        assert!(ObjectStoreBackend::new(ObjectFlavor::S3, &bad).is_err());
    }
}
