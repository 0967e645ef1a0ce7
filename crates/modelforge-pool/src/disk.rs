//! Second-level disk cache of version artifacts.
//!
//! Each `(model, version)` key owns a directory of copied artifact files
//! plus a metadata record. Metadata lives in one `cache-meta.json` at the
//! cache root, rewritten atomically (write-temp-then-rename) after every
//! mutation. When the total byte size exceeds the cap, the stalest and
//! least-accessed entries are evicted until the cache fits.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use modelforge_core::{ModelId, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const META_FILE: &str = "cache-meta.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskEntry {
    updated_at: DateTime<Utc>,
    size_bytes: u64,
    access_count: u64,
    files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DiskMeta {
    entries: BTreeMap<String, DiskEntry>,
}

impl DiskMeta {
    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskCacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
}

pub struct DiskCache {
    root: PathBuf,
    max_bytes: u64,
    ttl_days: i64,
    meta: Mutex<DiskMeta>,
}

fn entry_key(model_id: ModelId, version: &str) -> String {
    format!("{model_id}/{version}")
}

impl DiskCache {
    pub async fn open(root: impl Into<PathBuf>, max_bytes: u64, ttl_days: u64) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let meta = match tokio::fs::read_to_string(root.join(META_FILE)).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(error = %err, "disk cache metadata unreadable, starting empty");
                DiskMeta::default()
            }),
            Err(_) => DiskMeta::default(),
        };
        Ok(Self {
            root,
            max_bytes,
            ttl_days: ttl_days as i64,
            meta: Mutex::new(meta),
        })
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Local directory for a cached version, when present, fresh and whole.
    pub async fn load(&self, model_id: ModelId, version: &str) -> Option<PathBuf> {
        let key = entry_key(model_id, version);
        let (dir, files) = {
            let mut meta = self.meta.lock();
            let entry = meta.entries.get_mut(&key)?;
            if Utc::now() - entry.updated_at > ChronoDuration::days(self.ttl_days) {
                debug!(key, "disk cache entry expired");
                meta.entries.remove(&key);
                return None;
            }
            entry.access_count += 1;
            (self.entry_dir(&key), entry.files.clone())
        };

        for file in &files {
            if tokio::fs::metadata(dir.join(file)).await.is_err() {
                warn!(key, file, "disk cache entry missing a file, discarding");
                self.meta.lock().entries.remove(&key);
                return None;
            }
        }

        self.persist_meta().await.ok()?;
        Some(dir)
    }

    /// Copy a version directory into the cache and record it.
    pub async fn store(&self, model_id: ModelId, version: &str, source: &Path) -> Result<PathBuf> {
        let key = entry_key(model_id, version);
        let dir = self.entry_dir(&key);
        tokio::fs::create_dir_all(&dir).await?;

        let mut files = Vec::new();
        let mut size_bytes = 0u64;
        let mut entries = tokio::fs::read_dir(source).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let target = dir.join(&name);
            if entry.path() != target {
                tokio::fs::copy(entry.path(), &target).await?;
            }
            size_bytes += entry.metadata().await?.len();
            files.push(name);
        }

        let evicted = {
            let mut meta = self.meta.lock();
            meta.entries.insert(
                key.clone(),
                DiskEntry {
                    updated_at: Utc::now(),
                    size_bytes,
                    access_count: 0,
                    files,
                },
            );
            self.evict_to_cap(&mut meta, &key)
        };
        for victim in evicted {
            let victim_dir = self.entry_dir(&victim);
            if let Err(err) = tokio::fs::remove_dir_all(&victim_dir).await {
                warn!(key = victim, error = %err, "failed to remove evicted cache entry");
            }
        }

        self.persist_meta().await?;
        Ok(dir)
    }

    pub async fn remove_model(&self, model_id: ModelId) -> Result<()> {
        let prefix = format!("{model_id}/");
        let victims: Vec<String> = {
            let mut meta = self.meta.lock();
            let victims: Vec<String> = meta
                .entries
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            for key in &victims {
                meta.entries.remove(key);
            }
            victims
        };
        for key in victims {
            let _ = tokio::fs::remove_dir_all(self.entry_dir(&key)).await;
        }
        self.persist_meta().await
    }

    pub fn stats(&self) -> DiskCacheStats {
        let meta = self.meta.lock();
        DiskCacheStats {
            entries: meta.entries.len(),
            total_bytes: meta.total_bytes(),
            max_bytes: self.max_bytes,
        }
    }

    /// Pick eviction victims until the cache fits its byte cap. The entry
    /// just written is never evicted.
    fn evict_to_cap(&self, meta: &mut DiskMeta, protect: &str) -> Vec<String> {
        let mut victims = Vec::new();
        while meta.total_bytes() > self.max_bytes {
            let candidate = meta
                .entries
                .iter()
                .filter(|(k, _)| k.as_str() != protect)
                .min_by(|(_, a), (_, b)| {
                    a.access_count
                        .cmp(&b.access_count)
                        .then(a.updated_at.cmp(&b.updated_at))
                })
                .map(|(k, _)| k.clone());
            match candidate {
                Some(key) => {
                    meta.entries.remove(&key);
                    victims.push(key);
                }
                None => break,
            }
        }
        victims
    }

    async fn persist_meta(&self) -> Result<()> {
        let serialized = {
            let meta = self.meta.lock();
            serde_json::to_string_pretty(&*meta)?
        };
        let tmp = self.root.join(format!("{META_FILE}.tmp"));
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, self.root.join(META_FILE)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn artifact_dir(bytes: usize) -> (tempfile::TempDir, PathBuf) {
        let staging = tempfile::tempdir().unwrap();
        let dir = staging.path().join("v");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("model.json"), "{}").await.unwrap();
        tokio::fs::write(dir.join("weights-000.bin"), vec![0u8; bytes])
            .await
            .unwrap();
        (staging, dir)
    }

    #[tokio::test]
    async fn store_then_load_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(root.path(), 1 << 20, 7).await.unwrap();
        let id = Uuid::new_v4();
        let (_staging, dir) = artifact_dir(64).await;

        cache.store(id, "1.0.0", &dir).await.unwrap();
        let loaded = cache.load(id, "1.0.0").await.unwrap();
        assert!(loaded.join("weights-000.bin").exists());
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn missing_file_discards_entry() {
        let root = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(root.path(), 1 << 20, 7).await.unwrap();
        let id = Uuid::new_v4();
        let (_staging, dir) = artifact_dir(64).await;

        let cached = cache.store(id, "1.0.0", &dir).await.unwrap();
        tokio::fs::remove_file(cached.join("weights-000.bin"))
            .await
            .unwrap();
        assert!(cache.load(id, "1.0.0").await.is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn byte_cap_evicts_least_used() {
        let root = tempfile::tempdir().unwrap();
        // Cap fits roughly two entries of ~1 KiB.
        let cache = DiskCache::open(root.path(), 2_200, 7).await.unwrap();
        let id = Uuid::new_v4();

        let (_s1, d1) = artifact_dir(1024).await;
        cache.store(id, "1.0.0", &d1).await.unwrap();
        // Touch 1.0.0 so it outranks the next entry.
        cache.load(id, "1.0.0").await.unwrap();

        let (_s2, d2) = artifact_dir(1024).await;
        cache.store(id, "1.1.0", &d2).await.unwrap();
        let (_s3, d3) = artifact_dir(1024).await;
        cache.store(id, "1.2.0", &d3).await.unwrap();

        let stats = cache.stats();
        assert!(stats.total_bytes <= 2_200);
        // The accessed entry survived; the untouched middle one went.
        assert!(cache.load(id, "1.0.0").await.is_some());
        assert!(cache.load(id, "1.1.0").await.is_none());
    }

    #[tokio::test]
    async fn metadata_survives_reopen() {
        let root = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        {
            let cache = DiskCache::open(root.path(), 1 << 20, 7).await.unwrap();
            let (_staging, dir) = artifact_dir(64).await;
            cache.store(id, "1.0.0", &dir).await.unwrap();
        }
        let reopened = DiskCache::open(root.path(), 1 << 20, 7).await.unwrap();
        assert!(reopened.load(id, "1.0.0").await.is_some());
    }
}
