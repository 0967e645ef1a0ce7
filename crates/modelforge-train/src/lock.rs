//! Per-model advisory locking.
//!
//! Two layers guard a model's version directories: an in-process async
//! mutex per model, and an on-disk lock file created with exclusive-create
//! semantics for cross-process safety. Writers hold both across weight
//! save, metadata save, registry update and cache invalidation.

use dashmap::DashMap;
use modelforge_core::{ForgeError, ModelId, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub struct LockRegistry {
    root: PathBuf,
    process_locks: DashMap<ModelId, Arc<Mutex<()>>>,
}

/// Held advisory lock; releasing removes the lock file.
#[derive(Debug)]
pub struct ModelLockGuard {
    lock_file: PathBuf,
    _process: OwnedMutexGuard<()>,
}

impl Drop for ModelLockGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.lock_file) {
            warn!(path = %self.lock_file.display(), error = %err, "failed to remove lock file");
        }
    }
}

impl LockRegistry {
    /// `root` is the directory under which per-model lock files live,
    /// normally the local storage root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            process_locks: DashMap::new(),
        }
    }

    fn lock_path(&self, model_id: ModelId) -> PathBuf {
        self.root.join(model_id.to_string()).join(".lock")
    }

    /// Acquire both layers within `timeout`, failing with a retryable
    /// conflict otherwise.
    pub async fn acquire(&self, model_id: ModelId, timeout: Duration) -> Result<ModelLockGuard> {
        let deadline = tokio::time::Instant::now() + timeout;

        let mutex = self
            .process_locks
            .entry(model_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let process = tokio::time::timeout_at(deadline, mutex.lock_owned())
            .await
            .map_err(|_| {
                ForgeError::ConflictOrBusy(format!(
                    "another training or update holds the lock for model {model_id}"
                ))
            })?;

        let lock_file = self.lock_path(model_id);
        if let Some(parent) = lock_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_file)
                .await
            {
                Ok(_) => {
                    debug!(model_id = %model_id, "advisory lock acquired");
                    return Ok(ModelLockGuard {
                        lock_file,
                        _process: process,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() + RETRY_INTERVAL > deadline {
                        return Err(ForgeError::ConflictOrBusy(format!(
                            "lock file for model {model_id} is held by another process"
                        )));
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn lock_file_exists(&self, model_id: ModelId) -> bool {
        self.lock_path(model_id).exists()
    }
}

/// Make sure a stale lock file from a crashed process does not exist.
pub async fn clear_stale_lock(root: &Path, model_id: ModelId) -> Result<()> {
    let path = root.join(model_id.to_string()).join(".lock");
    if tokio::fs::metadata(&path).await.is_ok() {
        warn!(model_id = %model_id, "removing stale lock file");
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn lock_round_trip_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockRegistry::new(dir.path());
        let id = Uuid::new_v4();

        let guard = locks.acquire(id, Duration::from_secs(1)).await.unwrap();
        assert!(locks.lock_file_exists(id));
        drop(guard);
        assert!(!locks.lock_file_exists(id));
    }

    #[tokio::test]
    async fn second_acquirer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockRegistry::new(dir.path());
        let id = Uuid::new_v4();

        let _held = locks.acquire(id, Duration::from_secs(1)).await.unwrap();
        let err = locks
            .acquire(id, Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::ConflictOrBusy(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn foreign_lock_file_blocks_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockRegistry::new(dir.path());
        let id = Uuid::new_v4();

        // Simulate another process's lock file.
        let path = dir.path().join(id.to_string());
        tokio::fs::create_dir_all(&path).await.unwrap();
        tokio::fs::write(path.join(".lock"), b"").await.unwrap();

        let err = locks
            .acquire(id, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::ConflictOrBusy(_)));

        clear_stale_lock(dir.path(), id).await.unwrap();
        let guard = locks.acquire(id, Duration::from_secs(1)).await.unwrap();
        drop(guard);
    }

    #[tokio::test]
    async fn sequential_acquisitions_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockRegistry::new(dir.path());
        let id = Uuid::new_v4();
        for _ in 0..3 {
            let guard = locks.acquire(id, Duration::from_secs(1)).await.unwrap();
            drop(guard);
        }
    }
}
