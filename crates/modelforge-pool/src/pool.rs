//! In-memory pool of compiled networks keyed by `(model, version)`.
//!
//! A lease moves the network out of its slot for exclusive use and returns
//! it on release. Loads are single-flight per key: a per-key async mutex
//! serializes loaders, and anyone who was waiting re-checks the pool before
//! loading so at most one loader runs for a key at any moment.

use crate::disk::DiskCache;
use dashmap::DashMap;
use modelforge_core::config::PoolSettings;
use modelforge_core::{ForgeError, ModelId, Result};
use modelforge_nn::Network;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub type PoolKey = (ModelId, String);

struct PoolSlot {
    id: u64,
    /// `None` while leased out.
    network: Option<Network>,
    last_used: Instant,
    usage_count: u64,
}

/// Exclusive use of one pooled network. Return it with
/// [`ModelPool::release`]; dropping a lease without releasing discards the
/// entry, which is safe but wastes the warm copy.
pub struct ModelLease {
    pub key: PoolKey,
    slot_id: u64,
    pub network: Network,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub keys: usize,
    pub entries: usize,
    pub leased: usize,
    pub hits: u64,
    pub misses: u64,
    pub disk_hits: u64,
}

pub struct ModelPool {
    config: PoolSettings,
    pools: DashMap<PoolKey, Vec<PoolSlot>>,
    load_guards: DashMap<PoolKey, Arc<Mutex<()>>>,
    disk: Option<DiskCache>,
    next_slot_id: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    disk_hits: AtomicU64,
}

impl ModelPool {
    pub fn new(config: PoolSettings, disk: Option<DiskCache>) -> Self {
        Self {
            config,
            pools: DashMap::new(),
            load_guards: DashMap::new(),
            disk,
            next_slot_id: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
        }
    }

    /// Borrow a network for the key, loading on miss.
    ///
    /// The loader returns the network together with the local directory its
    /// artifacts were read from, so the disk layer can retain a copy.
    pub async fn acquire<F, Fut>(&self, key: PoolKey, loader: F) -> Result<ModelLease>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Network, PathBuf)>>,
    {
        if let Some(lease) = self.try_take_idle(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(lease);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let guard = self
            .load_guards
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = guard.lock().await;

        // A concurrent loader may have finished while we waited.
        if let Some(lease) = self.try_take_idle(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(lease);
        }

        if let Some(disk) = &self.disk {
            if let Some(dir) = disk.load(key.0, &key.1).await {
                match modelforge_nn::load_from_dir(&dir).await {
                    Ok(network) => {
                        self.disk_hits.fetch_add(1, Ordering::Relaxed);
                        debug!(model_id = %key.0, version = %key.1, "loaded from disk cache");
                        return Ok(self.lease_new(key, network));
                    }
                    Err(err) => {
                        debug!(model_id = %key.0, version = %key.1, error = %err, "disk cache load failed")
                    }
                }
            }
        }

        let (network, source_dir) = loader().await?;
        if let Some(disk) = &self.disk {
            if let Err(err) = disk.store(key.0, &key.1, &source_dir).await {
                debug!(model_id = %key.0, version = %key.1, error = %err, "disk cache store failed");
            }
        }
        info!(model_id = %key.0, version = %key.1, "model loaded into pool");
        Ok(self.lease_new(key, network))
    }

    /// Return a leased network to its slot.
    pub fn release(&self, lease: ModelLease) {
        let mut slots = self.pools.entry(lease.key.clone()).or_default();
        if let Some(slot) = slots.iter_mut().find(|s| s.id == lease.slot_id) {
            slot.network = Some(lease.network);
            slot.last_used = Instant::now();
        } else {
            // Slot was pruned while leased; re-insert as a fresh entry.
            let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
            slots.push(PoolSlot {
                id,
                network: Some(lease.network),
                last_used: Instant::now(),
                usage_count: 1,
            });
            self.trim_to_capacity(&mut slots);
        }
    }

    /// Drop every entry for a model, across versions. Leased entries are
    /// discarded on release because their slots are gone.
    pub fn invalidate_model(&self, model_id: ModelId) {
        let keys: Vec<PoolKey> = self
            .pools
            .iter()
            .map(|e| e.key().clone())
            .filter(|(id, _)| *id == model_id)
            .collect();
        for key in &keys {
            self.pools.remove(key);
            self.load_guards.remove(key);
        }
        if !keys.is_empty() {
            info!(model_id = %model_id, versions = keys.len(), "pool entries invalidated");
        }
    }

    pub async fn invalidate_model_with_disk(&self, model_id: ModelId) {
        self.invalidate_model(model_id);
        if let Some(disk) = &self.disk {
            let _ = disk.remove_model(model_id).await;
        }
    }

    /// One sweep: dispose idle entries past `max_idle`, never below the
    /// configured per-key floor and never entries currently leased.
    pub fn sweep(&self) {
        let max_idle = Duration::from_secs(self.config.max_idle_secs);
        let floor = self.config.min_pool_size;
        for mut entry in self.pools.iter_mut() {
            let key = entry.key().clone();
            let slots = entry.value_mut();
            let mut removable: Vec<u64> = slots
                .iter()
                .filter(|s| s.network.is_some() && s.last_used.elapsed() > max_idle)
                .map(|s| s.id)
                .collect();
            let keep_at_least = floor.min(slots.len());
            let over = slots.len().saturating_sub(keep_at_least);
            removable.truncate(over);
            if !removable.is_empty() {
                debug!(key = ?key, disposed = removable.len(), "idle sweep");
                slots.retain(|s| !removable.contains(&s.id));
            }
        }
    }

    /// Periodic sweeper task.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = Duration::from_secs(pool.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.sweep();
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        let mut entries = 0usize;
        let mut leased = 0usize;
        for pool in self.pools.iter() {
            for slot in pool.value() {
                entries += 1;
                if slot.network.is_none() {
                    leased += 1;
                }
            }
        }
        PoolStats {
            keys: self.pools.len(),
            entries,
            leased,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
        }
    }

    pub fn disk_stats(&self) -> Option<crate::disk::DiskCacheStats> {
        self.disk.as_ref().map(|d| d.stats())
    }

    fn try_take_idle(&self, key: &PoolKey) -> Option<ModelLease> {
        let mut slots = self.pools.get_mut(key)?;
        let slot = slots.iter_mut().find(|s| s.network.is_some())?;
        slot.usage_count += 1;
        slot.last_used = Instant::now();
        Some(ModelLease {
            key: key.clone(),
            slot_id: slot.id,
            network: slot.network.take().expect("idle slot has a network"),
        })
    }

    fn lease_new(&self, key: PoolKey, network: Network) -> ModelLease {
        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.pools.entry(key.clone()).or_default();
        self.trim_to_capacity(&mut slots);
        slots.push(PoolSlot {
            id,
            network: None,
            last_used: Instant::now(),
            usage_count: 1,
        });
        ModelLease {
            key,
            slot_id: id,
            network,
        }
    }

    /// Evict the oldest idle entry when a key's pool is at capacity.
    fn trim_to_capacity(&self, slots: &mut Vec<PoolSlot>) {
        while slots.len() >= self.config.max_pool_size.max(1) {
            let victim = slots
                .iter()
                .filter(|s| s.network.is_some())
                .min_by_key(|s| s.last_used)
                .map(|s| s.id);
            match victim {
                Some(id) => slots.retain(|s| s.id != id),
                None => break,
            }
        }
    }
}

/// Convenience wrapper shared by the serving and training paths.
pub async fn acquire_from_storage(
    pool: &ModelPool,
    storage: &dyn modelforge_storage::StorageBackend,
    model_id: ModelId,
    version: &str,
) -> Result<ModelLease> {
    pool.acquire((model_id, version.to_string()), || async {
        let dir = storage.fetch(model_id, version).await?;
        let network = modelforge_nn::load_from_dir(&dir)
            .await
            .map_err(ForgeError::from)?;
        Ok((network, dir))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelforge_nn::{Activation, LayerSpec, Loss, NetworkSpec, OptimizerSpec};
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn settings() -> PoolSettings {
        PoolSettings {
            max_pool_size: 2,
            min_pool_size: 1,
            max_idle_secs: 0,
            sweep_interval_secs: 60,
            disk_dir: String::new(),
            disk_max_bytes: 0,
            disk_ttl_days: 7,
        }
    }

    fn tiny_network() -> Network {
        Network::build(
            NetworkSpec {
                input_dim: 2,
                layers: vec![LayerSpec::Dense {
                    units: 1,
                    activation: Activation::Linear,
                }],
                loss: Loss::MeanSquaredError,
                optimizer: OptimizerSpec::Sgd { learning_rate: 0.1 },
            },
            1,
        )
        .unwrap()
    }

    fn key() -> PoolKey {
        (Uuid::new_v4(), "1.0.0".to_string())
    }

    #[tokio::test]
    async fn acquire_release_acquire_reuses_the_entry() {
        let pool = ModelPool::new(settings(), None);
        let k = key();

        let lease = pool
            .acquire(k.clone(), || async {
                Ok((tiny_network(), PathBuf::from("/nowhere")))
            })
            .await
            .unwrap();
        pool.release(lease);

        let loads = AtomicUsize::new(0);
        let lease = pool
            .acquire(k.clone(), || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok((tiny_network(), PathBuf::from("/nowhere")))
            })
            .await
            .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 0, "hit must not reload");
        pool.release(lease);
        assert_eq!(pool.stats().hits, 1);
    }

    #[tokio::test]
    async fn concurrent_first_loads_are_serialized() {
        let pool = Arc::new(ModelPool::new(settings(), None));
        let k = key();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let k = k.clone();
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let lease = pool
                    .acquire(k, || async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok((tiny_network(), PathBuf::from("/nowhere")))
                    })
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                pool.release(lease);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1, "one loader per key at a time");
    }

    #[tokio::test]
    async fn invalidate_drops_all_versions_of_a_model() {
        let pool = ModelPool::new(settings(), None);
        let model = Uuid::new_v4();
        for version in ["1.0.0", "1.1.0"] {
            let lease = pool
                .acquire((model, version.to_string()), || async {
                    Ok((tiny_network(), PathBuf::from("/nowhere")))
                })
                .await
                .unwrap();
            pool.release(lease);
        }
        assert_eq!(pool.stats().keys, 2);
        pool.invalidate_model(model);
        assert_eq!(pool.stats().keys, 0);
    }

    #[tokio::test]
    async fn sweep_respects_min_pool_size_and_leases() {
        let pool = ModelPool::new(settings(), None);
        let k = key();

        let first = pool
            .acquire(k.clone(), || async {
                Ok((tiny_network(), PathBuf::from("/nowhere")))
            })
            .await
            .unwrap();
        let second = pool
            .acquire(k.clone(), || async {
                Ok((tiny_network(), PathBuf::from("/nowhere")))
            })
            .await
            .unwrap();
        pool.release(first);
        pool.release(second);
        assert_eq!(pool.stats().entries, 2);

        // max_idle_secs is zero, so everything idle is eligible; the floor
        // keeps one.
        pool.sweep();
        assert_eq!(pool.stats().entries, 1);

        let lease = pool
            .acquire(k.clone(), || async {
                Ok((tiny_network(), PathBuf::from("/nowhere")))
            })
            .await
            .unwrap();
        pool.sweep();
        // The leased entry survives the sweep.
        assert_eq!(pool.stats().entries, 1);
        pool.release(lease);
    }
}
