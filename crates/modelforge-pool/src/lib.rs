//! Model pooling for Modelforge: a bounded in-memory pool of compiled
//! networks with single-flight loading and an idle sweeper, backed by a
//! byte-capped on-disk cache of version artifacts.

pub mod disk;
pub mod pool;

pub use disk::{DiskCache, DiskCacheStats};
pub use pool::{acquire_from_storage, ModelLease, ModelPool, PoolKey, PoolStats};
