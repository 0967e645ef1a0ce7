//! Bounded in-memory embedding cache fronting the configured provider.
//!
//! Keys are `(feature, value)` pairs so two features embedding the same
//! string stay independent. Training warms the cache through
//! [`EmbeddingCache::warmup`]; inference consults it for unseen values.

use dashmap::DashMap;
use modelforge_core::{EmbeddingProvider, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub dimension: usize,
    pub capacity: usize,
}

pub struct EmbeddingCache {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    entries: DashMap<(String, String), Vec<f32>>,
    hits: AtomicU64,
    misses: AtomicU64,
    capacity: usize,
}

impl EmbeddingCache {
    pub fn new(provider: Option<Arc<dyn EmbeddingProvider>>, capacity: usize) -> Self {
        Self {
            provider,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    pub fn dimension(&self) -> usize {
        self.provider.as_ref().map(|p| p.dimension()).unwrap_or(0)
    }

    /// Cached vector for a value, generating through the provider on miss.
    /// Returns `None` when no provider is configured or the provider fails;
    /// callers degrade to the scalar fallback in that case.
    pub async fn get_or_embed(&self, feature: &str, value: &str) -> Option<Vec<f32>> {
        let key = (feature.to_string(), value.to_string());
        if let Some(hit) = self.entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let provider = self.provider.as_ref()?;
        match provider.embed(std::slice::from_ref(&key.1)).await {
            Ok(mut vectors) if !vectors.is_empty() => {
                let vector = vectors.remove(0);
                self.insert_bounded(key, vector.clone());
                Some(vector)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(%feature, error = %err, "embedding provider failed");
                None
            }
        }
    }

    /// Batch-generate embeddings for a feature's values. Returns how many
    /// values now have a cached vector.
    pub async fn warmup(&self, feature: &str, values: &[String]) -> Result<usize> {
        let Some(provider) = self.provider.as_ref() else {
            return Ok(0);
        };
        let pending: Vec<String> = values
            .iter()
            .filter(|v| {
                !self
                    .entries
                    .contains_key(&(feature.to_string(), (*v).clone()))
            })
            .cloned()
            .collect();
        if !pending.is_empty() {
            let vectors = provider.embed(&pending).await?;
            for (value, vector) in pending.into_iter().zip(vectors) {
                self.insert_bounded((feature.to_string(), value), vector);
            }
        }
        Ok(values
            .iter()
            .filter(|v| {
                self.entries
                    .contains_key(&(feature.to_string(), (*v).clone()))
            })
            .count())
    }

    pub fn lookup(&self, feature: &str, value: &str) -> Option<Vec<f32>> {
        self.entries
            .get(&(feature.to_string(), value.to_string()))
            .map(|v| v.clone())
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        EmbeddingCacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            dimension: self.dimension(),
            capacity: self.capacity,
        }
    }

    fn insert_bounded(&self, key: (String, String), vector: Vec<f32>) {
        // Capacity is a soft bound; dropping an arbitrary entry is fine
        // since anything evicted can be regenerated from the provider.
        if self.entries.len() >= self.capacity {
            if let Some(victim) = self.entries.iter().next().map(|e| e.key().clone()) {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(key, vector);
    }
}
