//! Provider seams: training data sources and embedding backends.

use crate::error::{ForgeError, Result};
use crate::types::Row;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Backing document database, supplied by the host application.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch up to `limit` rows from a tenant-scoped collection.
    async fn fetch_collection(
        &self,
        tenant_id: &str,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<Row>>;
}

/// A resolved source of training rows.
#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn fetch(&self, limit: usize) -> Result<Vec<Row>>;
    fn source(&self) -> &str;
}

impl std::fmt::Debug for dyn DataProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProvider").field("source", &self.source()).finish()
    }
}

/// Document-store collection provider: the default for plain-name sources.
pub struct DocumentProvider {
    store: Arc<dyn DocumentStore>,
    tenant_id: String,
    collection: String,
}

#[async_trait]
impl DataProvider for DocumentProvider {
    async fn fetch(&self, limit: usize) -> Result<Vec<Row>> {
        self.store
            .fetch_collection(&self.tenant_id, &self.collection, limit)
            .await
    }

    fn source(&self) -> &str {
        &self.collection
    }
}

/// Resolve a source string to a provider.
///
/// Plain names map to document-store collections. URL schemes are reserved
/// for CSV/Parquet providers and rejected until those exist.
pub fn resolve_provider(
    source: &str,
    tenant_id: &str,
    store: Arc<dyn DocumentStore>,
) -> Result<Box<dyn DataProvider>> {
    if source.contains("://") {
        return Err(ForgeError::Validation(format!(
            "url data providers are reserved, cannot resolve '{source}'"
        )));
    }
    if source.trim().is_empty() {
        return Err(ForgeError::Validation("empty data source".into()));
    }
    Ok(Box::new(DocumentProvider {
        store,
        tenant_id: tenant_id.to_string(),
        collection: source.to_string(),
    }))
}

/// Text embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// In-memory document store, used in tests and as the default wiring when no
/// external database is attached.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: DashMap<(String, String), Vec<Row>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_rows(&self, tenant_id: &str, collection: &str, rows: Vec<Row>) {
        self.collections
            .entry((tenant_id.to_string(), collection.to_string()))
            .or_default()
            .extend(rows);
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn fetch_collection(
        &self,
        tenant_id: &str,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let key = (tenant_id.to_string(), collection.to_string());
        let rows = self
            .collections
            .get(&key)
            .map(|r| r.iter().take(limit).cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        if rows.is_empty() {
            return Err(ForgeError::Training(format!(
                "collection '{collection}' has no rows for tenant '{tenant_id}'"
            )));
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeatureValue;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn url_sources_are_rejected() {
        let store = Arc::new(MemoryDocumentStore::new());
        let err = resolve_provider("s3://bucket/data.csv", "t1", store).unwrap_err();
        assert!(matches!(err, ForgeError::Validation(_)));
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut row: Row = BTreeMap::new();
        row.insert("x".into(), FeatureValue::Number(1.0));
        store.insert_rows("t1", "events", vec![row]);

        let provider = resolve_provider("events", "t1", store).unwrap();
        let rows = provider.fetch(10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
