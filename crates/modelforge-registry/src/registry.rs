//! The model registry: tenant-scoped model records and their version
//! histories. Promotion, archival and rollback bookkeeping all go through
//! here; artifacts themselves are never touched.

use chrono::Utc;
use dashmap::DashMap;
use modelforge_core::{
    ForgeError, ModelId, ModelRecord, ModelVersionEntry, Result, VersionStage,
};
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

#[derive(Default)]
pub struct ModelRegistry {
    models: DashMap<ModelId, ModelRecord>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ModelRecord) -> ModelId {
        let id = record.id;
        self.models.insert(id, record);
        id
    }

    pub fn get(&self, model_id: ModelId) -> Result<ModelRecord> {
        self.models
            .get(&model_id)
            .map(|r| r.clone())
            .ok_or_else(|| ForgeError::NotFound(format!("model {model_id} not found")))
    }

    /// Tenant-checked lookup; foreign models read as not-found so tenancy
    /// is never leaked through error kinds.
    pub fn get_for_tenant(&self, model_id: ModelId, tenant_id: &str) -> Result<ModelRecord> {
        let record = self.get(model_id)?;
        if record.tenant_id != tenant_id {
            return Err(ForgeError::NotFound(format!("model {model_id} not found")));
        }
        Ok(record)
    }

    pub fn list_for_tenant(
        &self,
        tenant_id: &str,
        page: usize,
        per_page: usize,
    ) -> (Vec<ModelRecord>, usize) {
        let mut all: Vec<ModelRecord> = self
            .models
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .map(|r| r.clone())
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = all.len();
        let start = page.saturating_mul(per_page).min(total);
        let end = (start + per_page).min(total);
        (all[start..end].to_vec(), total)
    }

    pub fn remove(&self, model_id: ModelId) -> Result<ModelRecord> {
        self.models
            .remove(&model_id)
            .map(|(_, r)| r)
            .ok_or_else(|| ForgeError::NotFound(format!("model {model_id} not found")))
    }

    /// Apply a closure to a record under the map's per-key guard.
    pub fn update_with<F>(&self, model_id: ModelId, mutate: F) -> Result<ModelRecord>
    where
        F: FnOnce(&mut ModelRecord),
    {
        let mut entry = self
            .models
            .get_mut(&model_id)
            .ok_or_else(|| ForgeError::NotFound(format!("model {model_id} not found")))?;
        mutate(&mut entry);
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// Append a freshly-saved version with stage `development`.
    pub fn register_version(
        &self,
        model_id: ModelId,
        version: &str,
        performance: HashMap<String, f64>,
        storage_uri: &str,
        metadata: Option<Value>,
    ) -> Result<ModelVersionEntry> {
        let entry = ModelVersionEntry {
            version: version.to_string(),
            stage: VersionStage::Development,
            performance,
            storage_uri: storage_uri.to_string(),
            created_at: Utc::now(),
            promoted_at: None,
            metadata,
        };
        let stored = entry.clone();
        self.update_with(model_id, |record| {
            record.versions.push(entry);
        })?;
        info!(model_id = %model_id, version, "version registered");
        Ok(stored)
    }

    /// Move a version to a stage. Promoting to production archives the
    /// previous production version and updates the model's current version.
    pub fn promote(
        &self,
        model_id: ModelId,
        version: &str,
        to_stage: VersionStage,
    ) -> Result<ModelVersionEntry> {
        let mut promoted: Option<ModelVersionEntry> = None;
        self.update_with(model_id, |record| {
            if to_stage == VersionStage::Production {
                for existing in record.versions.iter_mut() {
                    if existing.stage == VersionStage::Production && existing.version != version {
                        existing.stage = VersionStage::Archived;
                    }
                }
            }
            if let Some(entry) = record.versions.iter_mut().find(|v| v.version == version) {
                entry.stage = to_stage;
                entry.promoted_at = Some(Utc::now());
                if to_stage == VersionStage::Production {
                    record.current_version = Some(version.to_string());
                    record.performance = entry.performance.clone();
                }
                promoted = Some(entry.clone());
            }
        })?;
        promoted.ok_or_else(|| {
            ForgeError::NotFound(format!("version {version} of model {model_id} not found"))
        })
    }

    /// Versions sorted by creation time descending, optionally filtered.
    pub fn list_versions(
        &self,
        model_id: ModelId,
        stage: Option<VersionStage>,
    ) -> Result<Vec<ModelVersionEntry>> {
        let record = self.get(model_id)?;
        let mut versions: Vec<ModelVersionEntry> = record
            .versions
            .into_iter()
            .filter(|v| stage.map(|s| v.stage == s).unwrap_or(true))
            .collect();
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(versions)
    }

    /// Highest-scoring version by a metric (default accuracy).
    pub fn best_version(&self, model_id: ModelId, metric: &str) -> Result<ModelVersionEntry> {
        let record = self.get(model_id)?;
        record
            .versions
            .iter()
            .filter(|v| v.performance.contains_key(metric))
            .max_by(|a, b| {
                let av = a.performance.get(metric).copied().unwrap_or(f64::MIN);
                let bv = b.performance.get(metric).copied().unwrap_or(f64::MIN);
                av.partial_cmp(&bv).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .ok_or_else(|| {
                ForgeError::NotFound(format!(
                    "no version of model {model_id} carries metric '{metric}'"
                ))
            })
    }

    /// Archive all but the `keep` most recent non-production versions.
    /// Idempotent: archived and production entries are never touched.
    pub fn archive_old_versions(&self, model_id: ModelId, keep: usize) -> Result<usize> {
        let mut archived = 0usize;
        self.update_with(model_id, |record| {
            let mut candidates: Vec<usize> = record
                .versions
                .iter()
                .enumerate()
                .filter(|(_, v)| {
                    v.stage != VersionStage::Production && v.stage != VersionStage::Archived
                })
                .map(|(i, _)| i)
                .collect();
            candidates.sort_by(|&a, &b| {
                record.versions[b]
                    .created_at
                    .cmp(&record.versions[a].created_at)
            });
            for &idx in candidates.iter().skip(keep) {
                record.versions[idx].stage = VersionStage::Archived;
                archived += 1;
            }
        })?;
        Ok(archived)
    }

    /// The production-eligible version preceding the given one by creation
    /// time. Used as the automatic rollback target.
    pub fn previous_version(&self, model_id: ModelId, current: &str) -> Result<ModelVersionEntry> {
        let record = self.get(model_id)?;
        let current_created = record
            .version(current)
            .map(|v| v.created_at)
            .ok_or_else(|| {
                ForgeError::NotFound(format!("version {current} of model {model_id} not found"))
            })?;
        record
            .versions
            .iter()
            .filter(|v| v.version != current && v.created_at < current_created)
            .max_by_key(|v| v.created_at)
            .cloned()
            .ok_or_else(|| {
                ForgeError::NotFound(format!("model {model_id} has no version before {current}"))
            })
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn status_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for record in self.models.iter() {
            let key = serde_json::to_value(record.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".into());
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelforge_core::{Algorithm, ModelConfig, ModelKind};

    fn sample_record(tenant: &str) -> ModelRecord {
        ModelRecord::new(
            tenant,
            "churn",
            ModelKind::Classification,
            ModelConfig {
                algorithm: Algorithm::DenseNn,
                parameters: HashMap::new(),
                features: vec!["age".into()],
                target: Some("churned".into()),
                text_features: vec![],
                use_embeddings: false,
                transformer: None,
            },
        )
    }

    fn registry_with_versions(count: usize) -> (ModelRegistry, ModelId) {
        let registry = ModelRegistry::new();
        let id = registry.insert(sample_record("t1"));
        for i in 0..count {
            let mut perf = HashMap::new();
            perf.insert("accuracy".into(), 0.5 + i as f64 * 0.1);
            registry
                .register_version(id, &format!("1.{i}.0"), perf, "file:///tmp/x", None)
                .unwrap();
            // Distinct creation instants keep ordering observable.
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        (registry, id)
    }

    #[test]
    fn tenant_isolation_reads_as_not_found() {
        let registry = ModelRegistry::new();
        let id = registry.insert(sample_record("t1"));
        assert!(registry.get_for_tenant(id, "t2").is_err());
        assert!(registry.get_for_tenant(id, "t1").is_ok());
    }

    #[test]
    fn promotion_to_production_archives_predecessor() {
        let (registry, id) = registry_with_versions(2);
        registry
            .promote(id, "1.0.0", VersionStage::Production)
            .unwrap();
        registry
            .promote(id, "1.1.0", VersionStage::Production)
            .unwrap();

        let record = registry.get(id).unwrap();
        assert_eq!(record.version("1.0.0").unwrap().stage, VersionStage::Archived);
        assert_eq!(
            record.version("1.1.0").unwrap().stage,
            VersionStage::Production
        );
        assert_eq!(record.current_version.as_deref(), Some("1.1.0"));
        // At most one production version.
        assert_eq!(
            record
                .versions
                .iter()
                .filter(|v| v.stage == VersionStage::Production)
                .count(),
            1
        );
    }

    #[test]
    fn best_version_picks_max_metric() {
        let (registry, id) = registry_with_versions(3);
        let best = registry.best_version(id, "accuracy").unwrap();
        assert_eq!(best.version, "1.2.0");
    }

    #[test]
    fn archive_is_idempotent_and_spares_production() {
        let (registry, id) = registry_with_versions(5);
        registry
            .promote(id, "1.0.0", VersionStage::Production)
            .unwrap();

        let first = registry.archive_old_versions(id, 2).unwrap();
        assert_eq!(first, 2);
        let second = registry.archive_old_versions(id, 2).unwrap();
        assert_eq!(second, 0);

        let record = registry.get(id).unwrap();
        assert_eq!(
            record.version("1.0.0").unwrap().stage,
            VersionStage::Production
        );
        let live = record
            .versions
            .iter()
            .filter(|v| v.stage != VersionStage::Archived && v.stage != VersionStage::Production)
            .count();
        assert_eq!(live, 2);
    }

    #[test]
    fn previous_version_walks_creation_time() {
        let (registry, id) = registry_with_versions(3);
        let previous = registry.previous_version(id, "1.2.0").unwrap();
        assert_eq!(previous.version, "1.1.0");
        assert!(registry.previous_version(id, "1.0.0").is_err());
    }

    #[test]
    fn list_versions_is_sorted_descending() {
        let (registry, id) = registry_with_versions(3);
        let versions = registry.list_versions(id, None).unwrap();
        assert_eq!(versions[0].version, "1.2.0");
        assert_eq!(versions[2].version, "1.0.0");
    }
}
