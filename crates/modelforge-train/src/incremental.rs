//! Incremental learning: buffer labeled feedback per model and fine-tune
//! the current version in place with a reduced learning rate. Preprocessing
//! metadata is frozen for the version, so categories and normalization are
//! replayed, never refit.

use crate::lock::LockRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use modelforge_core::config::Settings;
use modelforge_core::{ForgeError, ModelId, ModelKind, Result, Row};
use modelforge_nn::{save_to_dir, FitConfig};
use modelforge_pool::ModelPool;
use modelforge_prep::{
    encode_labels_with_metadata, transform_input, EmbeddingCache, PrepMetadata, PREP_FILE,
};
use modelforge_registry::{classification_metrics, regression_metrics, ModelRegistry};
use modelforge_storage::StorageBackend;
use ndarray::Array2;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One completed incremental update.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateRecord {
    pub samples_processed: usize,
    pub final_loss: f64,
    pub metrics: HashMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

/// Removes the in-flight marker when an update finishes, however it ends.
struct UpdatingGuard<'a> {
    learner: &'a IncrementalLearner,
    model_id: ModelId,
}

impl Drop for UpdatingGuard<'_> {
    fn drop(&mut self) {
        self.learner.updating.remove(&self.model_id);
    }
}

pub struct IncrementalLearner {
    settings: Arc<Settings>,
    registry: Arc<ModelRegistry>,
    storage: Arc<dyn StorageBackend>,
    pool: Arc<ModelPool>,
    locks: Arc<LockRegistry>,
    embeddings: Arc<EmbeddingCache>,
    buffers: DashMap<ModelId, Vec<Row>>,
    updating: DashMap<ModelId, ()>,
    history: DashMap<ModelId, Vec<UpdateRecord>>,
}

impl IncrementalLearner {
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<ModelRegistry>,
        storage: Arc<dyn StorageBackend>,
        pool: Arc<ModelPool>,
        locks: Arc<LockRegistry>,
        embeddings: Arc<EmbeddingCache>,
    ) -> Self {
        Self {
            settings,
            registry,
            storage,
            pool,
            locks,
            embeddings,
            buffers: DashMap::new(),
            updating: DashMap::new(),
            history: DashMap::new(),
        }
    }

    pub fn buffered_count(&self, model_id: ModelId) -> usize {
        self.buffers.get(&model_id).map(|b| b.len()).unwrap_or(0)
    }

    pub fn history(&self, model_id: ModelId) -> Vec<UpdateRecord> {
        self.history
            .get(&model_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Append a labeled sample. When the buffer reaches the update
    /// frequency and no update is in flight, an update runs and the buffer
    /// is cleared on success.
    pub async fn add_sample(&self, model_id: ModelId, row: Row) -> Result<Option<UpdateRecord>> {
        let should_update = {
            let mut buffer = self.buffers.entry(model_id).or_default();
            if buffer.len() >= self.settings.incremental.max_buffer_size {
                // Ring semantics: oldest sample makes room.
                buffer.remove(0);
            }
            buffer.push(row);
            buffer.len() >= self.settings.incremental.update_frequency
                && !self.updating.contains_key(&model_id)
        };

        if !should_update {
            return Ok(None);
        }
        self.trigger_update(model_id).await
    }

    /// Run an update now regardless of buffer depth. Returns `Ok(None)`
    /// when an update is already in flight or there is nothing buffered.
    pub async fn force_update(&self, model_id: ModelId) -> Result<Option<UpdateRecord>> {
        self.trigger_update(model_id).await
    }

    async fn trigger_update(&self, model_id: ModelId) -> Result<Option<UpdateRecord>> {
        if self.updating.insert(model_id, ()).is_some() {
            debug!(model_id = %model_id, "update already in flight");
            return Ok(None);
        }
        let guard = UpdatingGuard {
            learner: self,
            model_id,
        };

        let samples = self
            .buffers
            .get(&model_id)
            .map(|b| b.clone())
            .unwrap_or_default();
        if samples.is_empty() {
            debug!(model_id = %model_id, "no buffered samples to learn from");
            return Ok(None);
        }

        let record = self.run_update(model_id, &samples).await?;

        // Clear only what was processed; samples that arrived mid-update
        // stay buffered for the next round.
        if let Some(mut buffer) = self.buffers.get_mut(&model_id) {
            let n = samples.len().min(buffer.len());
            buffer.drain(..n);
        }
        let mut history = self.history.entry(model_id).or_default();
        history.push(record.clone());
        let cap = self.settings.incremental.history_max;
        if history.len() > cap {
            let excess = history.len() - cap;
            history.drain(..excess);
        }
        drop(history);
        drop(guard);

        Ok(Some(record))
    }

    async fn run_update(&self, model_id: ModelId, samples: &[Row]) -> Result<UpdateRecord> {
        let record = self.registry.get(model_id)?;
        let version = record.current_version.clone().ok_or_else(|| {
            ForgeError::Validation(format!("model {model_id} has no trained version"))
        })?;

        let dir = self.storage.fetch(model_id, &version).await?;
        let metadata = PrepMetadata::from_json(
            &tokio::fs::read_to_string(dir.join(PREP_FILE))
                .await
                .map_err(|_| {
                    ForgeError::Storage(format!(
                        "version {version} of model {model_id} has no preprocessing metadata"
                    ))
                })?,
        )?;

        // Replay preprocessing with frozen categories and normalization.
        let width = metadata.input_dim();
        let mut x = Array2::zeros((samples.len(), width));
        for (i, row) in samples.iter().enumerate() {
            let vector = transform_input(row, &metadata, Some(&self.embeddings)).await;
            for (c, v) in vector.iter().enumerate() {
                x[[i, c]] = *v;
            }
        }
        let y = encode_labels_with_metadata(samples, &metadata).map_err(ForgeError::from)?;

        // Hold out the trailing fraction for evaluation.
        let holdout = ((samples.len() as f64 * self.settings.incremental.holdout) as usize)
            .min(samples.len().saturating_sub(1));
        let fit_rows = samples.len() - holdout;
        let x_fit = x.slice(ndarray::s![..fit_rows, ..]).to_owned();
        let y_fit = y.slice(ndarray::s![..fit_rows, ..]).to_owned();
        let x_hold = x.slice(ndarray::s![fit_rows.., ..]).to_owned();
        let y_hold = y.slice(ndarray::s![fit_rows.., ..]).to_owned();

        let mut network = modelforge_nn::load_from_dir(&dir).await?;
        network.set_learning_rate(self.settings.incremental.learning_rate as f32);
        let fit_config = FitConfig {
            epochs: self.settings.incremental.epochs.clamp(1, 5),
            batch_size: self.settings.training.batch_size.min(fit_rows.max(1)),
            patience: usize::MAX,
            shuffle_seed: record.training_data.as_ref().map(|d| d.seed).unwrap_or(42),
        };
        let report = network
            .fit(
                &x_fit,
                &y_fit,
                &Array2::zeros((0, width)),
                &Array2::zeros((0, y.ncols())),
                &fit_config,
            )
            .map_err(|e| ForgeError::Training(format!("incremental fit failed: {e}")))?;

        let metrics = if x_hold.nrows() > 0 {
            let predicted = network
                .predict(&x_hold)
                .map_err(|e| ForgeError::Training(e.to_string()))?;
            match record.kind {
                ModelKind::Regression => regression_metrics(&predicted, &y_hold).into_map(),
                _ => classification_metrics(&predicted, &y_hold).into_map(),
            }
        } else {
            HashMap::new()
        };

        // Re-save in place under the advisory lock, then invalidate pooled
        // copies so readers pick up the new weights.
        let timeout = Duration::from_secs(self.settings.training.lock_timeout_secs);
        let lock = self.locks.acquire(model_id, timeout).await?;
        save_to_dir(&network, &dir).await?;
        self.storage.save(model_id, &version, &dir).await?;
        self.pool.invalidate_model(model_id);
        drop(lock);

        let metrics_for_registry = metrics.clone();
        let version_for_registry = version.clone();
        self.registry.update_with(model_id, move |record| {
            if !metrics_for_registry.is_empty() {
                record.performance = metrics_for_registry.clone();
                if let Some(entry) = record
                    .versions
                    .iter_mut()
                    .find(|v| v.version == version_for_registry)
                {
                    entry.performance = metrics_for_registry;
                }
            }
        })?;

        if !metrics.is_empty() {
            info!(
                model_id = %model_id,
                version = %version,
                samples = samples.len(),
                "incremental update applied"
            );
        } else {
            warn!(model_id = %model_id, "incremental update ran without holdout metrics");
        }

        Ok(UpdateRecord {
            samples_processed: samples.len(),
            final_loss: report.final_loss as f64,
            metrics,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::TrainingOrchestrator;
    use modelforge_core::{
        Algorithm, DocumentStore, FeatureValue, MemoryDocumentStore, ModelConfig, ModelRecord,
        TrainingDataInfo,
    };

    async fn trained_harness(
        root: &std::path::Path,
    ) -> (IncrementalLearner, Arc<ModelRegistry>, ModelId) {
        let mut settings = Settings::default();
        settings.training.epochs = 20;
        settings.training.learning_rate = 0.01;
        settings.incremental.update_frequency = 4;
        settings.incremental.epochs = 2;
        let settings = Arc::new(settings);

        let registry = Arc::new(ModelRegistry::new());
        let storage: Arc<dyn StorageBackend> =
            Arc::new(modelforge_storage::LocalBackend::new(root));
        let pool = Arc::new(ModelPool::new(settings.pool.clone(), None));
        let locks = Arc::new(LockRegistry::new(root));
        let documents = Arc::new(MemoryDocumentStore::new());
        let embeddings = Arc::new(EmbeddingCache::new(None, 64));

        let rows: Vec<Row> = (0..30)
            .map(|i| {
                let mut row = Row::new();
                row.insert("x".into(), FeatureValue::Number((i % 10) as f64));
                row.insert("y".into(), FeatureValue::Number((i % 7) as f64));
                row.insert("label".into(), FeatureValue::Number((i % 2) as f64));
                row
            })
            .collect();
        documents.insert_rows("t1", "events", rows);

        let mut record = ModelRecord::new(
            "t1",
            "binary",
            ModelKind::Classification,
            ModelConfig {
                algorithm: Algorithm::DenseNn,
                parameters: HashMap::new(),
                features: vec!["x".into(), "y".into()],
                target: Some("label".into()),
                text_features: vec![],
                use_embeddings: false,
                transformer: None,
            },
        );
        record.training_data = Some(TrainingDataInfo {
            source: "events".into(),
            record_count: 0,
            seed: 42,
            dataset_hash: String::new(),
            epochs: 0,
        });
        let model_id = registry.insert(record);

        let orchestrator = TrainingOrchestrator::new(
            Arc::clone(&settings),
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&pool),
            Arc::new(LockRegistry::new(root)),
            documents.clone() as Arc<dyn DocumentStore>,
            Arc::clone(&embeddings),
        );
        orchestrator.train(model_id).await.unwrap();

        let learner = IncrementalLearner::new(
            settings, registry.clone(), storage, pool, locks, embeddings,
        );
        (learner, registry, model_id)
    }

    fn feedback_row(x: f64, y: f64, label: f64) -> Row {
        let mut row = Row::new();
        row.insert("x".into(), FeatureValue::Number(x));
        row.insert("y".into(), FeatureValue::Number(y));
        row.insert("label".into(), FeatureValue::Number(label));
        row
    }

    #[tokio::test]
    async fn buffer_triggers_update_at_frequency() {
        let root = tempfile::tempdir().unwrap();
        let (learner, _registry, model_id) = trained_harness(root.path()).await;

        for i in 0..3 {
            let done = learner
                .add_sample(model_id, feedback_row(i as f64, 1.0, (i % 2) as f64))
                .await
                .unwrap();
            assert!(done.is_none());
        }
        let record = learner
            .add_sample(model_id, feedback_row(3.0, 1.0, 1.0))
            .await
            .unwrap()
            .expect("fourth sample triggers the update");
        assert_eq!(record.samples_processed, 4);
        assert_eq!(learner.buffered_count(model_id), 0);
        assert_eq!(learner.history(model_id).len(), 1);
    }

    #[tokio::test]
    async fn force_update_with_empty_buffer_is_a_noop() {
        let root = tempfile::tempdir().unwrap();
        let (learner, _registry, model_id) = trained_harness(root.path()).await;
        assert!(learner.force_update(model_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn force_update_processes_a_partial_buffer() {
        let root = tempfile::tempdir().unwrap();
        let (learner, registry, model_id) = trained_harness(root.path()).await;

        learner
            .add_sample(model_id, feedback_row(1.0, 2.0, 0.0))
            .await
            .unwrap();
        learner
            .add_sample(model_id, feedback_row(2.0, 3.0, 1.0))
            .await
            .unwrap();
        let record = learner
            .force_update(model_id)
            .await
            .unwrap()
            .expect("update runs with a partial buffer");
        assert_eq!(record.samples_processed, 2);

        // The version string is unchanged; the update is in place.
        let model = registry.get(model_id).unwrap();
        assert_eq!(model.current_version.as_deref(), Some("1.0.0"));
        assert_eq!(model.versions.len(), 1);
    }

    #[tokio::test]
    async fn update_on_untrained_model_fails() {
        let root = tempfile::tempdir().unwrap();
        let (learner, registry, _trained) = trained_harness(root.path()).await;

        let untrained = registry.insert(ModelRecord::new(
            "t1",
            "fresh",
            ModelKind::Classification,
            ModelConfig {
                algorithm: Algorithm::DenseNn,
                parameters: HashMap::new(),
                features: vec!["x".into()],
                target: Some("label".into()),
                text_features: vec![],
                use_embeddings: false,
                transformer: None,
            },
        ));
        learner
            .add_sample(untrained, feedback_row(1.0, 1.0, 0.0))
            .await
            .unwrap();
        let err = learner.force_update(untrained).await.unwrap_err();
        assert!(matches!(err, ForgeError::Validation(_)));
    }
}
