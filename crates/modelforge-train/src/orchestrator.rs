//! The training orchestrator: resolve a data provider, prepare tensors,
//! build and fit the network, evaluate, persist the version under the
//! advisory lock, and record it in the registry.

use crate::lock::LockRegistry;
use crate::version::next_training_version;
use modelforge_core::config::Settings;
use modelforge_core::{
    resolve_provider, DocumentStore, ForgeError, ModelId, ModelKind, ModelRecord, ModelStatus,
    Result, TrainingDataInfo,
};
use modelforge_nn::{build_spec, save_to_dir, ArchitectureOptions, FitConfig, FitReport, Network};
use modelforge_pool::ModelPool;
use modelforge_prep::{fit_transform, EmbeddingCache, PrepConfig, PreparedDataset, PREP_FILE};
use modelforge_registry::{classification_metrics, regression_metrics, ModelRegistry};
use modelforge_storage::StorageBackend;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Outcome of one completed training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainOutcome {
    pub model_id: ModelId,
    pub version: String,
    pub performance: HashMap<String, f64>,
    pub dataset_hash: String,
    pub record_count: usize,
    pub epochs_run: usize,
    pub final_loss: f64,
    pub warnings: Vec<String>,
}

pub struct TrainingOrchestrator {
    settings: Arc<Settings>,
    registry: Arc<ModelRegistry>,
    storage: Arc<dyn StorageBackend>,
    pool: Arc<ModelPool>,
    locks: Arc<LockRegistry>,
    documents: Arc<dyn DocumentStore>,
    embeddings: Arc<EmbeddingCache>,
    slots: Arc<Semaphore>,
    waiting: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicUsize,
}

fn param_u64(record: &ModelRecord, key: &str, default: u64) -> u64 {
    record
        .config
        .parameters
        .get(key)
        .and_then(|v| v.as_u64())
        .unwrap_or(default)
}

fn param_f64(record: &ModelRecord, key: &str, default: f64) -> f64 {
    record
        .config
        .parameters
        .get(key)
        .and_then(|v| v.as_f64())
        .unwrap_or(default)
}

impl TrainingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<ModelRegistry>,
        storage: Arc<dyn StorageBackend>,
        pool: Arc<ModelPool>,
        locks: Arc<LockRegistry>,
        documents: Arc<dyn DocumentStore>,
        embeddings: Arc<EmbeddingCache>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.training.max_concurrent.max(1)));
        Self {
            settings,
            registry,
            storage,
            pool,
            locks,
            documents,
            embeddings,
            slots,
            waiting: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    /// Run the full pipeline for a created model. Sets status to
    /// `training` for the duration, then `ready` or `error`.
    pub async fn train(&self, model_id: ModelId) -> Result<TrainOutcome> {
        if self.waiting.load(Ordering::Relaxed) >= self.settings.queue.max_pending {
            return Err(ForgeError::ResourceLimit(
                "training queue is full, retry later".into(),
            ));
        }

        self.waiting.fetch_add(1, Ordering::Relaxed);
        let permit = self.slots.clone().acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::Relaxed);
        let _permit = permit.map_err(|_| ForgeError::Training("training pool shut down".into()))?;

        self.active.fetch_add(1, Ordering::Relaxed);
        self.registry.update_with(model_id, |record| {
            record.status = ModelStatus::Training;
            record.last_error = None;
        })?;

        let outcome = self.run_pipeline(model_id).await;
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(outcome) => {
                info!(
                    model_id = %model_id,
                    version = %outcome.version,
                    records = outcome.record_count,
                    "training finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                error!(model_id = %model_id, error = %err, "training failed");
                let message = err.to_string();
                let _ = self.registry.update_with(model_id, |record| {
                    record.status = ModelStatus::Error;
                    record.last_error = Some(message.clone());
                });
                Err(err)
            }
        }
    }

    async fn run_pipeline(&self, model_id: ModelId) -> Result<TrainOutcome> {
        let record = self.registry.get(model_id)?;
        let data_info = record.training_data.clone().ok_or_else(|| {
            ForgeError::Validation(format!("model {model_id} has no training data source"))
        })?;

        let provider = resolve_provider(
            &data_info.source,
            &record.tenant_id,
            Arc::clone(&self.documents),
        )?;
        let limit = param_u64(
            &record,
            "train_limit",
            self.settings.training.train_limit as u64,
        ) as usize;
        let rows = provider
            .fetch(limit)
            .await
            .map_err(|e| ForgeError::Training(format!("data provider failed: {e}")))?;

        let seed = param_u64(&record, "seed", data_info.seed);
        let prep_config = PrepConfig {
            features: record.config.features.clone(),
            target: record.config.target.clone(),
            text_features: record.config.text_features.clone(),
            use_embeddings: record.config.use_embeddings,
            model_kind: record.kind,
            max_categorical: self.settings.prep.max_categorical,
            seed,
        };
        let prepared = fit_transform(&rows, &prep_config, Some(&self.embeddings)).await?;
        for warning in &prepared.warnings {
            warn!(model_id = %model_id, warning, "preparation warning");
        }

        let (mut network, fit_report) = self.build_and_fit(&record, &prepared, seed)?;
        let performance = self.evaluate(&record, &mut network, &prepared)?;

        let version = next_training_version(&record);
        let uri = self
            .persist_version(model_id, &version, &network, &prepared)
            .await?;

        self.registry.register_version(
            model_id,
            &version,
            performance.clone(),
            &uri,
            Some(serde_json::json!({
                "epochs_run": fit_report.epochs_run,
                "stopped_early": fit_report.stopped_early,
            })),
        )?;
        self.registry.update_with(model_id, |record| {
            record.status = ModelStatus::Ready;
            record.current_version = Some(version.clone());
            record.performance = performance.clone();
            record.training_data = Some(TrainingDataInfo {
                source: data_info.source.clone(),
                record_count: rows.len(),
                seed,
                dataset_hash: prepared.dataset_hash.clone(),
                epochs: fit_report.epochs_run,
            });
        })?;

        Ok(TrainOutcome {
            model_id,
            version,
            performance,
            dataset_hash: prepared.dataset_hash.clone(),
            record_count: rows.len(),
            epochs_run: fit_report.epochs_run,
            final_loss: fit_report.final_loss as f64,
            warnings: prepared.warnings.clone(),
        })
    }

    fn build_and_fit(
        &self,
        record: &ModelRecord,
        prepared: &PreparedDataset,
        seed: u64,
    ) -> Result<(Network, FitReport)> {
        let training = &self.settings.training;
        let options = ArchitectureOptions {
            learning_rate: param_f64(record, "learning_rate", training.learning_rate) as f32,
            optimizer: record
                .config
                .parameters
                .get("optimizer")
                .and_then(|v| v.as_str())
                .unwrap_or(&training.optimizer)
                .to_string(),
            hidden_units: param_u64(record, "hidden_units", training.hidden_units as u64) as usize,
            ..ArchitectureOptions::default()
        };

        let output_dim = prepared.metadata.label_dim.max(1);
        let spec = build_spec(
            record.config.algorithm,
            record.kind,
            prepared.input_dim(),
            output_dim,
            &options,
        )?;
        let mut network = Network::build(spec, seed)?;

        let fit_config = FitConfig {
            epochs: param_u64(record, "epochs", training.epochs as u64) as usize,
            batch_size: param_u64(record, "batch_size", training.batch_size as u64) as usize,
            patience: param_u64(record, "patience", 10) as usize,
            shuffle_seed: seed,
        };
        let report = network
            .fit(
                &prepared.x_train,
                &prepared.y_train,
                &prepared.x_validation,
                &prepared.y_validation,
                &fit_config,
            )
            .map_err(|e| ForgeError::Training(format!("fit failed: {e}")))?;
        Ok((network, report))
    }

    fn evaluate(
        &self,
        record: &ModelRecord,
        network: &mut Network,
        prepared: &PreparedDataset,
    ) -> Result<HashMap<String, f64>> {
        // Tiny datasets may have an empty validation split; score on train
        // in that case rather than reporting nothing.
        let (x, y) = if prepared.x_validation.nrows() > 0 {
            (&prepared.x_validation, &prepared.y_validation)
        } else {
            (&prepared.x_train, &prepared.y_train)
        };
        let predicted = network
            .predict(x)
            .map_err(|e| ForgeError::Training(format!("evaluation failed: {e}")))?;

        Ok(match record.kind {
            ModelKind::Regression => regression_metrics(&predicted, y).into_map(),
            _ => classification_metrics(&predicted, y).into_map(),
        })
    }

    /// Write manifest, shards and prep metadata to a staging directory,
    /// then publish under the advisory lock and drop stale pool entries.
    async fn persist_version(
        &self,
        model_id: ModelId,
        version: &str,
        network: &Network,
        prepared: &PreparedDataset,
    ) -> Result<String> {
        // Stage as a sibling of the final directory so the publishing
        // rename stays on one filesystem.
        let final_dir = self.storage.local_dir(model_id, version);
        let staging = final_dir.with_file_name(format!(".tmp-{version}"));
        if tokio::fs::metadata(&staging).await.is_ok() {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        save_to_dir(network, &staging).await?;
        tokio::fs::write(staging.join(PREP_FILE), prepared.metadata.to_json()?).await?;

        let timeout = Duration::from_secs(self.settings.training.lock_timeout_secs);
        let guard = self.locks.acquire(model_id, timeout).await?;
        let uri = self.storage.save(model_id, version, &staging).await?;
        self.pool.invalidate_model(model_id);
        drop(guard);

        if tokio::fs::metadata(&staging).await.is_ok() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }
        Ok(uri)
    }
}
