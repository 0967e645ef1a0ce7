//! The prediction path: resolve the effective version, replay preprocessing
//! from the version's metadata, borrow a pooled network, and shape the
//! response per model kind, all inside the SLA budget.

use crate::history::PredictionLog;
use crate::transformer::TransformerRegistry;
use chrono::Utc;
use modelforge_core::config::Settings;
use modelforge_core::{
    FeatureValue, ForgeError, ModelId, ModelKind, ModelRecord, ModelStatus, PredictionFeedback,
    PredictionId, PredictionOutput, PredictionRecord, Result, Row, VersionStage,
};
use modelforge_pool::{acquire_from_storage, ModelPool};
use modelforge_prep::{transform_input, EmbeddingCache, PrepMetadata, PREP_FILE};
use modelforge_registry::{AbCoordinator, ModelRegistry};
use modelforge_storage::StorageBackend;
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct PredictOptions {
    pub version: Option<String>,
    pub stage: Option<VersionStage>,
    pub ab_test_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItem {
    Success {
        index: usize,
        output: PredictionOutput,
    },
    Failed {
        index: usize,
        error: String,
    },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchOutcome {
    pub version: String,
    pub items: Vec<BatchItem>,
    pub success_count: usize,
    pub error_count: usize,
}

pub struct PredictionService {
    settings: Arc<Settings>,
    registry: Arc<ModelRegistry>,
    storage: Arc<dyn StorageBackend>,
    pool: Arc<ModelPool>,
    embeddings: Arc<EmbeddingCache>,
    log: Arc<PredictionLog>,
    ab: Arc<AbCoordinator>,
    transformers: Arc<TransformerRegistry>,
}

impl PredictionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<ModelRegistry>,
        storage: Arc<dyn StorageBackend>,
        pool: Arc<ModelPool>,
        embeddings: Arc<EmbeddingCache>,
        log: Arc<PredictionLog>,
        ab: Arc<AbCoordinator>,
        transformers: Arc<TransformerRegistry>,
    ) -> Self {
        Self {
            settings,
            registry,
            storage,
            pool,
            embeddings,
            log,
            ab,
            transformers,
        }
    }

    pub fn log(&self) -> &Arc<PredictionLog> {
        &self.log
    }

    /// Single prediction under the SLA budget.
    pub async fn predict(
        &self,
        model_id: ModelId,
        tenant_id: &str,
        input: Row,
        options: &PredictOptions,
    ) -> Result<PredictionRecord> {
        let started = Instant::now();
        let record = self.registry.get_for_tenant(model_id, tenant_id)?;
        ensure_servable(&record)?;
        let version = self.resolve_version(&record, options)?;
        let input = self.apply_transformer(&record, input)?;
        validate_input(&input, &record)?;

        let work = self.infer_one(&record, &version, &input);
        let output = match tokio::time::timeout(self.settings.prediction.timeout(), work).await {
            Err(_) => {
                return Err(ForgeError::Timeout(format!(
                    "prediction exceeded the {}s budget",
                    self.settings.prediction.timeout_secs
                )))
            }
            Ok(Ok(output)) => output,
            Ok(Err(err)) if self.settings.prediction.mock_fallback => {
                warn!(model_id = %model_id, error = %err, "inference failed, serving mock response");
                mock_output(&record)
            }
            Ok(Err(err)) => return Err(err),
        };

        let prediction = PredictionRecord {
            id: Uuid::new_v4(),
            model_id,
            version,
            input,
            output,
            processing_ms: started.elapsed().as_millis() as u64,
            created_at: Utc::now(),
            feedback: None,
        };
        // Recording is best-effort and never blocks the response.
        self.log.record(prediction.clone());
        Ok(prediction)
    }

    /// Batch prediction: one stacked forward pass, per-row error entries
    /// for inputs whose validation or transform failed.
    pub async fn predict_batch(
        &self,
        model_id: ModelId,
        tenant_id: &str,
        inputs: Vec<Row>,
        options: &PredictOptions,
    ) -> Result<BatchOutcome> {
        if inputs.len() > self.settings.prediction.max_batch {
            return Err(ForgeError::ResourceLimit(format!(
                "batch of {} exceeds the {} row cap",
                inputs.len(),
                self.settings.prediction.max_batch
            )));
        }
        let record = self.registry.get_for_tenant(model_id, tenant_id)?;
        ensure_servable(&record)?;
        let version = self.resolve_version(&record, options)?;

        let dir = self.storage.fetch(model_id, &version).await?;
        let metadata = load_metadata(&dir).await;

        let mut items = Vec::with_capacity(inputs.len());
        let mut vectors: Vec<(usize, Array1<f32>)> = Vec::new();
        for (index, raw) in inputs.into_iter().enumerate() {
            let prepared = match self.apply_transformer(&record, raw) {
                Ok(row) => match validate_input(&row, &record) {
                    Ok(()) => Ok(row),
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            match prepared {
                Ok(row) => {
                    let vector = self.vectorize(&record, metadata.as_ref(), &row).await;
                    vectors.push((index, vector));
                }
                Err(err) => items.push(BatchItem::Failed {
                    index,
                    error: err.to_string(),
                }),
            }
        }

        if !vectors.is_empty() {
            let width = vectors[0].1.len();
            let mut x = Array2::zeros((vectors.len(), width));
            for (row_idx, (_, vector)) in vectors.iter().enumerate() {
                for (c, v) in vector.iter().enumerate() {
                    x[[row_idx, c]] = *v;
                }
            }

            let lease = acquire_from_storage(&self.pool, self.storage.as_ref(), model_id, &version)
                .await?;
            let mut lease = lease;
            let result = lease
                .network
                .predict(&x)
                .map_err(|e| ForgeError::Prediction(format!("batch inference failed: {e}")));
            self.pool.release(lease);
            let predicted = result?;

            for (row_idx, (index, _)) in vectors.iter().enumerate() {
                let output = shape_output(&record, metadata.as_ref(), predicted.row(row_idx));
                items.push(BatchItem::Success {
                    index: *index,
                    output,
                });
            }
        }

        items.sort_by_key(|item| match item {
            BatchItem::Success { index, .. } | BatchItem::Failed { index, .. } => *index,
        });
        let success_count = items
            .iter()
            .filter(|i| matches!(i, BatchItem::Success { .. }))
            .count();
        let error_count = items.len() - success_count;
        Ok(BatchOutcome {
            version,
            items,
            success_count,
            error_count,
        })
    }

    /// Attach feedback to a recorded prediction and to the model's log.
    /// Returns the updated record plus a labeled row suitable for the
    /// incremental learner when the model has a target.
    pub async fn submit_feedback(
        &self,
        tenant_id: &str,
        prediction_id: PredictionId,
        actual_value: serde_json::Value,
        is_correct: Option<bool>,
        comment: Option<String>,
        provided_by: Option<String>,
    ) -> Result<(PredictionRecord, Option<Row>)> {
        let existing = self.log.get(prediction_id)?;
        let record = self
            .registry
            .get_for_tenant(existing.model_id, tenant_id)?;

        let feedback = PredictionFeedback {
            prediction_id,
            actual_value: actual_value.clone(),
            is_correct,
            comment,
            provided_by,
            submitted_at: Utc::now(),
        };
        let updated = self.log.attach_feedback(prediction_id, feedback.clone())?;
        self.registry.update_with(existing.model_id, |model| {
            model.feedback.push(feedback.clone());
        })?;

        let learning_row = record.config.target.as_ref().and_then(|target| {
            json_to_feature(&actual_value).map(|label| {
                let mut row = updated.input.clone();
                row.insert(target.clone(), label);
                row
            })
        });
        Ok((updated, learning_row))
    }

    fn resolve_version(&self, record: &ModelRecord, options: &PredictOptions) -> Result<String> {
        if let Some(version) = &options.version {
            return record
                .version(version)
                .map(|v| v.version.clone())
                .ok_or_else(|| {
                    ForgeError::NotFound(format!(
                        "version {version} of model {} not found",
                        record.id
                    ))
                });
        }
        if let Some(test_id) = &options.ab_test_id {
            let side = self.ab.route(test_id)?;
            let version = self.ab.version_for(test_id, side)?;
            debug!(test_id, side = ?side, version, "A/B routed");
            return Ok(version);
        }
        if let Some(stage) = options.stage {
            return record
                .versions
                .iter()
                .filter(|v| v.stage == stage)
                .max_by_key(|v| v.created_at)
                .map(|v| v.version.clone())
                .ok_or_else(|| {
                    ForgeError::NotFound(format!(
                        "model {} has no version at the requested stage",
                        record.id
                    ))
                });
        }
        record
            .production_version()
            .map(|v| v.version.clone())
            .or_else(|| record.current_version.clone())
            .ok_or_else(|| {
                ForgeError::Validation(format!("model {} has no trained version", record.id))
            })
    }

    fn apply_transformer(&self, record: &ModelRecord, row: Row) -> Result<Row> {
        match &record.config.transformer {
            Some(name) => self.transformers.apply(name, row),
            None => Ok(row),
        }
    }

    async fn infer_one(
        &self,
        record: &ModelRecord,
        version: &str,
        input: &Row,
    ) -> Result<PredictionOutput> {
        let dir = self.storage.fetch(record.id, version).await?;
        let metadata = load_metadata(&dir).await;
        if metadata.is_none() {
            warn!(model_id = %record.id, version, "no preprocessing metadata, using legacy heuristic");
        }
        let vector = self.vectorize(record, metadata.as_ref(), input).await;

        let mut x = Array2::zeros((1, vector.len()));
        for (c, v) in vector.iter().enumerate() {
            x[[0, c]] = *v;
        }

        let lease =
            acquire_from_storage(&self.pool, self.storage.as_ref(), record.id, version).await?;
        let mut lease = lease;
        let result = lease
            .network
            .predict(&x)
            .map_err(|e| ForgeError::Prediction(format!("inference failed: {e}")));
        self.pool.release(lease);
        let predicted = result?;

        Ok(shape_output(record, metadata.as_ref(), predicted.row(0)))
    }

    async fn vectorize(
        &self,
        record: &ModelRecord,
        metadata: Option<&PrepMetadata>,
        row: &Row,
    ) -> Array1<f32> {
        match metadata {
            Some(meta) => transform_input(row, meta, Some(&self.embeddings)).await,
            None => heuristic_vector(record, row),
        }
    }
}

fn ensure_servable(record: &ModelRecord) -> Result<()> {
    match record.status {
        ModelStatus::Ready => Ok(()),
        ModelStatus::Training => Err(ForgeError::ConflictOrBusy(format!(
            "model {} is training",
            record.id
        ))),
        _ => Err(ForgeError::Validation(format!(
            "model {} is not ready to serve",
            record.id
        ))),
    }
}

/// Reject rows that carry fields outside the model's declared surface so a
/// typo cannot silently encode as zeros.
fn validate_input(row: &Row, record: &ModelRecord) -> Result<()> {
    if row.is_empty() {
        return Err(ForgeError::Validation("empty prediction input".into()));
    }
    for field in row.keys() {
        let known = record.config.features.iter().any(|f| f == field)
            || record.config.target.as_deref() == Some(field.as_str());
        if !known {
            return Err(ForgeError::Validation(format!(
                "unknown input field '{field}'"
            )));
        }
    }
    Ok(())
}

async fn load_metadata(dir: &std::path::Path) -> Option<PrepMetadata> {
    let raw = tokio::fs::read_to_string(dir.join(PREP_FILE)).await.ok()?;
    match PrepMetadata::from_json(&raw) {
        Ok(meta) => Some(meta),
        Err(err) => {
            warn!(error = %err, "preprocessing metadata unreadable");
            None
        }
    }
}

/// Legacy fallback for versions saved without metadata: numeric
/// pass-through, booleans as 0/1, strings by length.
fn heuristic_vector(record: &ModelRecord, row: &Row) -> Array1<f32> {
    let values: Vec<f32> = record
        .config
        .features
        .iter()
        .map(|feature| match row.get(feature) {
            Some(FeatureValue::Number(n)) if !n.is_nan() => *n as f32,
            Some(FeatureValue::Bool(b)) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Some(FeatureValue::Text(s)) => s.chars().count() as f32,
            _ => 0.0,
        })
        .collect();
    Array1::from_vec(values)
}

fn class_label(metadata: Option<&PrepMetadata>, index: usize) -> String {
    metadata
        .and_then(|m| m.target_categories.as_ref())
        .and_then(|c| c.get(index).cloned())
        .unwrap_or_else(|| format!("Class {index}"))
}

fn shape_output(
    record: &ModelRecord,
    metadata: Option<&PrepMetadata>,
    row: ndarray::ArrayView1<f32>,
) -> PredictionOutput {
    match record.kind {
        ModelKind::Classification | ModelKind::Nlp => {
            let mut best = 0usize;
            let mut best_p = f32::NEG_INFINITY;
            for (i, &p) in row.iter().enumerate() {
                if p > best_p {
                    best_p = p;
                    best = i;
                }
            }
            let probabilities: BTreeMap<String, f64> = row
                .iter()
                .enumerate()
                .map(|(i, &p)| (class_label(metadata, i), p as f64))
                .collect();
            PredictionOutput {
                prediction: serde_json::json!(class_label(metadata, best)),
                confidence: best_p as f64,
                probabilities: Some(probabilities),
                metadata: None,
            }
        }
        ModelKind::Regression => {
            let value = row.get(0).copied().unwrap_or(0.0) as f64;
            // Deterministic heuristic in [0.8, 1.0).
            let confidence = 0.8 + 0.19 / (1.0 + (-value.abs()).exp());
            PredictionOutput {
                prediction: serde_json::json!(value),
                confidence,
                probabilities: None,
                metadata: None,
            }
        }
        _ => {
            let value = row.get(0).copied().unwrap_or(0.0) as f64;
            PredictionOutput {
                prediction: serde_json::json!(value),
                confidence: 0.6,
                probabilities: None,
                metadata: None,
            }
        }
    }
}

fn mock_output(record: &ModelRecord) -> PredictionOutput {
    let flagged = serde_json::json!({ "mock": true });
    match record.kind {
        ModelKind::Classification | ModelKind::Nlp => PredictionOutput {
            prediction: serde_json::json!("Class 0"),
            confidence: 0.5,
            probabilities: Some(BTreeMap::from([
                ("Class 0".to_string(), 0.5),
                ("Class 1".to_string(), 0.5),
            ])),
            metadata: Some(flagged),
        },
        _ => PredictionOutput {
            prediction: serde_json::json!(0.0),
            confidence: 0.5,
            probabilities: None,
            metadata: Some(flagged),
        },
    }
}

fn json_to_feature(value: &serde_json::Value) -> Option<FeatureValue> {
    match value {
        serde_json::Value::Bool(b) => Some(FeatureValue::Bool(*b)),
        serde_json::Value::Number(n) => n.as_f64().map(FeatureValue::Number),
        serde_json::Value::String(s) => Some(FeatureValue::Text(s.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelforge_core::{
        Algorithm, DocumentStore, MemoryDocumentStore, ModelConfig, TrainingDataInfo,
    };
    use modelforge_registry::AbCoordinator;
    use modelforge_train::{LockRegistry, TrainingOrchestrator};
    use std::collections::HashMap;

    struct Harness {
        service: PredictionService,
        registry: Arc<ModelRegistry>,
        model_id: ModelId,
    }

    async fn trained_classifier(root: &std::path::Path) -> Harness {
        let mut settings = Settings::default();
        settings.training.epochs = 40;
        settings.training.learning_rate = 0.01;
        let settings = Arc::new(settings);

        let registry = Arc::new(ModelRegistry::new());
        let storage: Arc<dyn StorageBackend> =
            Arc::new(modelforge_storage::LocalBackend::new(root));
        let pool = Arc::new(ModelPool::new(settings.pool.clone(), None));
        let documents = Arc::new(MemoryDocumentStore::new());
        let embeddings = Arc::new(EmbeddingCache::new(None, 64));

        let rows: Vec<Row> = (0..50)
            .map(|i| {
                let mut row = Row::new();
                row.insert("age".into(), FeatureValue::Number(20.0 + (i % 40) as f64));
                row.insert(
                    "income".into(),
                    FeatureValue::Number(30_000.0 + i as f64 * 1_400.0),
                );
                row.insert(
                    "category".into(),
                    FeatureValue::Text(["A", "B", "C"][i % 3].into()),
                );
                row.insert(
                    "region".into(),
                    FeatureValue::Text(["N", "S", "E", "W"][i % 4].into()),
                );
                row.insert(
                    "purchased".into(),
                    FeatureValue::Bool(i % 2 == 0 || i % 3 == 0),
                );
                row
            })
            .collect();
        documents.insert_rows("t1", "purchases", rows);

        let mut record = ModelRecord::new(
            "t1",
            "purchase-intent",
            ModelKind::Classification,
            ModelConfig {
                algorithm: Algorithm::DenseNn,
                parameters: HashMap::new(),
                features: vec![
                    "age".into(),
                    "income".into(),
                    "category".into(),
                    "region".into(),
                ],
                target: Some("purchased".into()),
                text_features: vec![],
                use_embeddings: false,
                transformer: None,
            },
        );
        record.training_data = Some(TrainingDataInfo {
            source: "purchases".into(),
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

        let service = PredictionService::new(
            settings,
            Arc::clone(&registry),
            storage,
            pool,
            embeddings,
            Arc::new(PredictionLog::new(1000)),
            Arc::new(AbCoordinator::new()),
            Arc::new(TransformerRegistry::new()),
        );
        Harness {
            service,
            registry,
            model_id,
        }
    }

    fn sample_input() -> Row {
        let mut row = Row::new();
        row.insert("age".into(), FeatureValue::Number(30.0));
        row.insert("income".into(), FeatureValue::Number(55_000.0));
        row.insert("category".into(), FeatureValue::Text("B".into()));
        row.insert("region".into(), FeatureValue::Text("S".into()));
        row
    }

    #[tokio::test]
    async fn train_predict_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let h = trained_classifier(root.path()).await;

        let prediction = h
            .service
            .predict(h.model_id, "t1", sample_input(), &PredictOptions::default())
            .await
            .unwrap();

        let label = prediction.output.prediction.as_str().unwrap();
        assert!(label == "Class 0" || label == "Class 1");
        assert!(prediction.output.confidence >= 0.0 && prediction.output.confidence <= 1.0);
        let probabilities = prediction.output.probabilities.unwrap();
        assert_eq!(probabilities.len(), 2);
        assert!(probabilities.contains_key("Class 0"));
        assert!(probabilities.contains_key("Class 1"));
        assert_eq!(h.service.log().total_recorded(), 1);
    }

    #[tokio::test]
    async fn unknown_category_still_predicts() {
        let root = tempfile::tempdir().unwrap();
        let h = trained_classifier(root.path()).await;

        let mut input = sample_input();
        input.insert("category".into(), FeatureValue::Text("Z".into()));
        let prediction = h
            .service
            .predict(h.model_id, "t1", input, &PredictOptions::default())
            .await
            .unwrap();
        assert!(prediction.output.prediction.as_str().is_some());
    }

    #[tokio::test]
    async fn unknown_field_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let h = trained_classifier(root.path()).await;

        let mut input = sample_input();
        input.insert("typo_field".into(), FeatureValue::Number(1.0));
        let err = h
            .service
            .predict(h.model_id, "t1", input, &PredictOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Validation(_)));
    }

    #[tokio::test]
    async fn foreign_tenant_cannot_see_the_model() {
        let root = tempfile::tempdir().unwrap();
        let h = trained_classifier(root.path()).await;
        let err = h
            .service
            .predict(h.model_id, "other", sample_input(), &PredictOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn training_model_is_busy() {
        let root = tempfile::tempdir().unwrap();
        let h = trained_classifier(root.path()).await;
        h.registry
            .update_with(h.model_id, |r| r.status = ModelStatus::Training)
            .unwrap();
        let err = h
            .service
            .predict(h.model_id, "t1", sample_input(), &PredictOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::ConflictOrBusy(_)));
    }

    #[tokio::test]
    async fn batch_reports_per_row_errors() {
        let root = tempfile::tempdir().unwrap();
        let h = trained_classifier(root.path()).await;

        let mut bad = Row::new();
        bad.insert("nonsense".into(), FeatureValue::Number(1.0));
        let outcome = h
            .service
            .predict_batch(
                h.model_id,
                "t1",
                vec![sample_input(), bad, sample_input()],
                &PredictOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.items.len(), 3);
        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.error_count, 1);
        assert!(matches!(outcome.items[1], BatchItem::Failed { index: 1, .. }));
    }

    #[tokio::test]
    async fn batch_over_cap_is_a_resource_limit() {
        let root = tempfile::tempdir().unwrap();
        let h = trained_classifier(root.path()).await;
        let inputs = vec![sample_input(); 101];
        let err = h
            .service
            .predict_batch(h.model_id, "t1", inputs, &PredictOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::ResourceLimit(_)));
    }

    #[tokio::test]
    async fn explicit_version_must_exist() {
        let root = tempfile::tempdir().unwrap();
        let h = trained_classifier(root.path()).await;
        let err = h
            .service
            .predict(
                h.model_id,
                "t1",
                sample_input(),
                &PredictOptions {
                    version: Some("9.9.9".into()),
                    ..PredictOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn feedback_lands_on_prediction_and_model() {
        let root = tempfile::tempdir().unwrap();
        let h = trained_classifier(root.path()).await;

        let prediction = h
            .service
            .predict(h.model_id, "t1", sample_input(), &PredictOptions::default())
            .await
            .unwrap();
        let (updated, learning_row) = h
            .service
            .submit_feedback(
                "t1",
                prediction.id,
                serde_json::json!(true),
                Some(false),
                None,
                Some("test".into()),
            )
            .await
            .unwrap();

        assert!(updated.feedback.is_some());
        let model = h.registry.get(h.model_id).unwrap();
        assert_eq!(model.feedback.len(), 1);
        assert_eq!(model.feedback[0].actual_value, serde_json::json!(true));
        // The labeled row carries the target for incremental learning.
        let row = learning_row.unwrap();
        assert_eq!(row["purchased"], FeatureValue::Bool(true));
    }
}
