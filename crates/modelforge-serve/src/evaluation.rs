//! Offline evaluation against caller-supplied labeled rows, and
//! permutation-based feature importance on top of it.

use modelforge_core::{ForgeError, ModelId, ModelKind, Result, Row};
use modelforge_prep::{
    encode_labels_with_metadata, transform_input, EmbeddingCache, Lcg, PrepMetadata, PREP_FILE,
};
use modelforge_registry::{classification_metrics, regression_metrics, ModelRegistry};
use modelforge_storage::StorageBackend;
use ndarray::Array2;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct FeatureImportance {
    pub feature: String,
    /// Drop in the scoring metric when the feature's columns are permuted.
    pub importance: f64,
}

pub struct Evaluator {
    registry: Arc<ModelRegistry>,
    storage: Arc<dyn StorageBackend>,
    embeddings: Arc<EmbeddingCache>,
}

impl Evaluator {
    pub fn new(
        registry: Arc<ModelRegistry>,
        storage: Arc<dyn StorageBackend>,
        embeddings: Arc<EmbeddingCache>,
    ) -> Self {
        Self {
            registry,
            storage,
            embeddings,
        }
    }

    async fn load(
        &self,
        model_id: ModelId,
        tenant_id: &str,
        rows: &[Row],
    ) -> Result<(
        modelforge_core::ModelRecord,
        PrepMetadata,
        modelforge_nn::Network,
        Array2<f32>,
        Array2<f32>,
    )> {
        if rows.is_empty() {
            return Err(ForgeError::Validation("no evaluation rows supplied".into()));
        }
        let record = self.registry.get_for_tenant(model_id, tenant_id)?;
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

        let width = metadata.input_dim();
        let mut x = Array2::zeros((rows.len(), width));
        for (i, row) in rows.iter().enumerate() {
            let vector = transform_input(row, &metadata, Some(&self.embeddings)).await;
            for (c, v) in vector.iter().enumerate() {
                x[[i, c]] = *v;
            }
        }
        let y = encode_labels_with_metadata(rows, &metadata).map_err(ForgeError::from)?;
        let network = modelforge_nn::load_from_dir(&dir).await?;
        Ok((record, metadata, network, x, y))
    }

    /// Score the current version on labeled rows with the standard metric
    /// routines.
    pub async fn evaluate(
        &self,
        model_id: ModelId,
        tenant_id: &str,
        rows: &[Row],
    ) -> Result<HashMap<String, f64>> {
        let (record, _metadata, mut network, x, y) = self.load(model_id, tenant_id, rows).await?;
        let predicted = network
            .predict(&x)
            .map_err(|e| ForgeError::Prediction(e.to_string()))?;
        Ok(score(record.kind, &predicted, &y))
    }

    /// Permutation importance: shuffle one feature's encoded columns at a
    /// time and measure how much the scoring metric degrades.
    pub async fn feature_importance(
        &self,
        model_id: ModelId,
        tenant_id: &str,
        rows: &[Row],
    ) -> Result<Vec<FeatureImportance>> {
        let (record, metadata, mut network, x, y) = self.load(model_id, tenant_id, rows).await?;
        let baseline = primary_score(
            record.kind,
            &network
                .predict(&x)
                .map_err(|e| ForgeError::Prediction(e.to_string()))?,
            &y,
        );

        let mut importances = Vec::new();
        let mut offset = 0usize;
        for feature in &metadata.features {
            let width = metadata.feature_width(feature);
            let mut permuted = x.clone();
            permute_columns(&mut permuted, offset, width, 42);
            let score = primary_score(
                record.kind,
                &network
                    .predict(&permuted)
                    .map_err(|e| ForgeError::Prediction(e.to_string()))?,
                &y,
            );
            importances.push(FeatureImportance {
                feature: feature.clone(),
                importance: baseline - score,
            });
            offset += width;
        }

        importances.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(importances)
    }
}

fn score(kind: ModelKind, predicted: &Array2<f32>, expected: &Array2<f32>) -> HashMap<String, f64> {
    match kind {
        ModelKind::Regression => regression_metrics(predicted, expected).into_map(),
        _ => classification_metrics(predicted, expected).into_map(),
    }
}

/// Single scalar where higher is better, for importance deltas.
fn primary_score(kind: ModelKind, predicted: &Array2<f32>, expected: &Array2<f32>) -> f64 {
    match kind {
        ModelKind::Regression => -regression_metrics(predicted, expected).mse,
        _ => classification_metrics(predicted, expected).accuracy,
    }
}

/// Shuffle the rows of a column block in place, deterministically.
fn permute_columns(x: &mut Array2<f32>, offset: usize, width: usize, seed: u64) {
    let n = x.nrows();
    if n < 2 || width == 0 {
        return;
    }
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = Lcg::new(seed);
    rng.shuffle(&mut order);
    let original = x.clone();
    for (dst, &src) in order.iter().enumerate() {
        for c in offset..offset + width {
            x[[dst, c]] = original[[src, c]];
        }
    }
}
