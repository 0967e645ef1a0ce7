//! Offline comparison of two saved versions on a shared test set.

use crate::metrics::{classification_metrics, regression_metrics};
use modelforge_core::{ModelId, ModelKind, Result};
use modelforge_storage::StorageBackend;
use ndarray::Array2;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComparisonWinner {
    A,
    B,
    Tie,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonResult {
    pub winner: ComparisonWinner,
    /// Magnitude of the winning margin on the deciding metric.
    pub improvement: f64,
    pub metrics_a: HashMap<String, f64>,
    pub metrics_b: HashMap<String, f64>,
}

pub struct ModelComparator {
    storage: Arc<dyn StorageBackend>,
}

impl ModelComparator {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Load both versions, evaluate each on the same tensors, and name the
    /// winner: higher accuracy for classification, lower MSE for regression.
    pub async fn compare(
        &self,
        model_a: ModelId,
        version_a: &str,
        model_b: ModelId,
        version_b: &str,
        x_test: &Array2<f32>,
        y_test: &Array2<f32>,
        kind: ModelKind,
    ) -> Result<ComparisonResult> {
        let dir_a = self.storage.fetch(model_a, version_a).await?;
        let dir_b = self.storage.fetch(model_b, version_b).await?;
        let mut network_a = modelforge_nn::load_from_dir(&dir_a).await?;
        let mut network_b = modelforge_nn::load_from_dir(&dir_b).await?;

        let predicted_a = network_a.predict(x_test).map_err(modelforge_core::ForgeError::from)?;
        let predicted_b = network_b.predict(x_test).map_err(modelforge_core::ForgeError::from)?;

        let (metrics_a, metrics_b, score_a, score_b, higher_wins) = match kind {
            ModelKind::Regression => {
                let a = regression_metrics(&predicted_a, y_test);
                let b = regression_metrics(&predicted_b, y_test);
                let (sa, sb) = (a.mse, b.mse);
                (a.into_map(), b.into_map(), sa, sb, false)
            }
            _ => {
                let a = classification_metrics(&predicted_a, y_test);
                let b = classification_metrics(&predicted_b, y_test);
                let (sa, sb) = (a.accuracy, b.accuracy);
                (a.into_map(), b.into_map(), sa, sb, true)
            }
        };

        let winner = if score_a == score_b {
            ComparisonWinner::Tie
        } else if (score_a > score_b) == higher_wins {
            ComparisonWinner::A
        } else {
            ComparisonWinner::B
        };

        Ok(ComparisonResult {
            winner,
            improvement: (score_a - score_b).abs(),
            metrics_a,
            metrics_b,
        })
    }
}
