//! Shared data model for models, versions, predictions and feedback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

pub type ModelId = Uuid;
pub type PredictionId = Uuid;

/// A single training or inference row: field name to heterogeneous value.
///
/// `BTreeMap` keeps field iteration order deterministic, which the
/// preprocessing pipeline relies on for reproducible encodings.
pub type Row = BTreeMap<String, FeatureValue>;

/// A heterogeneous field value as it arrives from a document store or an
/// HTTP payload. `Absent` is distinct from numeric zero and from empty
/// string; missing-value handling decides what to do with it downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Absent,
}

impl FeatureValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(n) => Some(*n),
            FeatureValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FeatureValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, FeatureValue::Absent)
    }

    /// Canonical string form used for category lists and embedding keys.
    pub fn canonical_string(&self) -> String {
        match self {
            FeatureValue::Bool(b) => b.to_string(),
            FeatureValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            FeatureValue::Text(s) => s.clone(),
            FeatureValue::Absent => String::new(),
        }
    }
}

/// Model classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Classification,
    Regression,
    Clustering,
    Recommendation,
    Nlp,
    Custom,
}

/// Lifecycle status of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Created,
    Training,
    Ready,
    Error,
}

/// Stage label on a saved version, controlled by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStage {
    Development,
    Staging,
    Production,
    Archived,
}

/// Network architecture choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    DenseNn,
    Lstm,
    Generic,
}

/// One saved, immutable version of a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersionEntry {
    pub version: String,
    pub stage: VersionStage,
    /// Metric name to value as evaluated at save time.
    pub performance: HashMap<String, f64>,
    /// Canonical storage URI of the version directory.
    pub storage_uri: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Descriptor of the data a version was trained on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingDataInfo {
    /// Source identifier: a document-store collection name.
    pub source: String,
    pub record_count: usize,
    pub seed: u64,
    pub dataset_hash: String,
    pub epochs: usize,
}

/// Caller-supplied model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub algorithm: Algorithm,
    /// Free-form hyperparameter overrides (epochs, batch_size, ...).
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Ordered feature list; the order is authoritative for encoding.
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Features the caller declares as free text regardless of cardinality.
    #[serde(default)]
    pub text_features: Vec<String>,
    #[serde(default)]
    pub use_embeddings: bool,
    /// Optional named input transformer applied before preprocessing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformer: Option<String>,
}

/// Feedback attached to a model's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionFeedback {
    pub prediction_id: PredictionId,
    pub actual_value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provided_by: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// A tenant-owned model with its full version history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: ModelId,
    pub tenant_id: String,
    pub name: String,
    pub kind: ModelKind,
    pub status: ModelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    /// Append-only; promotion flips stages, never removes entries.
    #[serde(default)]
    pub versions: Vec<ModelVersionEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_data: Option<TrainingDataInfo>,
    pub config: ModelConfig,
    /// Aggregated metrics of the current version.
    #[serde(default)]
    pub performance: HashMap<String, f64>,
    #[serde(default)]
    pub feedback: Vec<PredictionFeedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelRecord {
    pub fn new(tenant_id: &str, name: &str, kind: ModelKind, config: ModelConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            kind,
            status: ModelStatus::Created,
            current_version: None,
            versions: Vec::new(),
            training_data: None,
            config,
            performance: HashMap::new(),
            feedback: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn version(&self, version: &str) -> Option<&ModelVersionEntry> {
        self.versions.iter().find(|v| v.version == version)
    }

    pub fn production_version(&self) -> Option<&ModelVersionEntry> {
        self.versions
            .iter()
            .find(|v| v.stage == VersionStage::Production)
    }
}

/// Output payload of a single prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionOutput {
    /// Class label (classification) or numeric value (regression).
    pub prediction: serde_json::Value,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A recorded prediction, feeding drift detection and health reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: PredictionId,
    pub model_id: ModelId,
    pub version: String,
    pub input: Row,
    pub output: PredictionOutput,
    pub processing_ms: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<PredictionFeedback>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_value_untagged_round_trip() {
        let row: Row = serde_json::from_str(
            r#"{"age": 30, "active": true, "city": "north", "note": null}"#,
        )
        .unwrap();
        assert_eq!(row["age"], FeatureValue::Number(30.0));
        assert_eq!(row["active"], FeatureValue::Bool(true));
        assert_eq!(row["city"], FeatureValue::Text("north".into()));
        assert!(row["note"].is_absent());
    }

    #[test]
    fn canonical_string_collapses_integral_floats() {
        assert_eq!(FeatureValue::Number(3.0).canonical_string(), "3");
        assert_eq!(FeatureValue::Number(3.5).canonical_string(), "3.5");
        assert_eq!(FeatureValue::Bool(false).canonical_string(), "false");
    }

    #[test]
    fn stage_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&VersionStage::Production).unwrap(),
            "\"production\""
        );
        assert_eq!(
            serde_json::to_string(&Algorithm::DenseNn).unwrap(),
            "\"dense_nn\""
        );
    }
}
