//! Preprocessing metadata persisted as `prep.json` next to each version's
//! weights. This is the authoritative record for inference-time replay: the
//! schema is closed (`deny_unknown_fields`) and field order is fixed so the
//! serialized form is stable across runs.

use modelforge_core::ModelKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PREP_FILE: &str = "prep.json";

/// Resolved type of a feature, decided once at training time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    Numeric,
    Boolean,
    Categorical,
    Text,
}

/// Per-output-dimension normalization statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormStat {
    pub mean: f64,
    /// Population standard deviation; recorded as 1.0 where the training
    /// column was constant so inference never divides by zero.
    pub std: f64,
}

/// Persisted (feature, value) -> embedding vector dictionary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingDict {
    pub dimension: usize,
    /// feature -> value -> vector. BTreeMaps keep the file deterministic.
    pub values: BTreeMap<String, BTreeMap<String, Vec<f32>>>,
}

impl EmbeddingDict {
    pub fn lookup(&self, feature: &str, value: &str) -> Option<&Vec<f32>> {
        self.values.get(feature).and_then(|m| m.get(value))
    }
}

/// The complete preprocessing contract for one saved version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrepMetadata {
    /// Ordered feature list; encoding walks this order exactly.
    pub features: Vec<String>,
    pub target: Option<String>,
    pub model_kind: ModelKind,
    pub feature_types: BTreeMap<String, FeatureType>,
    /// Sorted category list per categorical feature. Position is the
    /// one-hot index; unknown values encode as the zero vector.
    pub category_maps: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<EmbeddingDict>,
    pub normalization: Vec<NormStat>,
    /// Sorted target category list for string-target classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_categories: Option<Vec<String>>,
    /// Width of the label tensor (1 for regression).
    pub label_dim: usize,
}

impl PrepMetadata {
    /// Total encoded input width, derived from the per-feature types.
    pub fn input_dim(&self) -> usize {
        self.features
            .iter()
            .map(|f| self.feature_width(f))
            .sum()
    }

    /// Encoded width of a single feature.
    pub fn feature_width(&self, feature: &str) -> usize {
        match self.feature_types.get(feature) {
            Some(FeatureType::Numeric) | Some(FeatureType::Boolean) => 1,
            Some(FeatureType::Categorical) => self
                .category_maps
                .get(feature)
                .map(|c| c.len())
                .unwrap_or(0),
            Some(FeatureType::Text) => match &self.embeddings {
                Some(dict) if dict.dimension > 0 => dict.dimension,
                _ => crate::encode::TEXT_SCALAR_DIM,
            },
            // A feature missing from the type map was absent from every
            // training row and encoded as numeric zero.
            None => 1,
        }
    }

    pub fn to_json(&self) -> modelforge_core::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> modelforge_core::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> PrepMetadata {
        let mut feature_types = BTreeMap::new();
        feature_types.insert("age".to_string(), FeatureType::Numeric);
        feature_types.insert("region".to_string(), FeatureType::Categorical);
        let mut category_maps = BTreeMap::new();
        category_maps.insert(
            "region".to_string(),
            vec!["east".into(), "north".into(), "south".into()],
        );
        PrepMetadata {
            features: vec!["age".into(), "region".into()],
            target: Some("purchased".into()),
            model_kind: ModelKind::Classification,
            feature_types,
            category_maps,
            embeddings: None,
            normalization: vec![
                NormStat { mean: 40.0, std: 10.0 },
                NormStat { mean: 0.3, std: 0.45 },
                NormStat { mean: 0.3, std: 0.45 },
                NormStat { mean: 0.4, std: 0.49 },
            ],
            target_categories: None,
            label_dim: 2,
        }
    }

    #[test]
    fn input_dim_sums_feature_widths() {
        let meta = minimal();
        assert_eq!(meta.input_dim(), 1 + 3);
        assert_eq!(meta.feature_width("region"), 3);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let mut value = serde_json::to_value(minimal()).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("surprise".into(), serde_json::json!(1));
        let raw = serde_json::to_string(&value).unwrap();
        assert!(PrepMetadata::from_json(&raw).is_err());
    }

    #[test]
    fn round_trip_is_stable() {
        let meta = minimal();
        let first = meta.to_json().unwrap();
        let reparsed = PrepMetadata::from_json(&first).unwrap();
        assert_eq!(first, reparsed.to_json().unwrap());
    }
}
