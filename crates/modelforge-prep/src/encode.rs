//! Feature typing and row encoding.
//!
//! Encoding is fit once on training rows and replayed byte-for-byte at
//! inference from the persisted [`PrepMetadata`]. The rules:
//!
//! - numeric: pass-through, NaN and absent become 0
//! - boolean: true = 1, false = 0
//! - categorical: one-hot against the sorted training category list;
//!   unknown values encode as the zero vector
//! - text: embedding lookup when a dictionary exists, otherwise four
//!   deterministic scalars (chars, words, uppercase letters, digits)

use crate::metadata::{FeatureType, PrepMetadata};
use modelforge_core::{FeatureValue, Row};
use std::collections::{BTreeMap, BTreeSet};

/// Width of the scalar fallback for text features without embeddings.
pub const TEXT_SCALAR_DIM: usize = 4;

/// Deterministic scalar features for a text value.
pub fn text_scalars(value: &str) -> [f32; TEXT_SCALAR_DIM] {
    let chars = value.chars().count() as f32;
    let words = value.split_whitespace().count() as f32;
    let upper = value.chars().filter(|c| c.is_uppercase()).count() as f32;
    let digits = value.chars().filter(|c| c.is_ascii_digit()).count() as f32;
    [chars, words, upper, digits]
}

/// Decide each feature's type from the training rows alone.
///
/// A feature explicitly declared as text skips the cardinality check.
/// Features absent from every row fall back to numeric zero and are
/// reported as warnings.
pub fn detect_feature_types(
    rows: &[Row],
    features: &[String],
    text_features: &[String],
    max_categorical: usize,
) -> (BTreeMap<String, FeatureType>, Vec<String>) {
    let mut types = BTreeMap::new();
    let mut warnings = Vec::new();

    for feature in features {
        if text_features.iter().any(|t| t == feature) {
            types.insert(feature.clone(), FeatureType::Text);
            continue;
        }

        let first = rows
            .iter()
            .map(|r| r.get(feature).unwrap_or(&FeatureValue::Absent))
            .find(|v| !v.is_absent());

        let decided = match first {
            None => {
                warnings.push(format!(
                    "feature '{feature}' is absent from every training row, encoding as numeric zero"
                ));
                types.insert(feature.clone(), FeatureType::Numeric);
                continue;
            }
            Some(FeatureValue::Number(_)) => FeatureType::Numeric,
            Some(FeatureValue::Bool(_)) => FeatureType::Boolean,
            Some(FeatureValue::Text(_)) | Some(FeatureValue::Absent) => {
                let distinct: BTreeSet<String> = rows
                    .iter()
                    .filter_map(|r| r.get(feature))
                    .filter(|v| !v.is_absent())
                    .map(|v| v.canonical_string())
                    .collect();
                if distinct.len() <= max_categorical {
                    FeatureType::Categorical
                } else {
                    FeatureType::Text
                }
            }
        };
        types.insert(feature.clone(), decided);
    }

    (types, warnings)
}

/// Sorted distinct training values per categorical feature. Position in the
/// returned list is the authoritative one-hot index.
pub fn build_category_maps(
    rows: &[Row],
    types: &BTreeMap<String, FeatureType>,
) -> BTreeMap<String, Vec<String>> {
    let mut maps = BTreeMap::new();
    for (feature, ty) in types {
        if *ty != FeatureType::Categorical {
            continue;
        }
        let distinct: BTreeSet<String> = rows
            .iter()
            .filter_map(|r| r.get(feature))
            .filter(|v| !v.is_absent())
            .map(|v| v.canonical_string())
            .collect();
        maps.insert(feature.clone(), distinct.into_iter().collect());
    }
    maps
}

/// Distinct text values per text feature, for embedding-dictionary fitting.
pub fn collect_text_values(
    rows: &[Row],
    types: &BTreeMap<String, FeatureType>,
) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for (feature, ty) in types {
        if *ty != FeatureType::Text {
            continue;
        }
        let distinct: BTreeSet<String> = rows
            .iter()
            .filter_map(|r| r.get(feature))
            .filter(|v| !v.is_absent())
            .map(|v| v.canonical_string())
            .collect();
        out.insert(feature.clone(), distinct.into_iter().collect());
    }
    out
}

/// Encode one row into the unnormalized feature vector.
///
/// `extra_embeddings` supplies vectors for text values generated after
/// training (inference-time unseen values); anything not found there or in
/// the persisted dictionary encodes as zeros.
pub fn encode_row(
    row: &Row,
    meta: &PrepMetadata,
    extra_embeddings: Option<&BTreeMap<(String, String), Vec<f32>>>,
) -> Vec<f32> {
    let mut out = Vec::with_capacity(meta.input_dim());

    for feature in &meta.features {
        let value = row.get(feature).unwrap_or(&FeatureValue::Absent);
        match meta.feature_types.get(feature) {
            Some(FeatureType::Numeric) | None => {
                let n = value.as_number().unwrap_or(0.0);
                out.push(if n.is_nan() { 0.0 } else { n as f32 });
            }
            Some(FeatureType::Boolean) => {
                out.push(match value {
                    FeatureValue::Bool(true) => 1.0,
                    FeatureValue::Number(n) if *n != 0.0 => 1.0,
                    _ => 0.0,
                });
            }
            Some(FeatureType::Categorical) => {
                let categories = meta
                    .category_maps
                    .get(feature)
                    .map(|c| c.as_slice())
                    .unwrap_or(&[]);
                let needle = value.canonical_string();
                let hit = if value.is_absent() {
                    None
                } else {
                    categories.iter().position(|c| *c == needle)
                };
                for i in 0..categories.len() {
                    out.push(if Some(i) == hit { 1.0 } else { 0.0 });
                }
            }
            Some(FeatureType::Text) => {
                let text = value.canonical_string();
                match &meta.embeddings {
                    Some(dict) if dict.dimension > 0 => {
                        let vector = dict.lookup(feature, &text).or_else(|| {
                            extra_embeddings
                                .and_then(|m| m.get(&(feature.clone(), text.clone())))
                        });
                        match vector {
                            Some(v) => out.extend_from_slice(v),
                            None => out.extend(std::iter::repeat(0.0).take(dict.dimension)),
                        }
                    }
                    _ => {
                        if value.is_absent() {
                            out.extend([0.0; TEXT_SCALAR_DIM]);
                        } else {
                            out.extend(text_scalars(&text));
                        }
                    }
                }
            }
        }
    }

    out
}

/// Apply persisted normalization in place.
pub fn normalize(vector: &mut [f32], meta: &PrepMetadata) {
    for (i, x) in vector.iter_mut().enumerate() {
        if let Some(stat) = meta.normalization.get(i) {
            *x = ((*x as f64 - stat.mean) / stat.std) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::NormStat;
    use modelforge_core::ModelKind;

    fn row(pairs: &[(&str, FeatureValue)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn meta_with_category() -> PrepMetadata {
        let mut feature_types = BTreeMap::new();
        feature_types.insert("age".into(), FeatureType::Numeric);
        feature_types.insert("region".into(), FeatureType::Categorical);
        let mut category_maps = BTreeMap::new();
        category_maps.insert("region".into(), vec!["e".into(), "n".into(), "s".into()]);
        PrepMetadata {
            features: vec!["age".into(), "region".into()],
            target: None,
            model_kind: ModelKind::Classification,
            feature_types,
            category_maps,
            embeddings: None,
            normalization: vec![NormStat { mean: 0.0, std: 1.0 }; 4],
            target_categories: None,
            label_dim: 2,
        }
    }

    #[test]
    fn typing_follows_first_non_null_value() {
        let rows = vec![
            row(&[
                ("a", FeatureValue::Absent),
                ("b", FeatureValue::Bool(true)),
                ("c", FeatureValue::Text("x".into())),
            ]),
            row(&[
                ("a", FeatureValue::Number(2.0)),
                ("b", FeatureValue::Bool(false)),
                ("c", FeatureValue::Text("y".into())),
            ]),
        ];
        let features = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let (types, warnings) = detect_feature_types(&rows, &features, &[], 100);
        assert!(warnings.is_empty());
        assert_eq!(types["a"], FeatureType::Numeric);
        assert_eq!(types["b"], FeatureType::Boolean);
        assert_eq!(types["c"], FeatureType::Categorical);
    }

    #[test]
    fn high_cardinality_strings_become_text() {
        let rows: Vec<Row> = (0..10)
            .map(|i| row(&[("desc", FeatureValue::Text(format!("value-{i}")))]))
            .collect();
        let (types, _) = detect_feature_types(&rows, &["desc".to_string()], &[], 5);
        assert_eq!(types["desc"], FeatureType::Text);
    }

    #[test]
    fn missing_feature_warns_and_defaults_numeric() {
        let rows = vec![row(&[("a", FeatureValue::Number(1.0))])];
        let features = vec!["a".to_string(), "ghost".to_string()];
        let (types, warnings) = detect_feature_types(&rows, &features, &[], 100);
        assert_eq!(types["ghost"], FeatureType::Numeric);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn one_hot_matches_category_position() {
        let meta = meta_with_category();
        let encoded = encode_row(
            &row(&[
                ("age", FeatureValue::Number(30.0)),
                ("region", FeatureValue::Text("n".into())),
            ]),
            &meta,
            None,
        );
        assert_eq!(encoded, vec![30.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn unknown_category_encodes_as_zeros() {
        let meta = meta_with_category();
        let encoded = encode_row(
            &row(&[
                ("age", FeatureValue::Number(30.0)),
                ("region", FeatureValue::Text("west".into())),
            ]),
            &meta,
            None,
        );
        assert_eq!(&encoded[1..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn text_scalars_are_deterministic() {
        assert_eq!(text_scalars("Hello World 42"), [14.0, 3.0, 2.0, 2.0]);
        assert_eq!(text_scalars(""), [0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn nan_becomes_zero() {
        let meta = meta_with_category();
        let encoded = encode_row(
            &row(&[
                ("age", FeatureValue::Number(f64::NAN)),
                ("region", FeatureValue::Text("e".into())),
            ]),
            &meta,
            None,
        );
        assert_eq!(encoded[0], 0.0);
    }
}
