//! Dataset fitting: rows in, tensors + replayable metadata out.

use crate::embedding::EmbeddingCache;
use crate::encode::{
    build_category_maps, collect_text_values, detect_feature_types, encode_row, normalize,
};
use crate::error::{PrepError, Result};
use crate::metadata::{EmbeddingDict, FeatureType, NormStat, PrepMetadata};
use crate::split::{plain_split, stratified_split, SplitIndices};
use modelforge_core::{FeatureValue, ModelKind, Row};
use ndarray::{Array1, Array2};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Caller-facing preparation parameters, extracted from the model config.
#[derive(Debug, Clone)]
pub struct PrepConfig {
    pub features: Vec<String>,
    pub target: Option<String>,
    pub text_features: Vec<String>,
    pub use_embeddings: bool,
    pub model_kind: ModelKind,
    pub max_categorical: usize,
    pub seed: u64,
}

/// Encoded, normalized, split tensors plus the metadata to replay them.
#[derive(Debug)]
pub struct PreparedDataset {
    pub x_train: Array2<f32>,
    pub y_train: Array2<f32>,
    pub x_validation: Array2<f32>,
    pub y_validation: Array2<f32>,
    pub x_test: Array2<f32>,
    pub y_test: Array2<f32>,
    pub metadata: PrepMetadata,
    pub dataset_hash: String,
    pub warnings: Vec<String>,
}

impl PreparedDataset {
    pub fn input_dim(&self) -> usize {
        self.x_train.ncols()
    }

    pub fn train_count(&self) -> usize {
        self.x_train.nrows()
    }
}

enum TargetEncoding {
    None,
    Regression(Vec<f64>),
    /// Class index per row plus the number of classes; `categories` is
    /// present when labels were strings.
    Classification {
        indices: Vec<usize>,
        num_classes: usize,
        categories: Option<Vec<String>>,
    },
}

/// Fit the full preprocessing pipeline on training rows.
pub async fn fit_transform(
    rows: &[Row],
    config: &PrepConfig,
    embeddings: Option<&EmbeddingCache>,
) -> Result<PreparedDataset> {
    if rows.is_empty() {
        return Err(PrepError::EmptyDataset);
    }

    let mut warnings = Vec::new();

    // Target must appear in at least one row when declared.
    if let Some(target) = &config.target {
        let present = rows
            .iter()
            .any(|r| r.get(target).map(|v| !v.is_absent()).unwrap_or(false));
        if !present {
            return Err(PrepError::TargetMissing(target.clone()));
        }
    }

    let (feature_types, type_warnings) = detect_feature_types(
        rows,
        &config.features,
        &config.text_features,
        config.max_categorical,
    );
    warnings.extend(type_warnings);

    let category_maps = build_category_maps(rows, &feature_types);

    // Embedding dictionary for text features, when enabled and available.
    let embedding_dict = match (config.use_embeddings, embeddings) {
        (true, Some(cache)) if cache.has_provider() => {
            fit_embeddings(rows, &feature_types, cache, &mut warnings).await
        }
        (true, _) => {
            warnings
                .push("embeddings requested but no provider configured, using text scalars".into());
            None
        }
        _ => None,
    };

    let target_encoding = encode_target(rows, config)?;

    let split = match &target_encoding {
        TargetEncoding::Classification { indices, categories, .. } => {
            let labels: Vec<String> = match categories {
                Some(cats) => indices.iter().map(|&i| cats[i].clone()).collect(),
                None => indices.iter().map(|i| i.to_string()).collect(),
            };
            stratified_split(&labels, config.seed)
        }
        _ => plain_split(rows.len(), config.seed),
    };

    let (target_categories, label_dim) = match &target_encoding {
        TargetEncoding::None => (None, 0),
        TargetEncoding::Regression(_) => (None, 1),
        TargetEncoding::Classification {
            num_classes,
            categories,
            ..
        } => (categories.clone(), *num_classes),
    };

    let mut metadata = PrepMetadata {
        features: config.features.clone(),
        target: config.target.clone(),
        model_kind: config.model_kind,
        feature_types,
        category_maps,
        embeddings: embedding_dict,
        normalization: Vec::new(),
        target_categories,
        label_dim,
    };

    // Encode every row, then fit normalization on the training split only.
    let encoded: Vec<Vec<f32>> = rows.iter().map(|r| encode_row(r, &metadata, None)).collect();
    let width = metadata.input_dim();
    metadata.normalization = fit_normalization(&encoded, &split.train, width);

    let gather = |ids: &[usize]| -> Array2<f32> {
        let mut m = Array2::zeros((ids.len(), width));
        for (out_row, &src) in ids.iter().enumerate() {
            let mut v = encoded[src].clone();
            normalize(&mut v, &metadata);
            for (c, x) in v.into_iter().enumerate() {
                m[[out_row, c]] = x;
            }
        }
        m
    };

    let gather_labels = |ids: &[usize]| -> Array2<f32> {
        match &target_encoding {
            TargetEncoding::None => Array2::zeros((ids.len(), 0)),
            TargetEncoding::Regression(values) => {
                let mut m = Array2::zeros((ids.len(), 1));
                for (out_row, &src) in ids.iter().enumerate() {
                    m[[out_row, 0]] = values[src] as f32;
                }
                m
            }
            TargetEncoding::Classification {
                indices,
                num_classes,
                ..
            } => {
                let mut m = Array2::zeros((ids.len(), *num_classes));
                for (out_row, &src) in ids.iter().enumerate() {
                    m[[out_row, indices[src]]] = 1.0;
                }
                m
            }
        }
    };

    let dataset_hash = dataset_hash(&config.features, config.target.as_deref(), &split);
    debug!(
        rows = rows.len(),
        train = split.train.len(),
        validation = split.validation.len(),
        test = split.test.len(),
        width,
        hash = %dataset_hash,
        "dataset prepared"
    );

    let x_train = gather(&split.train);
    let y_train = gather_labels(&split.train);
    let x_validation = gather(&split.validation);
    let y_validation = gather_labels(&split.validation);
    let x_test = gather(&split.test);
    let y_test = gather_labels(&split.test);
    drop(gather);

    Ok(PreparedDataset {
        x_train,
        y_train,
        x_validation,
        y_validation,
        x_test,
        y_test,
        metadata,
        dataset_hash,
        warnings,
    })
}

/// Replay preprocessing for one inference row.
///
/// Text values unseen at training are embedded through the cache when a
/// provider is available, otherwise they encode as zeros.
pub async fn transform_input(
    row: &Row,
    meta: &PrepMetadata,
    embeddings: Option<&EmbeddingCache>,
) -> Array1<f32> {
    let mut extra: BTreeMap<(String, String), Vec<f32>> = BTreeMap::new();

    if let (Some(dict), Some(cache)) = (&meta.embeddings, embeddings) {
        if dict.dimension > 0 {
            for (feature, ty) in &meta.feature_types {
                if *ty != FeatureType::Text {
                    continue;
                }
                let Some(value) = row.get(feature).filter(|v| !v.is_absent()) else {
                    continue;
                };
                let text = value.canonical_string();
                if dict.lookup(feature, &text).is_none() {
                    if let Some(vector) = cache.get_or_embed(feature, &text).await {
                        extra.insert((feature.clone(), text), vector);
                    }
                }
            }
        }
    }

    let mut encoded = encode_row(row, meta, Some(&extra));
    normalize(&mut encoded, meta);
    Array1::from_vec(encoded)
}

/// Encode target labels for rows against frozen metadata: the counterpart
/// of [`transform_input`] for the label side, used by incremental updates
/// and test-set evaluation where categories must not be refit.
pub fn encode_labels_with_metadata(rows: &[Row], meta: &PrepMetadata) -> Result<Array2<f32>> {
    let Some(target) = &meta.target else {
        return Ok(Array2::zeros((rows.len(), 0)));
    };

    if meta.model_kind == ModelKind::Regression {
        let mut y = Array2::zeros((rows.len(), 1));
        for (i, row) in rows.iter().enumerate() {
            let n = row.get(target).and_then(|v| v.as_number()).unwrap_or(0.0);
            y[[i, 0]] = if n.is_nan() { 0.0 } else { n as f32 };
        }
        return Ok(y);
    }

    let classes = meta.label_dim.max(1);
    let mut y = Array2::zeros((rows.len(), classes));
    for (i, row) in rows.iter().enumerate() {
        let value = row
            .get(target)
            .filter(|v| !v.is_absent())
            .ok_or_else(|| PrepError::TargetMissing(target.clone()))?;
        let index = match &meta.target_categories {
            Some(categories) => {
                let needle = value.canonical_string();
                categories.iter().position(|c| *c == needle).ok_or_else(|| {
                    PrepError::InvalidTarget(format!("unknown target label '{needle}'"))
                })?
            }
            None => {
                let n = value.as_number().unwrap_or(-1.0);
                if n < 0.0 || n.fract() != 0.0 {
                    return Err(PrepError::InvalidTarget(format!(
                        "class label {n} is not a non-negative integer"
                    )));
                }
                n as usize
            }
        };
        if index >= classes {
            return Err(PrepError::InvalidTarget(format!(
                "class index {index} exceeds label width {classes}"
            )));
        }
        y[[i, index]] = 1.0;
    }
    Ok(y)
}

async fn fit_embeddings(
    rows: &[Row],
    feature_types: &BTreeMap<String, FeatureType>,
    cache: &EmbeddingCache,
    warnings: &mut Vec<String>,
) -> Option<EmbeddingDict> {
    let text_values = collect_text_values(rows, feature_types);
    if text_values.is_empty() {
        return None;
    }

    let mut dict = EmbeddingDict {
        dimension: cache.dimension(),
        values: BTreeMap::new(),
    };
    for (feature, values) in text_values {
        if let Err(err) = cache.warmup(&feature, &values).await {
            warn!(feature = %feature, error = %err, "embedding fit failed, using text scalars");
            warnings.push(format!(
                "embedding provider failed for '{feature}', using text scalars"
            ));
            return None;
        }
        let mut per_feature = BTreeMap::new();
        for value in values {
            if let Some(vector) = cache.lookup(&feature, &value) {
                per_feature.insert(value, vector);
            }
        }
        dict.values.insert(feature, per_feature);
    }
    Some(dict)
}

fn encode_target(rows: &[Row], config: &PrepConfig) -> Result<TargetEncoding> {
    let Some(target) = &config.target else {
        return Ok(TargetEncoding::None);
    };

    if config.model_kind == ModelKind::Regression {
        let values = rows
            .iter()
            .map(|r| {
                let n = r
                    .get(target)
                    .and_then(|v| v.as_number())
                    .unwrap_or(0.0);
                if n.is_nan() {
                    0.0
                } else {
                    n
                }
            })
            .collect();
        return Ok(TargetEncoding::Regression(values));
    }

    // Classification (and nlp/custom with a target): string targets build a
    // sorted category list; numeric and boolean targets are class indices.
    let first = rows
        .iter()
        .filter_map(|r| r.get(target))
        .find(|v| !v.is_absent());

    match first {
        Some(FeatureValue::Text(_)) => {
            let mut categories: Vec<String> = rows
                .iter()
                .filter_map(|r| r.get(target))
                .filter(|v| !v.is_absent())
                .map(|v| v.canonical_string())
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();
            categories.sort();
            let indices = rows
                .iter()
                .map(|r| {
                    let label = r
                        .get(target)
                        .filter(|v| !v.is_absent())
                        .map(|v| v.canonical_string())
                        .unwrap_or_default();
                    categories.iter().position(|c| *c == label).ok_or_else(|| {
                        PrepError::InvalidTarget(format!("unlabelled row for target '{target}'"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let num_classes = categories.len().max(2);
            Ok(TargetEncoding::Classification {
                indices,
                num_classes,
                categories: Some(categories),
            })
        }
        _ => {
            let indices = rows
                .iter()
                .map(|r| {
                    let n = r
                        .get(target)
                        .and_then(|v| v.as_number())
                        .unwrap_or(0.0);
                    if n < 0.0 || n.fract() != 0.0 {
                        return Err(PrepError::InvalidTarget(format!(
                            "class label {n} is not a non-negative integer"
                        )));
                    }
                    Ok(n as usize)
                })
                .collect::<Result<Vec<_>>>()?;
            let num_classes = indices.iter().copied().max().unwrap_or(0) + 1;
            Ok(TargetEncoding::Classification {
                indices,
                num_classes: num_classes.max(2),
                categories: None,
            })
        }
    }
}

fn fit_normalization(encoded: &[Vec<f32>], train_ids: &[usize], width: usize) -> Vec<NormStat> {
    let n = train_ids.len().max(1) as f64;
    let mut stats = Vec::with_capacity(width);
    for col in 0..width {
        let mean = train_ids
            .iter()
            .map(|&i| encoded[i][col] as f64)
            .sum::<f64>()
            / n;
        let variance = train_ids
            .iter()
            .map(|&i| {
                let d = encoded[i][col] as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let std = variance.sqrt();
        stats.push(NormStat {
            mean,
            std: if std == 0.0 { 1.0 } else { std },
        });
    }
    stats
}

/// Short fingerprint of the dataset shape for registry records.
pub fn dataset_hash(features: &[String], target: Option<&str>, split: &SplitIndices) -> String {
    let mut hasher = Sha256::new();
    hasher.update(features.join(","));
    hasher.update(b"|");
    hasher.update(target.unwrap_or(""));
    hasher.update(b"|");
    hasher.update(
        format!(
            "{}:{}:{}",
            split.train.len(),
            split.validation.len(),
            split.test.len()
        )
        .as_bytes(),
    );
    let digest = hasher.finalize();
    digest
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn classification_rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("age".into(), FeatureValue::Number(20.0 + (i % 40) as f64));
                row.insert(
                    "income".into(),
                    FeatureValue::Number(30_000.0 + (i as f64) * 1_400.0),
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
            .collect()
    }

    fn classification_config() -> PrepConfig {
        PrepConfig {
            features: vec![
                "age".into(),
                "income".into(),
                "category".into(),
                "region".into(),
            ],
            target: Some("purchased".into()),
            text_features: vec![],
            use_embeddings: false,
            model_kind: ModelKind::Classification,
            max_categorical: 100,
            seed: 42,
        }
    }

    #[tokio::test]
    async fn empty_dataset_fails() {
        let err = fit_transform(&[], &classification_config(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PrepError::EmptyDataset));
    }

    #[tokio::test]
    async fn missing_target_fails() {
        let rows = vec![{
            let mut r = Row::new();
            r.insert("age".into(), FeatureValue::Number(30.0));
            r
        }];
        let err = fit_transform(&rows, &classification_config(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PrepError::TargetMissing(_)));
    }

    #[tokio::test]
    async fn classification_fit_produces_one_hot_and_category_maps() {
        let rows = classification_rows(50);
        let prepared = fit_transform(&rows, &classification_config(), None)
            .await
            .unwrap();

        let meta = &prepared.metadata;
        assert_eq!(meta.feature_types["category"], FeatureType::Categorical);
        assert_eq!(meta.category_maps["category"], vec!["A", "B", "C"]);
        assert_eq!(meta.category_maps["region"], vec!["E", "N", "S", "W"]);
        // 2 numeric + 3 categories + 4 regions
        assert_eq!(meta.input_dim(), 9);
        assert_eq!(meta.label_dim, 2);
        assert_eq!(prepared.y_train.ncols(), 2);

        // Every label row is exactly one-hot.
        for row in prepared.y_train.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
    }

    #[tokio::test]
    async fn determinism_under_seed() {
        let rows = classification_rows(50);
        let a = fit_transform(&rows, &classification_config(), None)
            .await
            .unwrap();
        let b = fit_transform(&rows, &classification_config(), None)
            .await
            .unwrap();
        assert_eq!(a.dataset_hash, b.dataset_hash);
        assert_eq!(a.x_train, b.x_train);
        for (sa, sb) in a
            .metadata
            .normalization
            .iter()
            .zip(&b.metadata.normalization)
        {
            assert_abs_diff_eq!(sa.mean, sb.mean, epsilon = 1e-6);
            assert_abs_diff_eq!(sa.std, sb.std, epsilon = 1e-6);
        }
    }

    #[tokio::test]
    async fn normalization_has_positive_std() {
        let rows: Vec<Row> = (0..40)
            .map(|i| {
                let mut r = Row::new();
                r.insert("month".into(), FeatureValue::Number(1.0 + (i % 12) as f64));
                r.insert(
                    "marketing_spend".into(),
                    FeatureValue::Number(1_000.0 + (i as f64) * 125.0),
                );
                r.insert(
                    "temperature".into(),
                    FeatureValue::Number(10.0 + (i % 30) as f64),
                );
                r.insert(
                    "revenue".into(),
                    FeatureValue::Number(5_000.0 + (i as f64) * 500.0),
                );
                r
            })
            .collect();
        let config = PrepConfig {
            features: vec![
                "month".into(),
                "marketing_spend".into(),
                "temperature".into(),
            ],
            target: Some("revenue".into()),
            text_features: vec![],
            use_embeddings: false,
            model_kind: ModelKind::Regression,
            max_categorical: 100,
            seed: 7,
        };
        let prepared = fit_transform(&rows, &config, None).await.unwrap();
        assert!(prepared.metadata.normalization.iter().all(|s| s.std > 0.0));
        assert_eq!(prepared.metadata.label_dim, 1);
    }

    #[tokio::test]
    async fn replay_matches_training_encoding() {
        let rows = classification_rows(50);
        let prepared = fit_transform(&rows, &classification_config(), None)
            .await
            .unwrap();

        // Re-encode the first row through the inference path and compare
        // against a fresh fit of the same data.
        let replayed = transform_input(&rows[0], &prepared.metadata, None).await;
        let mut expected = encode_row(&rows[0], &prepared.metadata, None);
        normalize(&mut expected, &prepared.metadata);
        assert_eq!(replayed.to_vec(), expected);
    }

    #[tokio::test]
    async fn sorted_category_lists_for_low_cardinality_text() {
        let rows: Vec<Row> = (0..20)
            .map(|i| {
                let mut r = Row::new();
                r.insert(
                    "category".into(),
                    FeatureValue::Text(["bug", "feature", "question", "other"][i % 4].into()),
                );
                r.insert(
                    "sentiment".into(),
                    FeatureValue::Text(["positive", "negative", "neutral"][i % 3].into()),
                );
                r.insert("label".into(), FeatureValue::Number((i % 2) as f64));
                r
            })
            .collect();
        let config = PrepConfig {
            features: vec!["category".into(), "sentiment".into()],
            target: Some("label".into()),
            text_features: vec![],
            use_embeddings: false,
            model_kind: ModelKind::Classification,
            max_categorical: 100,
            seed: 42,
        };
        let prepared = fit_transform(&rows, &config, None).await.unwrap();
        assert_eq!(
            prepared.metadata.feature_types["category"],
            FeatureType::Categorical
        );
        assert_eq!(
            prepared.metadata.category_maps["sentiment"],
            vec!["negative", "neutral", "positive"]
        );
    }
}
