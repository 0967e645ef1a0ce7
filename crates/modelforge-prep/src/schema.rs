//! Declared-schema pipeline: validation, imputation, outlier handling and
//! scaling for callers that describe their data up front. Its output can be
//! consumed directly as a tensor or fed into the encoding pipeline.

use crate::error::{PrepError, Result};
use crate::metadata::FeatureType;
use modelforge_core::{FeatureValue, Row};
use ndarray::Array2;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldConstraint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FeatureType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub constraint: FieldConstraint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Imputation {
    Mean,
    Median,
    Mode,
    Zero,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierPolicy {
    /// Clip to median +- 1.5 * IQR.
    ClipIqr,
    Remove,
    LogTransform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scaling {
    Standard,
    MinMax,
    Robust,
}

/// Fitted scaling parameters per numeric output column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScaleParam {
    Standard { mean: f64, std: f64 },
    MinMax { min: f64, max: f64 },
    Robust { median: f64, iqr: f64 },
    Identity,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldViolation {
    pub row: usize,
    pub field: String,
    pub message: String,
}

#[derive(Debug, Default, Serialize)]
pub struct SchemaReport {
    pub violations: Vec<FieldViolation>,
    pub rows_dropped: usize,
    pub values_imputed: usize,
}

#[derive(Debug)]
pub struct SchemaOutput {
    pub matrix: Array2<f32>,
    /// Output column names, expanded for one-hot categoricals.
    pub columns: Vec<String>,
    pub scale_params: Vec<ScaleParam>,
    pub report: SchemaReport,
}

#[derive(Debug, Clone)]
pub struct SchemaPipeline {
    pub fields: Vec<FieldSchema>,
    pub imputation: Imputation,
    pub outliers: Option<OutlierPolicy>,
    pub scaling: Option<Scaling>,
}

impl SchemaPipeline {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self {
            fields,
            imputation: Imputation::Zero,
            outliers: None,
            scaling: None,
        }
    }

    pub fn with_imputation(mut self, imputation: Imputation) -> Self {
        self.imputation = imputation;
        self
    }

    pub fn with_outliers(mut self, policy: OutlierPolicy) -> Self {
        self.outliers = Some(policy);
        self
    }

    pub fn with_scaling(mut self, scaling: Scaling) -> Self {
        self.scaling = Some(scaling);
        self
    }

    /// Validate rows against the declared constraints without mutating them.
    pub fn validate(&self, rows: &[Row]) -> Vec<FieldViolation> {
        let mut violations = Vec::new();
        let patterns: BTreeMap<&str, Option<Regex>> = self
            .fields
            .iter()
            .map(|f| {
                (
                    f.name.as_str(),
                    f.constraint.pattern.as_deref().and_then(|p| Regex::new(p).ok()),
                )
            })
            .collect();

        for (row_idx, row) in rows.iter().enumerate() {
            for field in &self.fields {
                let value = row.get(&field.name).unwrap_or(&FeatureValue::Absent);
                if value.is_absent() {
                    if field.required {
                        violations.push(FieldViolation {
                            row: row_idx,
                            field: field.name.clone(),
                            message: "required field is missing".into(),
                        });
                    }
                    continue;
                }
                match field.field_type {
                    FeatureType::Numeric => {
                        let Some(n) = value.as_number() else {
                            violations.push(FieldViolation {
                                row: row_idx,
                                field: field.name.clone(),
                                message: "expected a numeric value".into(),
                            });
                            continue;
                        };
                        if let Some(min) = field.constraint.min {
                            if n < min {
                                violations.push(FieldViolation {
                                    row: row_idx,
                                    field: field.name.clone(),
                                    message: format!("{n} is below minimum {min}"),
                                });
                            }
                        }
                        if let Some(max) = field.constraint.max {
                            if n > max {
                                violations.push(FieldViolation {
                                    row: row_idx,
                                    field: field.name.clone(),
                                    message: format!("{n} is above maximum {max}"),
                                });
                            }
                        }
                    }
                    FeatureType::Boolean => {
                        if !matches!(value, FeatureValue::Bool(_)) && value.as_number().is_none() {
                            violations.push(FieldViolation {
                                row: row_idx,
                                field: field.name.clone(),
                                message: "expected a boolean value".into(),
                            });
                        }
                    }
                    FeatureType::Categorical | FeatureType::Text => {
                        let text = value.canonical_string();
                        if let Some(allowed) = &field.constraint.allowed {
                            if !allowed.contains(&text) {
                                violations.push(FieldViolation {
                                    row: row_idx,
                                    field: field.name.clone(),
                                    message: format!("'{text}' is not an allowed value"),
                                });
                            }
                        }
                        if let Some(Some(regex)) = patterns.get(field.name.as_str()) {
                            if !regex.is_match(&text) {
                                violations.push(FieldViolation {
                                    row: row_idx,
                                    field: field.name.clone(),
                                    message: "value does not match the declared pattern".into(),
                                });
                            }
                        }
                        if let Some(min_len) = field.constraint.min_length {
                            if text.chars().count() < min_len {
                                violations.push(FieldViolation {
                                    row: row_idx,
                                    field: field.name.clone(),
                                    message: format!("shorter than {min_len} characters"),
                                });
                            }
                        }
                        if let Some(max_len) = field.constraint.max_length {
                            if text.chars().count() > max_len {
                                violations.push(FieldViolation {
                                    row: row_idx,
                                    field: field.name.clone(),
                                    message: format!("longer than {max_len} characters"),
                                });
                            }
                        }
                    }
                }
            }
        }
        violations
    }

    /// Validate, impute, handle outliers, scale, and emit the tensor.
    pub fn fit_transform(&self, rows: &[Row]) -> Result<SchemaOutput> {
        if rows.is_empty() {
            return Err(PrepError::EmptyDataset);
        }

        let mut report = SchemaReport {
            violations: self.validate(rows),
            ..Default::default()
        };

        // Numeric column extraction with imputation.
        let mut kept: Vec<bool> = vec![true; rows.len()];
        let mut numeric_cols: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for field in self.fields.iter().filter(|f| {
            matches!(f.field_type, FeatureType::Numeric | FeatureType::Boolean)
        }) {
            let raw: Vec<Option<f64>> = rows
                .iter()
                .map(|r| r.get(&field.name).and_then(|v| v.as_number()))
                .collect();
            let filled = self.impute(&raw, &mut kept, &mut report);
            numeric_cols.insert(field.name.as_str(), filled);
        }

        // Outlier handling applies to numeric columns only.
        if let Some(policy) = self.outliers {
            for field in self
                .fields
                .iter()
                .filter(|f| f.field_type == FeatureType::Numeric)
            {
                if let Some(col) = numeric_cols.get_mut(field.name.as_str()) {
                    apply_outlier_policy(policy, col, &mut kept);
                }
            }
        }

        let keep_ids: Vec<usize> = (0..rows.len()).filter(|&i| kept[i]).collect();
        report.rows_dropped = rows.len() - keep_ids.len();
        if keep_ids.is_empty() {
            return Err(PrepError::Schema("all rows dropped by the pipeline".into()));
        }

        // Assemble output columns: numerics/booleans first, then one-hot
        // categoricals in declaration order.
        let mut columns = Vec::new();
        let mut data: Vec<Vec<f64>> = Vec::new();
        let mut scale_params = Vec::new();

        for field in &self.fields {
            match field.field_type {
                FeatureType::Numeric | FeatureType::Boolean => {
                    let col = &numeric_cols[field.name.as_str()];
                    let values: Vec<f64> = keep_ids.iter().map(|&i| col[i]).collect();
                    let (scaled, param) = if field.field_type == FeatureType::Numeric {
                        scale_column(self.scaling, values)
                    } else {
                        (values, ScaleParam::Identity)
                    };
                    columns.push(field.name.clone());
                    scale_params.push(param);
                    data.push(scaled);
                }
                FeatureType::Categorical => {
                    let mut categories: Vec<String> = rows
                        .iter()
                        .filter_map(|r| r.get(&field.name))
                        .filter(|v| !v.is_absent())
                        .map(|v| v.canonical_string())
                        .collect::<std::collections::BTreeSet<_>>()
                        .into_iter()
                        .collect();
                    categories.sort();
                    for category in &categories {
                        let col: Vec<f64> = keep_ids
                            .iter()
                            .map(|&i| {
                                let hit = rows[i]
                                    .get(&field.name)
                                    .map(|v| v.canonical_string() == *category)
                                    .unwrap_or(false);
                                if hit {
                                    1.0
                                } else {
                                    0.0
                                }
                            })
                            .collect();
                        columns.push(format!("{}={category}", field.name));
                        scale_params.push(ScaleParam::Identity);
                        data.push(col);
                    }
                }
                FeatureType::Text => {
                    // Text fields contribute their character count; richer
                    // text handling belongs to the encoding pipeline.
                    let col: Vec<f64> = keep_ids
                        .iter()
                        .map(|&i| {
                            rows[i]
                                .get(&field.name)
                                .filter(|v| !v.is_absent())
                                .map(|v| v.canonical_string().chars().count() as f64)
                                .unwrap_or(0.0)
                        })
                        .collect();
                    let (scaled, param) = scale_column(self.scaling, col);
                    columns.push(format!("{}.length", field.name));
                    scale_params.push(param);
                    data.push(scaled);
                }
            }
        }

        let mut matrix = Array2::zeros((keep_ids.len(), columns.len()));
        for (c, col) in data.iter().enumerate() {
            for (r, &v) in col.iter().enumerate() {
                matrix[[r, c]] = v as f32;
            }
        }

        debug!(
            rows_in = rows.len(),
            rows_out = keep_ids.len(),
            columns = columns.len(),
            "schema pipeline applied"
        );

        Ok(SchemaOutput {
            matrix,
            columns,
            scale_params,
            report,
        })
    }

    fn impute(
        &self,
        raw: &[Option<f64>],
        kept: &mut [bool],
        report: &mut SchemaReport,
    ) -> Vec<f64> {
        let present: Vec<f64> = raw.iter().flatten().copied().collect();
        let fill = match self.imputation {
            Imputation::Zero => 0.0,
            Imputation::Mean => {
                if present.is_empty() {
                    0.0
                } else {
                    present.iter().sum::<f64>() / present.len() as f64
                }
            }
            Imputation::Median => median(&present),
            Imputation::Mode => mode(&present),
            Imputation::Drop => 0.0,
        };

        raw.iter()
            .enumerate()
            .map(|(i, v)| match v {
                Some(n) => *n,
                None => {
                    if self.imputation == Imputation::Drop {
                        kept[i] = false;
                    } else {
                        report.values_imputed += 1;
                    }
                    fill
                }
            })
            .collect()
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn mode(values: &[f64]) -> f64 {
    let mut counts: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for &v in values {
        let entry = counts.entry(format!("{v}")).or_insert((v, 0));
        entry.1 += 1;
    }
    counts
        .values()
        .max_by_key(|(_, count)| *count)
        .map(|(v, _)| *v)
        .unwrap_or(0.0)
}

fn quartiles(values: &[f64]) -> (f64, f64, f64) {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let q = |p: f64| -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let pos = p * (sorted.len() - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        if lo == hi {
            sorted[lo]
        } else {
            sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
        }
    };
    (q(0.25), q(0.5), q(0.75))
}

fn apply_outlier_policy(policy: OutlierPolicy, col: &mut [f64], kept: &mut [bool]) {
    let present: Vec<f64> = col.to_vec();
    let (q1, _median, q3) = quartiles(&present);
    let iqr = q3 - q1;
    let lo = q1 - 1.5 * iqr;
    let hi = q3 + 1.5 * iqr;

    match policy {
        OutlierPolicy::ClipIqr => {
            for v in col.iter_mut() {
                *v = v.clamp(lo, hi);
            }
        }
        OutlierPolicy::Remove => {
            for (i, v) in col.iter().enumerate() {
                if *v < lo || *v > hi {
                    kept[i] = false;
                }
            }
        }
        OutlierPolicy::LogTransform => {
            for v in col.iter_mut() {
                *v = (1.0 + v.abs()).ln() * v.signum();
            }
        }
    }
}

fn scale_column(scaling: Option<Scaling>, values: Vec<f64>) -> (Vec<f64>, ScaleParam) {
    match scaling {
        None => (values, ScaleParam::Identity),
        Some(Scaling::Standard) => {
            let n = values.len().max(1) as f64;
            let mean = values.iter().sum::<f64>() / n;
            let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            let std = if std == 0.0 { 1.0 } else { std };
            (
                values.iter().map(|v| (v - mean) / std).collect(),
                ScaleParam::Standard { mean, std },
            )
        }
        Some(Scaling::MinMax) => {
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let span = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                max - min
            };
            (
                values.iter().map(|v| (v - min) / span).collect(),
                ScaleParam::MinMax { min, max },
            )
        }
        Some(Scaling::Robust) => {
            let (q1, median, q3) = quartiles(&values);
            let iqr = if (q3 - q1).abs() < f64::EPSILON {
                1.0
            } else {
                q3 - q1
            };
            (
                values.iter().map(|v| (v - median) / iqr).collect(),
                ScaleParam::Robust { median, iqr },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_field(name: &str) -> FieldSchema {
        FieldSchema {
            name: name.into(),
            field_type: FeatureType::Numeric,
            required: true,
            constraint: FieldConstraint::default(),
        }
    }

    fn rows_with_ages(ages: &[Option<f64>]) -> Vec<Row> {
        ages.iter()
            .map(|a| {
                let mut r = Row::new();
                match a {
                    Some(n) => r.insert("age".into(), FeatureValue::Number(*n)),
                    None => r.insert("age".into(), FeatureValue::Absent),
                };
                r
            })
            .collect()
    }

    #[test]
    fn required_missing_is_a_violation() {
        let pipeline = SchemaPipeline::new(vec![numeric_field("age")]);
        let violations = pipeline.validate(&rows_with_ages(&[Some(3.0), None]));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].row, 1);
    }

    #[test]
    fn bounds_are_enforced() {
        let mut field = numeric_field("age");
        field.constraint.min = Some(0.0);
        field.constraint.max = Some(120.0);
        let pipeline = SchemaPipeline::new(vec![field]);
        let violations = pipeline.validate(&rows_with_ages(&[Some(-1.0), Some(130.0), Some(30.0)]));
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn mean_imputation_fills_gaps() {
        let pipeline =
            SchemaPipeline::new(vec![numeric_field("age")]).with_imputation(Imputation::Mean);
        let out = pipeline
            .fit_transform(&rows_with_ages(&[Some(10.0), None, Some(20.0)]))
            .unwrap();
        assert_eq!(out.report.values_imputed, 1);
        assert_eq!(out.matrix[[1, 0]], 15.0);
    }

    #[test]
    fn drop_imputation_removes_rows() {
        let pipeline =
            SchemaPipeline::new(vec![numeric_field("age")]).with_imputation(Imputation::Drop);
        let out = pipeline
            .fit_transform(&rows_with_ages(&[Some(10.0), None, Some(20.0)]))
            .unwrap();
        assert_eq!(out.report.rows_dropped, 1);
        assert_eq!(out.matrix.nrows(), 2);
    }

    #[test]
    fn iqr_clip_bounds_extremes() {
        let mut values: Vec<Option<f64>> = (0..20).map(|i| Some(i as f64)).collect();
        values.push(Some(1000.0));
        let pipeline =
            SchemaPipeline::new(vec![numeric_field("age")]).with_outliers(OutlierPolicy::ClipIqr);
        let out = pipeline.fit_transform(&rows_with_ages(&values)).unwrap();
        let max = out
            .matrix
            .column(0)
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        assert!(max < 1000.0);
    }

    #[test]
    fn standard_scaling_records_params() {
        let pipeline =
            SchemaPipeline::new(vec![numeric_field("age")]).with_scaling(Scaling::Standard);
        let out = pipeline
            .fit_transform(&rows_with_ages(&[Some(10.0), Some(20.0), Some(30.0)]))
            .unwrap();
        match &out.scale_params[0] {
            ScaleParam::Standard { mean, std } => {
                assert_eq!(*mean, 20.0);
                assert!(*std > 0.0);
            }
            other => panic!("unexpected params: {other:?}"),
        }
    }

    #[test]
    fn categorical_expands_one_hot_columns() {
        let fields = vec![FieldSchema {
            name: "kind".into(),
            field_type: FeatureType::Categorical,
            required: false,
            constraint: FieldConstraint::default(),
        }];
        let rows: Vec<Row> = ["b", "a", "b"]
            .iter()
            .map(|v| {
                let mut r = Row::new();
                r.insert("kind".into(), FeatureValue::Text((*v).into()));
                r
            })
            .collect();
        let out = SchemaPipeline::new(fields).fit_transform(&rows).unwrap();
        assert_eq!(out.columns, vec!["kind=a", "kind=b"]);
        assert_eq!(out.matrix[[0, 1]], 1.0);
        assert_eq!(out.matrix[[1, 0]], 1.0);
    }
}
