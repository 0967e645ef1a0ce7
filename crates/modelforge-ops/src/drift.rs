//! Statistical data-drift detection between a reference window of inputs
//! and a new window. Four per-feature divergence methods; the overall
//! score is the per-feature maximum.

use modelforge_core::config::DriftSettings;
use modelforge_core::{FeatureValue, ForgeError, ModelId, Result, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftMethod {
    Psi,
    Ks,
    ChiSquare,
    Wasserstein,
}

impl DriftMethod {
    pub fn parse(name: &str) -> DriftMethod {
        match name {
            "ks" => DriftMethod::Ks,
            "chi_square" => DriftMethod::ChiSquare,
            "wasserstein" => DriftMethod::Wasserstein,
            _ => DriftMethod::Psi,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureDrift {
    pub feature: String,
    pub score: f64,
    pub method: DriftMethod,
    pub affected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub model_id: ModelId,
    pub overall_score: f64,
    pub drifting: bool,
    pub features: Vec<FeatureDrift>,
    pub recommendations: Vec<String>,
    pub reference_count: usize,
    pub current_count: usize,
}

/// Destination for drift alerts; wire Slack/email/webhooks behind this.
pub trait AlertSink: Send + Sync {
    fn alert(&self, report: &DriftReport);
}

/// Default sink: structured log lines.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, report: &DriftReport) {
        warn!(
            model_id = %report.model_id,
            score = report.overall_score,
            affected = report.features.iter().filter(|f| f.affected).count(),
            "data drift detected"
        );
    }
}

pub struct DriftDetector {
    settings: DriftSettings,
    sinks: Vec<Box<dyn AlertSink>>,
}

impl DriftDetector {
    pub fn new(settings: DriftSettings) -> Self {
        Self {
            settings,
            sinks: vec![Box::new(LogAlertSink)],
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Compare input windows feature by feature. Numeric features run the
    /// configured method; categorical features always use chi-square on
    /// value-count tables.
    pub fn detect(
        &self,
        model_id: ModelId,
        features: &[String],
        reference: &[Row],
        current: &[Row],
        method_override: Option<DriftMethod>,
    ) -> Result<DriftReport> {
        if reference.len() < self.settings.min_samples || current.len() < self.settings.min_samples
        {
            return Err(ForgeError::Validation(format!(
                "drift detection needs at least {} samples per window",
                self.settings.min_samples
            )));
        }
        let method = method_override.unwrap_or_else(|| DriftMethod::parse(&self.settings.method));

        let mut per_feature = Vec::new();
        for feature in features {
            let ref_numeric = numeric_column(reference, feature);
            let cur_numeric = numeric_column(current, feature);

            let (score, used) = if ref_numeric.len() * 2 >= reference.len() {
                let score = match method {
                    DriftMethod::Psi => psi(&ref_numeric, &cur_numeric),
                    DriftMethod::Ks => ks_distance(&ref_numeric, &cur_numeric),
                    DriftMethod::Wasserstein => wasserstein(&ref_numeric, &cur_numeric),
                    DriftMethod::ChiSquare => {
                        chi_square(&count_values(reference, feature), &count_values(current, feature))
                    }
                };
                (score, method)
            } else {
                // Mostly non-numeric: count-table chi-square.
                (
                    chi_square(&count_values(reference, feature), &count_values(current, feature)),
                    DriftMethod::ChiSquare,
                )
            };

            per_feature.push(FeatureDrift {
                feature: feature.clone(),
                score,
                method: used,
                affected: score > self.settings.threshold,
            });
        }

        let overall_score = per_feature.iter().map(|f| f.score).fold(0.0, f64::max);
        let drifting = overall_score > self.settings.threshold;
        let recommendations = recommendations(&per_feature, drifting);

        let report = DriftReport {
            model_id,
            overall_score,
            drifting,
            features: per_feature,
            recommendations,
            reference_count: reference.len(),
            current_count: current.len(),
        };

        if report.drifting {
            for sink in &self.sinks {
                sink.alert(&report);
            }
        } else {
            info!(model_id = %model_id, score = report.overall_score, "no significant drift");
        }
        Ok(report)
    }
}

fn numeric_column(rows: &[Row], feature: &str) -> Vec<f64> {
    rows.iter()
        .filter_map(|r| r.get(feature))
        .filter_map(|v| match v {
            FeatureValue::Number(n) if !n.is_nan() => Some(*n),
            FeatureValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        })
        .collect()
}

fn count_values(rows: &[Row], feature: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for row in rows {
        if let Some(value) = row.get(feature) {
            if !value.is_absent() {
                *counts.entry(value.canonical_string()).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// Population-stability index over a 10-bin histogram spanning the joint
/// numeric range of both windows.
pub fn psi(reference: &[f64], current: &[f64]) -> f64 {
    const BINS: usize = 10;
    if reference.is_empty() || current.is_empty() {
        return 0.0;
    }
    let min = reference
        .iter()
        .chain(current)
        .copied()
        .fold(f64::INFINITY, f64::min);
    let max = reference
        .iter()
        .chain(current)
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    if (max - min).abs() < f64::EPSILON {
        return 0.0;
    }
    let width = (max - min) / BINS as f64;
    let histogram = |values: &[f64]| -> Vec<f64> {
        let mut bins = vec![0usize; BINS];
        for &v in values {
            let idx = (((v - min) / width) as usize).min(BINS - 1);
            bins[idx] += 1;
        }
        bins.into_iter()
            // Small floor keeps empty bins from producing infinities.
            .map(|c| (c as f64 / values.len() as f64).max(1e-4))
            .collect()
    };

    let ref_bins = histogram(reference);
    let cur_bins = histogram(current);
    ref_bins
        .iter()
        .zip(&cur_bins)
        .map(|(r, c)| (c - r) * (c / r).ln())
        .sum::<f64>()
        .max(0.0)
}

/// Two-sample Kolmogorov-Smirnov statistic: the maximum distance between
/// the empirical CDFs.
pub fn ks_distance(reference: &[f64], current: &[f64]) -> f64 {
    if reference.is_empty() || current.is_empty() {
        return 0.0;
    }
    let mut a = reference.to_vec();
    let mut b = current.to_vec();
    a.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    b.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));

    let mut max_distance: f64 = 0.0;
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        if a[i] <= b[j] {
            i += 1;
        } else {
            j += 1;
        }
        let cdf_a = i as f64 / a.len() as f64;
        let cdf_b = j as f64 / b.len() as f64;
        max_distance = max_distance.max((cdf_a - cdf_b).abs());
    }
    max_distance
}

/// Chi-square statistic on value-count tables, normalized by the total
/// count so the score stays comparable across window sizes.
pub fn chi_square(reference: &BTreeMap<String, usize>, current: &BTreeMap<String, usize>) -> f64 {
    let ref_total: usize = reference.values().sum();
    let cur_total: usize = current.values().sum();
    if ref_total == 0 || cur_total == 0 {
        return 0.0;
    }

    let mut keys: Vec<&String> = reference.keys().chain(current.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut statistic = 0.0;
    for key in keys {
        let expected = *reference.get(key).unwrap_or(&0) as f64 / ref_total as f64;
        let observed = *current.get(key).unwrap_or(&0) as f64 / cur_total as f64;
        let denom = expected.max(1e-4);
        statistic += (observed - expected).powi(2) / denom;
    }
    statistic
}

/// 1-D Wasserstein approximation: mean absolute difference between
/// matched quantiles of the sorted samples.
pub fn wasserstein(reference: &[f64], current: &[f64]) -> f64 {
    if reference.is_empty() || current.is_empty() {
        return 0.0;
    }
    let mut a = reference.to_vec();
    let mut b = current.to_vec();
    a.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    b.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));

    const QUANTILES: usize = 100;
    let pick = |sorted: &[f64], q: usize| -> f64 {
        let pos = (q as f64 / QUANTILES as f64) * (sorted.len() - 1) as f64;
        sorted[pos.round() as usize]
    };
    let spread = (a[a.len() - 1] - a[0]).abs().max(1e-9);
    let total: f64 = (0..=QUANTILES)
        .map(|q| (pick(&a, q) - pick(&b, q)).abs())
        .sum();
    // Scale by the reference spread so thresholds are unit-free.
    total / (QUANTILES + 1) as f64 / spread
}

fn recommendations(features: &[FeatureDrift], drifting: bool) -> Vec<String> {
    let mut out = Vec::new();
    if !drifting {
        return out;
    }
    let affected: Vec<&str> = features
        .iter()
        .filter(|f| f.affected)
        .map(|f| f.feature.as_str())
        .collect();
    out.push(format!(
        "input distribution shifted on: {}",
        affected.join(", ")
    ));
    out.push("consider retraining with recent data".to_string());
    if affected.len() > 1 {
        out.push("review upstream pipelines feeding the affected features".to_string());
    }
    out
}
