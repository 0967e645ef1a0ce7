//! Evaluation metric routines shared by training, comparison, the evaluate
//! endpoint and A/B result aggregation.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub per_class: Vec<ClassMetrics>,
}

impl ClassificationMetrics {
    pub fn into_map(self) -> HashMap<String, f64> {
        let mut map = HashMap::new();
        map.insert("accuracy".into(), self.accuracy);
        map.insert("precision".into(), self.macro_precision);
        map.insert("recall".into(), self.macro_recall);
        map.insert("f1".into(), self.macro_f1);
        map
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mape: Option<f64>,
}

impl RegressionMetrics {
    pub fn into_map(self) -> HashMap<String, f64> {
        let mut map = HashMap::new();
        map.insert("mse".into(), self.mse);
        map.insert("rmse".into(), self.rmse);
        map.insert("mae".into(), self.mae);
        map.insert("r2".into(), self.r2);
        if let Some(mape) = self.mape {
            map.insert("mape".into(), mape);
        }
        map
    }
}

fn argmax(row: ndarray::ArrayView1<f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > best_value {
            best_value = v;
            best = i;
        }
    }
    best
}

/// Macro-averaged classification metrics over one-hot labels.
pub fn classification_metrics(
    predicted: &Array2<f32>,
    expected: &Array2<f32>,
) -> ClassificationMetrics {
    let n = predicted.nrows();
    let classes = predicted.ncols().max(1);
    let mut true_positive = vec![0usize; classes];
    let mut false_positive = vec![0usize; classes];
    let mut false_negative = vec![0usize; classes];
    let mut support = vec![0usize; classes];
    let mut correct = 0usize;

    for i in 0..n {
        let predicted_class = argmax(predicted.row(i));
        let actual_class = argmax(expected.row(i));
        support[actual_class] += 1;
        if predicted_class == actual_class {
            correct += 1;
            true_positive[actual_class] += 1;
        } else {
            false_positive[predicted_class] += 1;
            false_negative[actual_class] += 1;
        }
    }

    let mut per_class = Vec::with_capacity(classes);
    for c in 0..classes {
        let precision = if true_positive[c] + false_positive[c] == 0 {
            0.0
        } else {
            true_positive[c] as f64 / (true_positive[c] + false_positive[c]) as f64
        };
        let recall = if true_positive[c] + false_negative[c] == 0 {
            0.0
        } else {
            true_positive[c] as f64 / (true_positive[c] + false_negative[c]) as f64
        };
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };
        per_class.push(ClassMetrics {
            precision,
            recall,
            f1,
            support: support[c],
        });
    }

    let macro_avg = |f: fn(&ClassMetrics) -> f64| {
        per_class.iter().map(f).sum::<f64>() / classes as f64
    };

    ClassificationMetrics {
        accuracy: if n == 0 { 0.0 } else { correct as f64 / n as f64 },
        macro_precision: macro_avg(|c| c.precision),
        macro_recall: macro_avg(|c| c.recall),
        macro_f1: macro_avg(|c| c.f1),
        per_class,
    }
}

/// Regression metrics; MAPE is omitted when any true value is zero.
pub fn regression_metrics(predicted: &Array2<f32>, expected: &Array2<f32>) -> RegressionMetrics {
    let n = predicted.len().max(1) as f64;
    let mut squared = 0.0;
    let mut absolute = 0.0;
    let mut percentage = 0.0;
    let mut mape_defined = true;

    let mean_expected = expected.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mut total_variance = 0.0;

    for (&p, &y) in predicted.iter().zip(expected.iter()) {
        let (p, y) = (p as f64, y as f64);
        let d = p - y;
        squared += d * d;
        absolute += d.abs();
        total_variance += (y - mean_expected).powi(2);
        if y == 0.0 {
            mape_defined = false;
        } else {
            percentage += (d / y).abs();
        }
    }

    let mse = squared / n;
    RegressionMetrics {
        mse,
        rmse: mse.sqrt(),
        mae: absolute / n,
        r2: if total_variance == 0.0 {
            0.0
        } else {
            1.0 - squared / total_variance
        },
        mape: mape_defined.then(|| percentage / n * 100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn perfect_classifier_scores_one() {
        let y = array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.0]];
        let m = classification_metrics(&y, &y);
        assert_abs_diff_eq!(m.accuracy, 1.0);
        assert_abs_diff_eq!(m.macro_f1, 1.0);
        assert_eq!(m.per_class[0].support, 2);
    }

    #[test]
    fn misclassification_hits_the_right_class() {
        let predicted = array![[0.9, 0.1], [0.8, 0.2]];
        let expected = array![[1.0, 0.0], [0.0, 1.0]];
        let m = classification_metrics(&predicted, &expected);
        assert_abs_diff_eq!(m.accuracy, 0.5);
        // Class 0 was predicted twice, once wrongly.
        assert_abs_diff_eq!(m.per_class[0].precision, 0.5);
        assert_abs_diff_eq!(m.per_class[1].recall, 0.0);
    }

    #[test]
    fn regression_metrics_match_hand_values() {
        let predicted = array![[2.0], [4.0]];
        let expected = array![[1.0], [5.0]];
        let m = regression_metrics(&predicted, &expected);
        assert_abs_diff_eq!(m.mse, 1.0);
        assert_abs_diff_eq!(m.rmse, 1.0);
        assert_abs_diff_eq!(m.mae, 1.0);
        assert!(m.mape.is_some());
    }

    #[test]
    fn mape_is_omitted_for_zero_targets() {
        let predicted = array![[1.0], [2.0]];
        let expected = array![[0.0], [2.0]];
        assert!(regression_metrics(&predicted, &expected).mape.is_none());
    }

    #[test]
    fn r2_of_exact_fit_is_one() {
        let y = array![[1.0], [2.0], [3.0]];
        assert_abs_diff_eq!(regression_metrics(&y, &y).r2, 1.0);
    }
}
