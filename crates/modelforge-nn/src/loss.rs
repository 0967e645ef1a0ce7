use ndarray::Array2;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    CategoricalCrossEntropy,
    BinaryCrossEntropy,
    MeanSquaredError,
}

impl Loss {
    pub fn compute(&self, predicted: &Array2<f32>, expected: &Array2<f32>) -> f32 {
        let n = predicted.nrows().max(1) as f32;
        match self {
            Loss::CategoricalCrossEntropy => {
                let mut total = 0.0;
                for (p, y) in predicted.iter().zip(expected.iter()) {
                    if *y > 0.0 {
                        total -= y * p.max(1e-7).ln();
                    }
                }
                total / n
            }
            Loss::BinaryCrossEntropy => {
                let mut total = 0.0;
                for (p, y) in predicted.iter().zip(expected.iter()) {
                    let p = p.clamp(1e-7, 1.0 - 1e-7);
                    total -= y * p.ln() + (1.0 - y) * (1.0 - p).ln();
                }
                total / (predicted.len().max(1) as f32)
            }
            Loss::MeanSquaredError => {
                let mut total = 0.0;
                for (p, y) in predicted.iter().zip(expected.iter()) {
                    let d = p - y;
                    total += d * d;
                }
                total / (predicted.len().max(1) as f32)
            }
        }
    }

    /// Gradient with respect to the output layer's pre-activation.
    ///
    /// Softmax+CCE and sigmoid+BCE both collapse to `predicted - expected`,
    /// which is why the output activation reports an identity derivative
    /// for softmax. MSE keeps the conventional 2/n factor folded into the
    /// learning rate.
    pub fn output_gradient(&self, predicted: &Array2<f32>, expected: &Array2<f32>) -> Array2<f32> {
        let n = predicted.nrows().max(1) as f32;
        (predicted - expected) / n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn perfect_prediction_has_near_zero_loss() {
        let y = array![[0.0, 1.0], [1.0, 0.0]];
        let p = array![[0.001, 0.999], [0.999, 0.001]];
        assert!(Loss::CategoricalCrossEntropy.compute(&p, &y) < 0.01);
    }

    #[test]
    fn mse_matches_hand_computation() {
        let y = array![[1.0], [2.0]];
        let p = array![[2.0], [2.0]];
        assert_abs_diff_eq!(Loss::MeanSquaredError.compute(&p, &y), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn gradient_points_toward_target() {
        let y = array![[0.0, 1.0]];
        let p = array![[0.7, 0.3]];
        let g = Loss::CategoricalCrossEntropy.output_gradient(&p, &y);
        assert!(g[[0, 0]] > 0.0);
        assert!(g[[0, 1]] < 0.0);
    }
}
