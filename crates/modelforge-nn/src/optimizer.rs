use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OptimizerSpec {
    Adam { learning_rate: f32 },
    Sgd { learning_rate: f32 },
    Rmsprop { learning_rate: f32 },
}

impl OptimizerSpec {
    pub fn parse(name: &str, learning_rate: f32) -> Self {
        match name {
            "sgd" => OptimizerSpec::Sgd { learning_rate },
            "rmsprop" => OptimizerSpec::Rmsprop { learning_rate },
            _ => OptimizerSpec::Adam { learning_rate },
        }
    }

    pub fn learning_rate(&self) -> f32 {
        match self {
            OptimizerSpec::Adam { learning_rate }
            | OptimizerSpec::Sgd { learning_rate }
            | OptimizerSpec::Rmsprop { learning_rate } => *learning_rate,
        }
    }

    pub fn with_learning_rate(&self, learning_rate: f32) -> Self {
        match self {
            OptimizerSpec::Adam { .. } => OptimizerSpec::Adam { learning_rate },
            OptimizerSpec::Sgd { .. } => OptimizerSpec::Sgd { learning_rate },
            OptimizerSpec::Rmsprop { .. } => OptimizerSpec::Rmsprop { learning_rate },
        }
    }
}

const BETA1: f32 = 0.9;
const BETA2: f32 = 0.999;
const EPS: f32 = 1e-8;
const RMS_DECAY: f32 = 0.9;

/// Per-parameter-tensor optimizer state (first/second moments).
#[derive(Debug, Clone, Default)]
pub struct MomentPair {
    pub m: Option<Array2<f32>>,
    pub v: Option<Array2<f32>>,
    pub t: u64,
}

impl MomentPair {
    pub fn update(&mut self, spec: &OptimizerSpec, param: &mut Array2<f32>, grad: &Array2<f32>) {
        match spec {
            OptimizerSpec::Sgd { learning_rate } => {
                param.scaled_add(-learning_rate, grad);
            }
            OptimizerSpec::Rmsprop { learning_rate } => {
                let v = self
                    .v
                    .get_or_insert_with(|| Array2::zeros(param.raw_dim()));
                v.zip_mut_with(grad, |vi, gi| {
                    *vi = RMS_DECAY * *vi + (1.0 - RMS_DECAY) * gi * gi
                });
                param
                    .iter_mut()
                    .zip(v.iter().zip(grad.iter()))
                    .for_each(|(p, (vi, gi))| *p -= learning_rate * gi / (vi.sqrt() + EPS));
            }
            OptimizerSpec::Adam { learning_rate } => {
                self.t += 1;
                let m = self
                    .m
                    .get_or_insert_with(|| Array2::zeros(param.raw_dim()));
                let v = self
                    .v
                    .get_or_insert_with(|| Array2::zeros(param.raw_dim()));
                m.zip_mut_with(grad, |mi, gi| *mi = BETA1 * *mi + (1.0 - BETA1) * gi);
                v.zip_mut_with(grad, |vi, gi| *vi = BETA2 * *vi + (1.0 - BETA2) * gi * gi);
                let bias1 = 1.0 - BETA1.powi(self.t as i32);
                let bias2 = 1.0 - BETA2.powi(self.t as i32);
                param
                    .iter_mut()
                    .zip(m.iter().zip(v.iter()))
                    .for_each(|(p, (mi, vi))| {
                        let m_hat = mi / bias1;
                        let v_hat = vi / bias2;
                        *p -= learning_rate * m_hat / (v_hat.sqrt() + EPS);
                    });
            }
        }
    }

    /// Bias update via the 2-D path by viewing the vector as a 1 x n matrix.
    pub fn update_bias(&mut self, spec: &OptimizerSpec, param: &mut Array1<f32>, grad: &Array1<f32>) {
        let mut as_matrix = param
            .clone()
            .into_shape_with_order((1, param.len()))
            .expect("bias reshape");
        let grad_matrix = grad
            .clone()
            .into_shape_with_order((1, grad.len()))
            .expect("bias grad reshape");
        self.update(spec, &mut as_matrix, &grad_matrix);
        param.assign(
            &as_matrix
                .into_shape_with_order(param.len())
                .expect("bias restore"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn sgd_moves_against_gradient() {
        let spec = OptimizerSpec::Sgd { learning_rate: 0.1 };
        let mut state = MomentPair::default();
        let mut param = array![[1.0_f32]];
        state.update(&spec, &mut param, &array![[2.0_f32]]);
        assert!((param[[0, 0]] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn adam_converges_on_quadratic() {
        // Minimize f(x) = x^2 from x = 5.
        let spec = OptimizerSpec::Adam { learning_rate: 0.1 };
        let mut state = MomentPair::default();
        let mut param = array![[5.0_f32]];
        for _ in 0..500 {
            let grad = &param * 2.0;
            state.update(&spec, &mut param, &grad);
        }
        assert!(param[[0, 0]].abs() < 0.1);
    }

    #[test]
    fn parse_defaults_to_adam() {
        assert_eq!(
            OptimizerSpec::parse("mystery", 0.01),
            OptimizerSpec::Adam { learning_rate: 0.01 }
        );
    }
}
