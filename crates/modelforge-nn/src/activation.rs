use ndarray::Array2;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Sigmoid,
    Softmax,
    Tanh,
    Linear,
}

impl Activation {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "relu" => Some(Activation::Relu),
            "sigmoid" => Some(Activation::Sigmoid),
            "softmax" => Some(Activation::Softmax),
            "tanh" => Some(Activation::Tanh),
            "linear" => Some(Activation::Linear),
            _ => None,
        }
    }

    /// Apply in place, row-wise for softmax.
    pub fn apply(&self, z: &mut Array2<f32>) {
        match self {
            Activation::Relu => z.mapv_inplace(|v| v.max(0.0)),
            Activation::Sigmoid => z.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp())),
            Activation::Tanh => z.mapv_inplace(f32::tanh),
            Activation::Linear => {}
            Activation::Softmax => {
                for mut row in z.rows_mut() {
                    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    row.mapv_inplace(|v| (v - max).exp());
                    let sum = row.sum().max(f32::EPSILON);
                    row.mapv_inplace(|v| v / sum);
                }
            }
        }
    }

    /// Elementwise derivative with respect to the pre-activation, expressed
    /// through the activated output `a`. Softmax is handled jointly with
    /// cross-entropy in the loss gradient and is the identity here.
    pub fn derivative(&self, a: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Relu => a.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
            Activation::Sigmoid => a.mapv(|v| v * (1.0 - v)),
            Activation::Tanh => a.mapv(|v| 1.0 - v * v),
            Activation::Linear | Activation::Softmax => Array2::ones(a.raw_dim()),
        }
    }
}
