//! Standard architectures, keyed by algorithm and model kind.

use crate::activation::Activation;
use crate::error::{NnError, Result};
use crate::layer::LayerSpec;
use crate::loss::Loss;
use crate::network::NetworkSpec;
use crate::optimizer::OptimizerSpec;
use modelforge_core::{Algorithm, ModelKind};

/// Tunable knobs shared by the standard architectures.
#[derive(Debug, Clone)]
pub struct ArchitectureOptions {
    pub learning_rate: f32,
    pub optimizer: String,
    pub hidden_units: usize,
    pub vocab_size: usize,
    pub embed_dim: usize,
}

impl Default for ArchitectureOptions {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            optimizer: "adam".into(),
            hidden_units: 64,
            vocab_size: 1_000,
            embed_dim: 128,
        }
    }
}

/// Build the spec for one of the standard architectures.
///
/// `output_dim` is the class count for classification heads and ignored by
/// the regression and generic heads, which are fixed single-output.
pub fn build_spec(
    algorithm: Algorithm,
    kind: ModelKind,
    input_dim: usize,
    output_dim: usize,
    options: &ArchitectureOptions,
) -> Result<NetworkSpec> {
    if input_dim == 0 {
        return Err(NnError::Build("input dimension must be non-zero".into()));
    }
    let optimizer = OptimizerSpec::parse(&options.optimizer, options.learning_rate);
    let hidden = options.hidden_units.max(2);

    let spec = match (algorithm, kind) {
        (Algorithm::DenseNn, ModelKind::Classification)
        | (Algorithm::DenseNn, ModelKind::Nlp) => {
            let classes = output_dim.max(2);
            NetworkSpec {
                input_dim,
                layers: vec![
                    LayerSpec::Dense {
                        units: hidden,
                        activation: Activation::Relu,
                    },
                    LayerSpec::Dropout { rate: 0.2 },
                    LayerSpec::Dense {
                        units: hidden / 2,
                        activation: Activation::Relu,
                    },
                    LayerSpec::Dropout { rate: 0.2 },
                    LayerSpec::Dense {
                        units: classes,
                        activation: Activation::Softmax,
                    },
                ],
                loss: Loss::CategoricalCrossEntropy,
                optimizer,
            }
        }
        (Algorithm::DenseNn, ModelKind::Regression) => NetworkSpec {
            input_dim,
            layers: vec![
                LayerSpec::Dense {
                    units: hidden,
                    activation: Activation::Relu,
                },
                LayerSpec::Dropout { rate: 0.2 },
                LayerSpec::Dense {
                    units: hidden / 2,
                    activation: Activation::Relu,
                },
                LayerSpec::Dense {
                    units: 1,
                    activation: Activation::Linear,
                },
            ],
            loss: Loss::MeanSquaredError,
            optimizer,
        },
        (Algorithm::Lstm, ModelKind::Nlp) | (Algorithm::Lstm, ModelKind::Classification) => {
            let classes = output_dim.max(2);
            NetworkSpec {
                input_dim,
                layers: vec![
                    LayerSpec::Embedding {
                        vocab: options.vocab_size.max(2),
                        dim: options.embed_dim.max(2),
                    },
                    LayerSpec::Lstm {
                        units: 64,
                        return_sequences: true,
                    },
                    LayerSpec::Dropout { rate: 0.3 },
                    LayerSpec::Lstm {
                        units: 32,
                        return_sequences: false,
                    },
                    LayerSpec::Dense {
                        units: classes,
                        activation: Activation::Softmax,
                    },
                ],
                loss: Loss::CategoricalCrossEntropy,
                optimizer,
            }
        }
        // Everything else runs the generic binary head.
        _ => NetworkSpec {
            input_dim,
            layers: vec![
                LayerSpec::Dense {
                    units: 128,
                    activation: Activation::Relu,
                },
                LayerSpec::Dropout { rate: 0.3 },
                LayerSpec::Dense {
                    units: 64,
                    activation: Activation::Relu,
                },
                LayerSpec::Dropout { rate: 0.3 },
                LayerSpec::Dense {
                    units: 32,
                    activation: Activation::Relu,
                },
                LayerSpec::Dense {
                    units: 1,
                    activation: Activation::Sigmoid,
                },
            ],
            loss: Loss::BinaryCrossEntropy,
            optimizer,
        },
    };

    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_head_has_softmax_classes() {
        let spec = build_spec(
            Algorithm::DenseNn,
            ModelKind::Classification,
            9,
            3,
            &ArchitectureOptions::default(),
        )
        .unwrap();
        assert_eq!(spec.loss, Loss::CategoricalCrossEntropy);
        let Some(LayerSpec::Dense { units, activation }) = spec.layers.last() else {
            panic!("expected dense head");
        };
        assert_eq!(*units, 3);
        assert_eq!(*activation, Activation::Softmax);
    }

    #[test]
    fn regression_head_is_single_linear() {
        let spec = build_spec(
            Algorithm::DenseNn,
            ModelKind::Regression,
            4,
            1,
            &ArchitectureOptions::default(),
        )
        .unwrap();
        assert_eq!(spec.loss, Loss::MeanSquaredError);
        let Some(LayerSpec::Dense { units, activation }) = spec.layers.last() else {
            panic!("expected dense head");
        };
        assert_eq!(*units, 1);
        assert_eq!(*activation, Activation::Linear);
    }

    #[test]
    fn generic_fallback_is_binary() {
        let spec = build_spec(
            Algorithm::Generic,
            ModelKind::Custom,
            4,
            1,
            &ArchitectureOptions::default(),
        )
        .unwrap();
        assert_eq!(spec.loss, Loss::BinaryCrossEntropy);
        assert_eq!(spec.layers.len(), 6);
    }

    #[test]
    fn lstm_stack_starts_with_embedding() {
        let spec = build_spec(
            Algorithm::Lstm,
            ModelKind::Nlp,
            8,
            4,
            &ArchitectureOptions::default(),
        )
        .unwrap();
        assert!(matches!(spec.layers[0], LayerSpec::Embedding { .. }));
        assert!(matches!(
            spec.layers[1],
            LayerSpec::Lstm {
                return_sequences: true,
                ..
            }
        ));
    }
}
