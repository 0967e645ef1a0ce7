//! Network assembly, training loop and inference.

use crate::activation::Activation;
use crate::error::{NnError, Result};
use crate::layer::{DenseLayer, DropoutLayer, EmbeddingLayer, Layer, LayerSpec, LstmLayer};
use crate::loss::Loss;
use crate::optimizer::OptimizerSpec;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Declarative network description, persisted in the model manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub input_dim: usize,
    pub layers: Vec<LayerSpec>,
    pub loss: Loss,
    pub optimizer: OptimizerSpec,
}

#[derive(Debug, Clone)]
pub struct FitConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Early-stopping patience in epochs without validation improvement.
    pub patience: usize,
    pub shuffle_seed: u64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            patience: 10,
            shuffle_seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    pub epochs_run: usize,
    pub train_loss: Vec<f32>,
    pub validation_loss: Vec<f32>,
    pub final_loss: f32,
    pub stopped_early: bool,
}

/// A compiled network: spec plus materialized layers.
#[derive(Debug, Clone)]
pub struct Network {
    pub spec: NetworkSpec,
    layers: Vec<Layer>,
}

impl Network {
    /// Materialize a spec into layers with seeded initialization.
    pub fn build(spec: NetworkSpec, seed: u64) -> Result<Self> {
        if spec.input_dim == 0 {
            return Err(NnError::Build("input dimension must be non-zero".into()));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut layers = Vec::with_capacity(spec.layers.len());
        let mut current_dim = spec.input_dim;
        // Step width for a following recurrent layer: scalars for flat
        // input, the embedding width after an embedding layer, the unit
        // count after a sequence-returning LSTM.
        let mut step_features = 1usize;

        for (idx, layer_spec) in spec.layers.iter().enumerate() {
            match layer_spec {
                LayerSpec::Dense { units, activation } => {
                    if *units == 0 {
                        return Err(NnError::Build(format!("dense layer {idx} has zero units")));
                    }
                    layers.push(Layer::Dense(DenseLayer::new(
                        current_dim,
                        *units,
                        *activation,
                        &mut rng,
                    )));
                    current_dim = *units;
                    step_features = 1;
                }
                LayerSpec::Dropout { rate } => {
                    layers.push(Layer::Dropout(DropoutLayer::new(
                        *rate,
                        seed.wrapping_add(idx as u64 + 1),
                    )));
                }
                LayerSpec::Embedding { vocab, dim } => {
                    if *vocab == 0 || *dim == 0 {
                        return Err(NnError::Build("embedding needs vocab and dim".into()));
                    }
                    layers.push(Layer::Embedding(EmbeddingLayer::new(*vocab, *dim, &mut rng)));
                    current_dim *= dim;
                    step_features = *dim;
                }
                LayerSpec::Lstm {
                    units,
                    return_sequences,
                } => {
                    if current_dim % step_features != 0 {
                        return Err(NnError::Build(format!(
                            "lstm layer {idx}: width {current_dim} is not divisible into steps of {step_features}"
                        )));
                    }
                    let steps = current_dim / step_features;
                    layers.push(Layer::Lstm(LstmLayer::new(
                        step_features,
                        *units,
                        *return_sequences,
                        &mut rng,
                    )));
                    current_dim = if *return_sequences {
                        steps * units
                    } else {
                        *units
                    };
                    step_features = *units;
                }
            }
        }

        Ok(Self { spec, layers })
    }

    pub fn output_dim(&self) -> usize {
        self.layers
            .iter()
            .rev()
            .find_map(|l| match l {
                Layer::Dense(d) => Some(d.output_dim()),
                Layer::Lstm(l) => Some(l.units),
                _ => None,
            })
            .unwrap_or(self.spec.input_dim)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut Vec<Layer> {
        &mut self.layers
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.spec.optimizer = self.spec.optimizer.with_learning_rate(learning_rate);
    }

    /// Inference forward pass.
    pub fn predict(&mut self, x: &Array2<f32>) -> Result<Array2<f32>> {
        self.check_input(x)?;
        let mut current = x.clone();
        for layer in &mut self.layers {
            current = layer.forward(current, false);
        }
        Ok(current)
    }

    /// Loss over a labeled set.
    pub fn evaluate(&mut self, x: &Array2<f32>, y: &Array2<f32>) -> Result<f32> {
        let predicted = self.predict(x)?;
        Ok(self.spec.loss.compute(&predicted, y))
    }

    /// Minibatch training with validation-loss early stopping.
    pub fn fit(
        &mut self,
        x: &Array2<f32>,
        y: &Array2<f32>,
        x_val: &Array2<f32>,
        y_val: &Array2<f32>,
        config: &FitConfig,
    ) -> Result<FitReport> {
        self.check_input(x)?;
        if x.nrows() != y.nrows() {
            return Err(NnError::Shape(format!(
                "{} feature rows but {} label rows",
                x.nrows(),
                y.nrows()
            )));
        }
        if x.nrows() == 0 {
            return Err(NnError::Shape("cannot fit on zero rows".into()));
        }

        let batch_size = config.batch_size.max(1).min(x.nrows());
        let mut order: Vec<usize> = (0..x.nrows()).collect();
        let mut rng = StdRng::seed_from_u64(config.shuffle_seed);
        let has_validation = x_val.nrows() > 0;

        let mut report = FitReport {
            epochs_run: 0,
            train_loss: Vec::new(),
            validation_loss: Vec::new(),
            final_loss: f32::INFINITY,
            stopped_early: false,
        };
        let mut best = f32::INFINITY;
        let mut stale = 0usize;

        for epoch in 0..config.epochs {
            order.shuffle(&mut rng);
            let mut epoch_loss = 0.0;
            let mut batches = 0;

            for chunk in order.chunks(batch_size) {
                let xb = x.select(Axis(0), chunk);
                let yb = y.select(Axis(0), chunk);

                let mut current = xb;
                for layer in &mut self.layers {
                    current = layer.forward(current, true);
                }
                epoch_loss += self.spec.loss.compute(&current, &yb);
                batches += 1;

                let mut grad = self.spec.loss.output_gradient(&current, &yb);
                for layer in self.layers.iter_mut().rev() {
                    grad = layer.backward(grad);
                }
                let optimizer = self.spec.optimizer;
                for layer in &mut self.layers {
                    layer.apply_gradients(&optimizer);
                }
            }

            let train_loss = epoch_loss / batches.max(1) as f32;
            report.train_loss.push(train_loss);
            report.epochs_run = epoch + 1;

            let watched = if has_validation {
                let val_loss = self.evaluate(x_val, y_val)?;
                report.validation_loss.push(val_loss);
                val_loss
            } else {
                train_loss
            };
            report.final_loss = watched;

            if watched < best - 1e-6 {
                best = watched;
                stale = 0;
            } else {
                stale += 1;
                if stale >= config.patience {
                    report.stopped_early = true;
                    debug!(epoch, best, "early stopping triggered");
                    break;
                }
            }
        }

        Ok(report)
    }

    fn check_input(&self, x: &Array2<f32>) -> Result<()> {
        if x.ncols() != self.spec.input_dim {
            return Err(NnError::Shape(format!(
                "expected {} input columns, got {}",
                self.spec.input_dim,
                x.ncols()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn xor_spec() -> NetworkSpec {
        NetworkSpec {
            input_dim: 2,
            layers: vec![
                LayerSpec::Dense {
                    units: 8,
                    activation: Activation::Tanh,
                },
                LayerSpec::Dense {
                    units: 1,
                    activation: Activation::Sigmoid,
                },
            ],
            loss: Loss::BinaryCrossEntropy,
            optimizer: OptimizerSpec::Adam { learning_rate: 0.05 },
        }
    }

    fn xor_data() -> (Array2<f32>, Array2<f32>) {
        (
            array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]],
            array![[0.0], [1.0], [1.0], [0.0]],
        )
    }

    #[test]
    fn xor_is_learnable() {
        let mut net = Network::build(xor_spec(), 3).unwrap();
        let (x, y) = xor_data();
        let empty_x = Array2::zeros((0, 2));
        let empty_y = Array2::zeros((0, 1));
        let config = FitConfig {
            epochs: 800,
            batch_size: 4,
            patience: 800,
            shuffle_seed: 3,
        };
        let report = net.fit(&x, &y, &empty_x, &empty_y, &config).unwrap();
        assert!(report.final_loss < 0.2, "loss was {}", report.final_loss);

        let out = net.predict(&x).unwrap();
        assert!(out[[0, 0]] < 0.5);
        assert!(out[[1, 0]] > 0.5);
        assert!(out[[2, 0]] > 0.5);
        assert!(out[[3, 0]] < 0.5);
    }

    #[test]
    fn seeded_build_is_deterministic() {
        let a = Network::build(xor_spec(), 11).unwrap();
        let b = Network::build(xor_spec(), 11).unwrap();
        let (Layer::Dense(da), Layer::Dense(db)) = (&a.layers[0], &b.layers[0]) else {
            panic!("expected dense layers");
        };
        assert_eq!(da.weights, db.weights);
    }

    #[test]
    fn wrong_input_width_is_rejected() {
        let mut net = Network::build(xor_spec(), 1).unwrap();
        let err = net.predict(&Array2::zeros((1, 5))).unwrap_err();
        assert!(matches!(err, NnError::Shape(_)));
    }

    #[test]
    fn early_stopping_trips_on_plateau() {
        let mut net = Network::build(xor_spec(), 5).unwrap();
        // Constant labels make validation loss flatline quickly.
        let x = Array2::zeros((10, 2));
        let y = Array2::zeros((10, 1));
        let config = FitConfig {
            epochs: 200,
            batch_size: 5,
            patience: 3,
            shuffle_seed: 1,
        };
        let report = net.fit(&x, &y, &x, &y, &config).unwrap();
        assert!(report.stopped_early);
        assert!(report.epochs_run < 200);
    }

    #[test]
    fn lstm_stack_builds_and_runs() {
        let spec = NetworkSpec {
            input_dim: 6,
            layers: vec![
                LayerSpec::Embedding { vocab: 50, dim: 8 },
                LayerSpec::Lstm {
                    units: 8,
                    return_sequences: true,
                },
                LayerSpec::Dropout { rate: 0.3 },
                LayerSpec::Lstm {
                    units: 4,
                    return_sequences: false,
                },
                LayerSpec::Dense {
                    units: 3,
                    activation: Activation::Softmax,
                },
            ],
            loss: Loss::CategoricalCrossEntropy,
            optimizer: OptimizerSpec::Adam { learning_rate: 0.01 },
        };
        let mut net = Network::build(spec, 2).unwrap();
        let x = Array2::from_elem((4, 6), 2.0_f32);
        let out = net.predict(&x).unwrap();
        assert_eq!(out.dim(), (4, 3));

        let y = {
            let mut y = Array2::zeros((4, 3));
            for i in 0..4 {
                y[[i, i % 3]] = 1.0;
            }
            y
        };
        let config = FitConfig {
            epochs: 2,
            batch_size: 2,
            patience: 10,
            shuffle_seed: 9,
        };
        net.fit(&x, &y, &x, &y, &config).unwrap();
    }
}
