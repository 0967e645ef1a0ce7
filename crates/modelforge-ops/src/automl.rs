//! Hyperparameter and architecture search over a constrained space:
//! random sampling for the cold start, local perturbation of the incumbent
//! afterwards, with trial and time budgets plus search-level early stop.

use modelforge_core::config::AutomlSettings;
use modelforge_core::{ForgeError, ModelKind, Result, Row};
use modelforge_nn::{Activation, FitConfig, LayerSpec, Loss, Network, NetworkSpec, OptimizerSpec};
use modelforge_prep::{fit_transform, PrepConfig, PreparedDataset};
use modelforge_registry::{classification_metrics, regression_metrics};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConstraints {
    pub min_layers: usize,
    pub max_layers: usize,
    pub units_choices: Vec<usize>,
    pub activations: Vec<String>,
    pub dropout_choices: Vec<f64>,
    pub optimizers: Vec<String>,
    /// Learning-rate exponent range: 10^min ..= 10^max.
    pub lr_exp_min: i32,
    pub lr_exp_max: i32,
    pub batch_sizes: Vec<usize>,
    pub epoch_choices: Vec<usize>,
    pub patience: usize,
    /// Recurrent layers are allowed for nlp and time-series tasks.
    pub allow_recurrent: bool,
}

impl SearchConstraints {
    pub fn for_kind(kind: ModelKind) -> Self {
        Self {
            min_layers: 1,
            max_layers: 4,
            units_choices: vec![16, 32, 64, 128, 256],
            activations: vec!["relu".into(), "tanh".into(), "sigmoid".into()],
            dropout_choices: vec![0.0, 0.1, 0.2, 0.3, 0.5],
            optimizers: vec!["adam".into(), "sgd".into(), "rmsprop".into()],
            lr_exp_min: -4,
            lr_exp_max: -2,
            batch_sizes: vec![16, 32, 64],
            epoch_choices: vec![10, 20, 40],
            patience: 5,
            allow_recurrent: matches!(kind, ModelKind::Nlp),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialParams {
    /// (units, activation, dropout-after) per hidden layer.
    pub layers: Vec<(usize, String, f64)>,
    pub optimizer: String,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
    #[serde(default)]
    pub recurrent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialRecord {
    pub index: usize,
    pub params: TrialParams,
    pub score: f64,
    pub status: TrialStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub best_params: TrialParams,
    pub best_score: f64,
    pub trials: Vec<TrialRecord>,
    pub stopped_early: bool,
    pub elapsed_ms: u64,
}

pub struct AutomlEngine {
    settings: AutomlSettings,
}

impl AutomlEngine {
    pub fn new(settings: AutomlSettings) -> Self {
        Self { settings }
    }

    /// Search over prepared data. Preparation happens once; every trial
    /// shares the same tensors and split.
    pub async fn search(
        &self,
        rows: &[Row],
        prep: &PrepConfig,
        constraints: &SearchConstraints,
        seed: u64,
    ) -> Result<SearchOutcome> {
        let prepared = fit_transform(rows, prep, None).await?;
        if prepared.x_train.nrows() == 0 {
            return Err(ForgeError::Training("no training rows after split".into()));
        }

        let budget = Duration::from_secs(self.settings.max_seconds);
        let started = Instant::now();
        let mut rng = StdRng::seed_from_u64(seed);

        let mut trials: Vec<TrialRecord> = Vec::new();
        let mut best: Option<(TrialParams, f64)> = None;
        let mut since_improvement = 0usize;
        let mut stopped_early = false;

        for index in 0..self.settings.max_trials {
            if started.elapsed() > budget {
                info!(trials = trials.len(), "search time budget exhausted");
                stopped_early = true;
                break;
            }
            if since_improvement >= self.settings.early_stop_window {
                info!(
                    window = self.settings.early_stop_window,
                    "no improvement, stopping search"
                );
                stopped_early = true;
                break;
            }

            let params = match &best {
                // Cold start explores at random; afterwards, perturb the
                // incumbent.
                None => sample_params(constraints, &mut rng),
                Some((incumbent, _)) => {
                    if rng.random::<f64>() < 0.3 {
                        sample_params(constraints, &mut rng)
                    } else {
                        perturb_params(incumbent, constraints, &mut rng)
                    }
                }
            };

            let trial_started = Instant::now();
            let result = run_trial(&prepared, prep.model_kind, &params, constraints, seed);
            let duration_ms = trial_started.elapsed().as_millis() as u64;

            match result {
                Ok(score) => {
                    debug!(index, score, "trial completed");
                    let improved = best.as_ref().map(|(_, b)| score > *b).unwrap_or(true);
                    if improved {
                        best = Some((params.clone(), score));
                        since_improvement = 0;
                    } else {
                        since_improvement += 1;
                    }
                    trials.push(TrialRecord {
                        index,
                        params,
                        score,
                        status: TrialStatus::Completed,
                        duration_ms,
                        error: None,
                    });
                }
                Err(err) => {
                    debug!(index, error = %err, "trial failed");
                    since_improvement += 1;
                    trials.push(TrialRecord {
                        index,
                        params,
                        score: 0.0,
                        status: TrialStatus::Failed,
                        duration_ms,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        let (best_params, best_score) = best.ok_or_else(|| {
            ForgeError::Training("every search trial failed".into())
        })?;
        info!(
            score = best_score,
            trials = trials.len(),
            "search finished"
        );
        Ok(SearchOutcome {
            best_params,
            best_score,
            trials,
            stopped_early,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn pick<'a, T>(choices: &'a [T], rng: &mut StdRng) -> &'a T {
    &choices[rng.random_range(0..choices.len())]
}

fn sample_params(constraints: &SearchConstraints, rng: &mut StdRng) -> TrialParams {
    let layer_count = rng.random_range(constraints.min_layers..=constraints.max_layers);
    let layers = (0..layer_count)
        .map(|_| {
            (
                *pick(&constraints.units_choices, rng),
                pick(&constraints.activations, rng).clone(),
                *pick(&constraints.dropout_choices, rng),
            )
        })
        .collect();
    let exp = rng.random_range(constraints.lr_exp_min..=constraints.lr_exp_max) as f64;
    // Log-uniform mantissa within the decade.
    let mantissa = 1.0 + rng.random::<f64>() * 8.0;
    TrialParams {
        layers,
        optimizer: pick(&constraints.optimizers, rng).clone(),
        learning_rate: mantissa * 10f64.powf(exp),
        batch_size: *pick(&constraints.batch_sizes, rng),
        epochs: *pick(&constraints.epoch_choices, rng),
        recurrent: constraints.allow_recurrent && rng.random::<f64>() < 0.3,
    }
}

fn perturb_params(
    incumbent: &TrialParams,
    constraints: &SearchConstraints,
    rng: &mut StdRng,
) -> TrialParams {
    let mut params = incumbent.clone();
    match rng.random_range(0..4) {
        0 => {
            // Resize one layer.
            if let Some(layer) = params.layers.first_mut() {
                layer.0 = *pick(&constraints.units_choices, rng);
            }
        }
        1 => {
            params.learning_rate =
                (params.learning_rate * if rng.random::<bool>() { 2.0 } else { 0.5 })
                    .clamp(10f64.powi(constraints.lr_exp_min), 10f64.powi(constraints.lr_exp_max) * 9.0);
        }
        2 => {
            params.batch_size = *pick(&constraints.batch_sizes, rng);
        }
        _ => {
            // Grow or shrink the stack within bounds.
            if params.layers.len() < constraints.max_layers && rng.random::<bool>() {
                params.layers.push((
                    *pick(&constraints.units_choices, rng),
                    pick(&constraints.activations, rng).clone(),
                    *pick(&constraints.dropout_choices, rng),
                ));
            } else if params.layers.len() > constraints.min_layers {
                params.layers.pop();
            }
        }
    }
    params
}

fn spec_from_params(
    params: &TrialParams,
    kind: ModelKind,
    input_dim: usize,
    label_dim: usize,
) -> NetworkSpec {
    let mut layers = Vec::new();
    if params.recurrent {
        layers.push(LayerSpec::Lstm {
            units: params.layers.first().map(|l| l.0).unwrap_or(32),
            return_sequences: false,
        });
    }
    for (units, activation, dropout) in &params.layers {
        layers.push(LayerSpec::Dense {
            units: *units,
            activation: Activation::parse(activation).unwrap_or(Activation::Relu),
        });
        if *dropout > 0.0 {
            layers.push(LayerSpec::Dropout {
                rate: *dropout as f32,
            });
        }
    }

    let (head, loss) = match kind {
        ModelKind::Regression => (
            LayerSpec::Dense {
                units: 1,
                activation: Activation::Linear,
            },
            Loss::MeanSquaredError,
        ),
        _ => (
            LayerSpec::Dense {
                units: label_dim.max(2),
                activation: Activation::Softmax,
            },
            Loss::CategoricalCrossEntropy,
        ),
    };
    layers.push(head);

    NetworkSpec {
        input_dim,
        layers,
        loss,
        optimizer: OptimizerSpec::parse(&params.optimizer, params.learning_rate as f32),
    }
}

/// Train and score one configuration. Higher is better: validation
/// accuracy for classification, negated MSE for regression.
fn run_trial(
    prepared: &PreparedDataset,
    kind: ModelKind,
    params: &TrialParams,
    constraints: &SearchConstraints,
    seed: u64,
) -> Result<f64> {
    let spec = spec_from_params(
        params,
        kind,
        prepared.input_dim(),
        prepared.metadata.label_dim,
    );
    let mut network = Network::build(spec, seed)?;
    network
        .fit(
            &prepared.x_train,
            &prepared.y_train,
            &prepared.x_validation,
            &prepared.y_validation,
            &FitConfig {
                epochs: params.epochs,
                batch_size: params.batch_size,
                patience: constraints.patience,
                shuffle_seed: seed,
            },
        )
        .map_err(|e| ForgeError::Training(e.to_string()))?;

    let (x, y) = if prepared.x_validation.nrows() > 0 {
        (&prepared.x_validation, &prepared.y_validation)
    } else {
        (&prepared.x_train, &prepared.y_train)
    };
    let predicted = network
        .predict(x)
        .map_err(|e| ForgeError::Training(e.to_string()))?;
    Ok(match kind {
        ModelKind::Regression => -regression_metrics(&predicted, y).mse,
        _ => classification_metrics(&predicted, y).accuracy,
    })
}
