//! Trainable layers. Each layer caches what its backward pass needs during
//! forward, accumulates parameter gradients in backward, and applies them in
//! `apply_gradients`. Batches are rank-2: `[batch, features]`; recurrent
//! layers reshape the feature axis into `[steps, step_features]` internally.

use crate::activation::Activation;
use crate::optimizer::{MomentPair, OptimizerSpec};
use ndarray::{s, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Declarative layer description, persisted in the model manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum LayerSpec {
    Dense { units: usize, activation: Activation },
    Dropout { rate: f32 },
    Embedding { vocab: usize, dim: usize },
    Lstm { units: usize, return_sequences: bool },
}

fn xavier_init(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f32> {
    let bound = (6.0 / (rows + cols) as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.random_range(-bound..bound))
}

// ---------------------------------------------------------------------------
// Dense
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DenseLayer {
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
    pub activation: Activation,
    input: Option<Array2<f32>>,
    output: Option<Array2<f32>>,
    grad_w: Option<Array2<f32>>,
    grad_b: Option<Array1<f32>>,
    opt_w: MomentPair,
    opt_b: MomentPair,
}

impl DenseLayer {
    pub fn new(input_dim: usize, units: usize, activation: Activation, rng: &mut StdRng) -> Self {
        Self {
            weights: xavier_init(input_dim, units, rng),
            bias: Array1::zeros(units),
            activation,
            input: None,
            output: None,
            grad_w: None,
            grad_b: None,
            opt_w: MomentPair::default(),
            opt_b: MomentPair::default(),
        }
    }

    pub fn output_dim(&self) -> usize {
        self.weights.ncols()
    }

    fn forward(&mut self, input: Array2<f32>, training: bool) -> Array2<f32> {
        let mut z = input.dot(&self.weights) + &self.bias;
        self.activation.apply(&mut z);
        if training {
            self.input = Some(input);
            self.output = Some(z.clone());
        }
        z
    }

    fn backward(&mut self, grad_output: Array2<f32>) -> Array2<f32> {
        let input = self.input.take().expect("dense backward before forward");
        let output = self.output.take().expect("dense backward before forward");
        let grad_z = grad_output * self.activation.derivative(&output);
        self.grad_w = Some(input.t().dot(&grad_z));
        self.grad_b = Some(grad_z.sum_axis(Axis(0)));
        grad_z.dot(&self.weights.t())
    }

    fn apply_gradients(&mut self, spec: &OptimizerSpec) {
        if let Some(gw) = self.grad_w.take() {
            self.opt_w.update(spec, &mut self.weights, &gw);
        }
        if let Some(gb) = self.grad_b.take() {
            self.opt_b.update_bias(spec, &mut self.bias, &gb);
        }
    }
}

// ---------------------------------------------------------------------------
// Dropout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DropoutLayer {
    pub rate: f32,
    rng: StdRng,
    mask: Option<Array2<f32>>,
}

impl DropoutLayer {
    pub fn new(rate: f32, seed: u64) -> Self {
        Self {
            rate: rate.clamp(0.0, 0.95),
            rng: StdRng::seed_from_u64(seed),
            mask: None,
        }
    }

    fn forward(&mut self, input: Array2<f32>, training: bool) -> Array2<f32> {
        if !training || self.rate == 0.0 {
            return input;
        }
        // Inverted dropout keeps inference a plain pass-through.
        let keep = 1.0 - self.rate;
        let mask = Array2::from_shape_fn(input.raw_dim(), |_| {
            if self.rng.random::<f32>() < keep {
                1.0 / keep
            } else {
                0.0
            }
        });
        let out = &input * &mask;
        self.mask = Some(mask);
        out
    }

    fn backward(&mut self, grad_output: Array2<f32>) -> Array2<f32> {
        match self.mask.take() {
            Some(mask) => grad_output * mask,
            None => grad_output,
        }
    }
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EmbeddingLayer {
    pub table: Array2<f32>,
    indices: Option<Vec<Vec<usize>>>,
    grad_table: Option<Array2<f32>>,
    opt: MomentPair,
}

impl EmbeddingLayer {
    pub fn new(vocab: usize, dim: usize, rng: &mut StdRng) -> Self {
        Self {
            table: xavier_init(vocab, dim, rng),
            indices: None,
            grad_table: None,
            opt: MomentPair::default(),
        }
    }

    pub fn dim(&self) -> usize {
        self.table.ncols()
    }

    fn bucket(&self, value: f32) -> usize {
        let vocab = self.table.nrows();
        (value.abs().round() as usize).min(vocab.saturating_sub(1))
    }

    /// `[n, d]` scalars become `[n, d * dim]`: each input dimension is one
    /// sequence step whose bucket row is looked up in the table.
    fn forward(&mut self, input: Array2<f32>, training: bool) -> Array2<f32> {
        let (n, steps) = input.dim();
        let dim = self.dim();
        let mut out = Array2::zeros((n, steps * dim));
        let mut cached = Vec::with_capacity(n);
        for (row_idx, row) in input.rows().into_iter().enumerate() {
            let mut row_indices = Vec::with_capacity(steps);
            for (step, &value) in row.iter().enumerate() {
                let bucket = self.bucket(value);
                row_indices.push(bucket);
                out.slice_mut(s![row_idx, step * dim..(step + 1) * dim])
                    .assign(&self.table.row(bucket));
            }
            cached.push(row_indices);
        }
        if training {
            self.indices = Some(cached);
        }
        out
    }

    fn backward(&mut self, grad_output: Array2<f32>) -> Array2<f32> {
        let indices = self.indices.take().expect("embedding backward before forward");
        let dim = self.dim();
        let mut grad_table = Array2::zeros(self.table.raw_dim());
        for (row_idx, row_indices) in indices.iter().enumerate() {
            for (step, &bucket) in row_indices.iter().enumerate() {
                let grad_slice = grad_output.slice(s![row_idx, step * dim..(step + 1) * dim]);
                let mut target = grad_table.row_mut(bucket);
                target += &grad_slice;
            }
        }
        self.grad_table = Some(grad_table);
        // Bucket lookup is non-differentiable; embedding sits first in the
        // stack so nothing upstream consumes this gradient.
        Array2::zeros((grad_output.nrows(), indices.first().map(|r| r.len()).unwrap_or(0)))
    }

    fn apply_gradients(&mut self, spec: &OptimizerSpec) {
        if let Some(grad) = self.grad_table.take() {
            self.opt.update(spec, &mut self.table, &grad);
        }
    }
}

// ---------------------------------------------------------------------------
// LSTM
// ---------------------------------------------------------------------------

/// Per-sample forward cache for backpropagation through time.
#[derive(Debug, Clone)]
struct LstmTrace {
    xs: Vec<Array1<f32>>,
    hs: Vec<Array1<f32>>,
    cs: Vec<Array1<f32>>,
    /// Gate activations per step: i, f, g, o.
    gates: Vec<[Array1<f32>; 4]>,
}

#[derive(Debug, Clone)]
pub struct LstmLayer {
    /// Combined gate weights `[(step_features + units), 4 * units]`,
    /// gate order i, f, g, o.
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
    pub units: usize,
    pub step_features: usize,
    pub return_sequences: bool,
    traces: Option<Vec<LstmTrace>>,
    grad_w: Option<Array2<f32>>,
    grad_b: Option<Array1<f32>>,
    opt_w: MomentPair,
    opt_b: MomentPair,
}

impl LstmLayer {
    pub fn new(
        step_features: usize,
        units: usize,
        return_sequences: bool,
        rng: &mut StdRng,
    ) -> Self {
        let mut bias = Array1::zeros(4 * units);
        // Forget-gate bias starts at 1 so early training retains state.
        bias.slice_mut(s![units..2 * units]).fill(1.0);
        Self {
            weights: xavier_init(step_features + units, 4 * units, rng),
            bias,
            units,
            step_features,
            return_sequences,
            traces: None,
            grad_w: None,
            grad_b: None,
            opt_w: MomentPair::default(),
            opt_b: MomentPair::default(),
        }
    }

    fn sigmoid(v: f32) -> f32 {
        1.0 / (1.0 + (-v).exp())
    }

    fn forward(&mut self, input: Array2<f32>, training: bool) -> Array2<f32> {
        let n = input.nrows();
        let f = self.step_features;
        let steps = input.ncols() / f;
        let h = self.units;

        let out_cols = if self.return_sequences { steps * h } else { h };
        let mut output = Array2::zeros((n, out_cols));
        let mut traces = Vec::with_capacity(n);

        for (row_idx, row) in input.rows().into_iter().enumerate() {
            let mut h_t = Array1::<f32>::zeros(h);
            let mut c_t = Array1::<f32>::zeros(h);
            let mut trace = LstmTrace {
                xs: Vec::with_capacity(steps),
                hs: vec![Array1::zeros(h)],
                cs: vec![Array1::zeros(h)],
                gates: Vec::with_capacity(steps),
            };

            for step in 0..steps {
                let x_t = row.slice(s![step * f..(step + 1) * f]).to_owned();
                let mut combined = Array1::zeros(f + h);
                combined.slice_mut(s![..f]).assign(&x_t);
                combined.slice_mut(s![f..]).assign(&h_t);
                let z = combined.dot(&self.weights) + &self.bias;

                let i_gate = z.slice(s![..h]).mapv(Self::sigmoid);
                let f_gate = z.slice(s![h..2 * h]).mapv(Self::sigmoid);
                let g_gate = z.slice(s![2 * h..3 * h]).mapv(f32::tanh);
                let o_gate = z.slice(s![3 * h..]).mapv(Self::sigmoid);

                c_t = &f_gate * &c_t + &i_gate * &g_gate;
                h_t = &o_gate * &c_t.mapv(f32::tanh);

                if self.return_sequences {
                    output
                        .slice_mut(s![row_idx, step * h..(step + 1) * h])
                        .assign(&h_t);
                }
                if training {
                    trace.xs.push(x_t);
                    trace.hs.push(h_t.clone());
                    trace.cs.push(c_t.clone());
                    trace.gates.push([i_gate, f_gate, g_gate, o_gate]);
                }
            }

            if !self.return_sequences {
                output.row_mut(row_idx).assign(&h_t);
            }
            if training {
                traces.push(trace);
            }
        }

        if training {
            self.traces = Some(traces);
        }
        output
    }

    fn backward(&mut self, grad_output: Array2<f32>) -> Array2<f32> {
        let traces = self.traces.take().expect("lstm backward before forward");
        let f = self.step_features;
        let h = self.units;
        let n = traces.len();
        let steps = traces.first().map(|t| t.xs.len()).unwrap_or(0);

        let mut grad_w = Array2::<f32>::zeros(self.weights.raw_dim());
        let mut grad_b = Array1::<f32>::zeros(self.bias.len());
        let mut grad_input = Array2::<f32>::zeros((n, steps * f));

        for (row_idx, trace) in traces.iter().enumerate() {
            let mut dh_next = Array1::<f32>::zeros(h);
            let mut dc_next = Array1::<f32>::zeros(h);

            for step in (0..steps).rev() {
                let mut dh = dh_next.clone();
                if self.return_sequences {
                    dh += &grad_output.slice(s![row_idx, step * h..(step + 1) * h]);
                } else if step == steps - 1 {
                    dh += &grad_output.row(row_idx);
                }

                let [i_gate, f_gate, g_gate, o_gate] = &trace.gates[step];
                let c_t = &trace.cs[step + 1];
                let c_prev = &trace.cs[step];
                let tanh_c = c_t.mapv(f32::tanh);

                let do_gate = &dh * &tanh_c;
                let mut dc = &dh * o_gate * &tanh_c.mapv(|v| 1.0 - v * v);
                dc += &dc_next;

                let di = &dc * g_gate;
                let df = &dc * c_prev;
                let dg = &dc * i_gate;

                // Back through the gate nonlinearities.
                let di_z = &di * i_gate * &i_gate.mapv(|v| 1.0 - v);
                let df_z = &df * f_gate * &f_gate.mapv(|v| 1.0 - v);
                let dg_z = &dg * &g_gate.mapv(|v| 1.0 - v * v);
                let do_z = &do_gate * o_gate * &o_gate.mapv(|v| 1.0 - v);

                let mut dz = Array1::<f32>::zeros(4 * h);
                dz.slice_mut(s![..h]).assign(&di_z);
                dz.slice_mut(s![h..2 * h]).assign(&df_z);
                dz.slice_mut(s![2 * h..3 * h]).assign(&dg_z);
                dz.slice_mut(s![3 * h..]).assign(&do_z);

                let mut combined = Array1::<f32>::zeros(f + h);
                combined.slice_mut(s![..f]).assign(&trace.xs[step]);
                combined.slice_mut(s![f..]).assign(&trace.hs[step]);

                // Outer product accumulation: combined (f+h) x dz (4h).
                for (r, &cv) in combined.iter().enumerate() {
                    if cv != 0.0 {
                        let mut row = grad_w.row_mut(r);
                        row.scaled_add(cv, &dz);
                    }
                }
                grad_b += &dz;

                let d_combined = self.weights.dot(&dz);
                grad_input
                    .slice_mut(s![row_idx, step * f..(step + 1) * f])
                    .assign(&d_combined.slice(s![..f]));
                dh_next = d_combined.slice(s![f..]).to_owned();
                dc_next = &dc * f_gate;
            }
        }

        self.grad_w = Some(grad_w);
        self.grad_b = Some(grad_b);
        grad_input
    }

    fn apply_gradients(&mut self, spec: &OptimizerSpec) {
        if let Some(gw) = self.grad_w.take() {
            self.opt_w.update(spec, &mut self.weights, &gw);
        }
        if let Some(gb) = self.grad_b.take() {
            self.opt_b.update_bias(spec, &mut self.bias, &gb);
        }
    }
}

// ---------------------------------------------------------------------------
// Layer dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Layer {
    Dense(DenseLayer),
    Dropout(DropoutLayer),
    Embedding(EmbeddingLayer),
    Lstm(LstmLayer),
}

impl Layer {
    pub fn forward(&mut self, input: Array2<f32>, training: bool) -> Array2<f32> {
        match self {
            Layer::Dense(l) => l.forward(input, training),
            Layer::Dropout(l) => l.forward(input, training),
            Layer::Embedding(l) => l.forward(input, training),
            Layer::Lstm(l) => l.forward(input, training),
        }
    }

    pub fn backward(&mut self, grad_output: Array2<f32>) -> Array2<f32> {
        match self {
            Layer::Dense(l) => l.backward(grad_output),
            Layer::Dropout(l) => l.backward(grad_output),
            Layer::Embedding(l) => l.backward(grad_output),
            Layer::Lstm(l) => l.backward(grad_output),
        }
    }

    pub fn apply_gradients(&mut self, spec: &OptimizerSpec) {
        match self {
            Layer::Dense(l) => l.apply_gradients(spec),
            Layer::Embedding(l) => l.apply_gradients(spec),
            Layer::Lstm(l) => l.apply_gradients(spec),
            Layer::Dropout(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn dense_forward_shape() {
        let mut layer = DenseLayer::new(3, 2, Activation::Relu, &mut rng());
        let out = layer.forward(Array2::zeros((5, 3)), false);
        assert_eq!(out.dim(), (5, 2));
    }

    #[test]
    fn dense_gradient_check() {
        // Numerical gradient check on a single weight.
        let mut layer = DenseLayer::new(2, 1, Activation::Linear, &mut rng());
        let x = array![[0.5_f32, -0.3]];
        let target = array![[1.0_f32]];

        let out = layer.forward(x.clone(), true);
        let grad = &out - &target;
        layer.backward(grad.clone());
        let analytic = layer.grad_w.as_ref().unwrap()[[0, 0]];

        let eps = 1e-3;
        let loss = |w: f32, layer: &DenseLayer| {
            let mut probe = layer.clone();
            probe.weights[[0, 0]] = w;
            let o = probe.forward(x.clone(), false);
            let d = o[[0, 0]] - target[[0, 0]];
            0.5 * d * d
        };
        let w0 = layer.weights[[0, 0]];
        let numeric = (loss(w0 + eps, &layer) - loss(w0 - eps, &layer)) / (2.0 * eps);
        assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-2);
    }

    #[test]
    fn dropout_is_identity_at_inference() {
        let mut layer = DropoutLayer::new(0.5, 1);
        let x = Array2::from_elem((4, 4), 2.0_f32);
        assert_eq!(layer.forward(x.clone(), false), x);
    }

    #[test]
    fn dropout_masks_during_training() {
        let mut layer = DropoutLayer::new(0.5, 1);
        let x = Array2::from_elem((8, 8), 1.0_f32);
        let out = layer.forward(x, true);
        let zeros = out.iter().filter(|v| **v == 0.0).count();
        assert!(zeros > 0 && zeros < 64);
    }

    #[test]
    fn embedding_expands_each_step() {
        let mut layer = EmbeddingLayer::new(10, 4, &mut rng());
        let out = layer.forward(array![[1.0_f32, 3.0]], false);
        assert_eq!(out.dim(), (1, 8));
    }

    #[test]
    fn lstm_final_state_shape() {
        let mut layer = LstmLayer::new(1, 8, false, &mut rng());
        let out = layer.forward(Array2::zeros((3, 6)), false);
        assert_eq!(out.dim(), (3, 8));
    }

    #[test]
    fn lstm_sequences_shape() {
        let mut layer = LstmLayer::new(2, 4, true, &mut rng());
        let out = layer.forward(Array2::zeros((3, 10)), false);
        // 5 steps of 2 features -> 5 steps of 4 units.
        assert_eq!(out.dim(), (3, 20));
    }

    #[test]
    fn lstm_backward_produces_input_gradient() {
        let mut layer = LstmLayer::new(1, 4, false, &mut rng());
        let x = Array2::from_elem((2, 5), 0.3_f32);
        let out = layer.forward(x, true);
        let grad_in = layer.backward(Array2::ones(out.raw_dim()));
        assert_eq!(grad_in.dim(), (2, 5));
        assert!(grad_in.iter().any(|v| *v != 0.0));
    }
}
