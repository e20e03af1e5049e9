use std::slice;

use harness::{BatchRef, HarnessErr, LossFn, Model, Optimizer, StateDict};
use rand::{Rng, rngs::StdRng};

const LR_KEY: &str = "lr";
const STEPS_KEY: &str = "steps";

/// A single-output linear model, its parameters laid out as `[w_0, .., w_n, b]`.
pub struct LinearRegression {
    features: usize,
    params: Vec<f32>,
    grads: Vec<f32>,
    delta: Vec<f32>,
}

impl LinearRegression {
    /// Returns a new `LinearRegression` with weights drawn uniformly from `[-1, 1)` and a zero bias.
    ///
    /// # Arguments
    /// * `features` - The size of every input.
    /// * `rng` - The source the weights are drawn from.
    pub fn new(features: usize, rng: &mut StdRng) -> Self {
        let mut params: Vec<f32> = (0..features).map(|_| rng.random_range(-1.0..1.0)).collect();
        params.push(0.0);

        Self {
            features,
            grads: vec![0.0; params.len()],
            params,
            delta: Vec::new(),
        }
    }
}

impl Model for LinearRegression {
    fn params(&self) -> &[f32] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    fn grads_mut(&mut self) -> &mut [f32] {
        &mut self.grads
    }

    fn params_and_grads(&mut self) -> (&mut [f32], &[f32]) {
        (&mut self.params, &self.grads)
    }

    fn forward(&self, xs: &[f32], out: &mut Vec<f32>) {
        let (w, b) = self.params.split_at(self.features);

        out.clear();
        out.extend(
            xs.chunks_exact(self.features)
                .map(|x| x.iter().zip(w).map(|(x, w)| x * w).sum::<f32>() + b[0]),
        );
    }

    fn backward(&mut self, batch: BatchRef<'_>, loss_fn: &dyn LossFn) -> f32 {
        let mut y_pred = Vec::with_capacity(batch.len());
        self.forward(batch.xs, &mut y_pred);

        self.delta.resize(y_pred.len(), 0.0);
        loss_fn.grad(&y_pred, batch.ys, &mut self.delta);

        let (dw, db) = self.grads.split_at_mut(self.features);
        dw.fill(0.0);
        db[0] = 0.0;

        for (x, d) in batch.xs.chunks_exact(self.features).zip(&self.delta) {
            for (g, x) in dw.iter_mut().zip(x) {
                *g += d * x;
            }
            db[0] += d;
        }

        loss_fn.loss(&y_pred, batch.ys)
    }
}

/// Gradient descent optimization algorithm.
pub struct GradientDescent {
    learning_rate: f32,
    steps: u64,
}

impl GradientDescent {
    /// Returns a new `GradientDescent`.
    ///
    /// # Arguments
    /// * `learning_rate` - The *length* of the steps taken on `step`.
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            steps: 0,
        }
    }
}

impl Optimizer for GradientDescent {
    fn bind(&mut self, _num_params: usize) {
        self.steps = 0;
    }

    /// Makes a step in the opposite direction of the gradient, with a length of `learning_rate`.
    fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        let lr = self.learning_rate;

        for (w, g) in params.iter_mut().zip(grads) {
            *w -= lr * g;
        }

        self.steps += 1;
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    fn export_state(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert_tensor(LR_KEY, vec![self.learning_rate]);
        state.insert_meta(STEPS_KEY, self.steps.to_string());
        state
    }

    fn import_state(&mut self, state: &StateDict) -> harness::Result<()> {
        state.copy_tensor_into(LR_KEY, "optimiser", slice::from_mut(&mut self.learning_rate))?;

        self.steps = match state.meta(STEPS_KEY) {
            Some(steps) => steps
                .parse()
                .map_err(|e| HarnessErr::Config(format!("invalid optimiser steps {steps}: {e}")))?,
            None => 0,
        };

        Ok(())
    }
}

/// Mean squared error loss function.
#[derive(Default, Clone, Copy)]
pub struct Mse;

impl LossFn for Mse {
    fn loss(&self, y_pred: &[f32], y: &[f32]) -> f32 {
        if y.is_empty() {
            return 0.0;
        }

        let sum: f32 = y_pred.iter().zip(y).map(|(p, y)| (p - y).powi(2)).sum();
        sum / y.len() as f32
    }

    fn grad(&self, y_pred: &[f32], y: &[f32], out: &mut [f32]) {
        let scale = 2.0 / y_pred.len().max(1) as f32;

        for ((o, p), y) in out.iter_mut().zip(y_pred).zip(y) {
            *o = (p - y) * scale;
        }
    }
}
