#![allow(dead_code)]

use std::{net::TcpListener, slice, sync::Arc};

use harness::{
    ArgBundle, Artefacts, BatchRef, HarnessErr, InMemoryDataset, LossFn, Model, Optimizer,
    OptimizerSource, PlatformConfig, SeededRngs, SpawnMode, StateDict,
};
use rand::{Rng, rngs::StdRng};
use serde_json::json;

/// A rendezvous address nobody is listening on.
pub fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    format!("tcp://{}", listener.local_addr().unwrap())
}

pub fn platform(world_size: usize) -> PlatformConfig {
    PlatformConfig {
        world_size,
        spawn: SpawnMode::Threads,
        init_method: free_addr(),
        connect_timeout_ms: 10_000,
        collective_timeout_ms: Some(20_000),
        ..Default::default()
    }
}

pub fn bundle(logdir: &std::path::Path, samples: usize) -> ArgBundle {
    ArgBundle::from_value(json!({
        "model": { "features": 2 },
        "dataset": { "samples": samples },
        "optimiser": { "lr": 0.05 },
        "loss_fn": "mse",
        "epochs": 3,
        "ckpt_every": 1,
        "logdir": logdir,
        "batch_size": 4
    }))
    .unwrap()
}

/// `y = w . x + b`.
pub struct Linear {
    params: Vec<f32>,
    grads: Vec<f32>,
    x_size: usize,
}

impl Linear {
    pub fn new(x_size: usize, rng: &mut StdRng) -> Self {
        Self {
            params: (0..=x_size).map(|_| rng.random_range(-1.0..1.0)).collect(),
            grads: vec![0.0; x_size + 1],
            x_size,
        }
    }
}

impl Model for Linear {
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
        let (w, b) = self.params.split_at(self.x_size);

        out.clear();
        out.extend(
            xs.chunks_exact(self.x_size)
                .map(|x| x.iter().zip(w).map(|(x, w)| x * w).sum::<f32>() + b[0]),
        );
    }

    fn backward(&mut self, batch: BatchRef<'_>, loss_fn: &dyn LossFn) -> f32 {
        let mut y_pred = Vec::new();
        self.forward(batch.xs, &mut y_pred);

        let mut d = vec![0.0; y_pred.len()];
        loss_fn.grad(&y_pred, batch.ys, &mut d);

        self.grads.fill(0.0);
        for (x, d) in batch.xs.chunks_exact(self.x_size).zip(&d) {
            for (g, x) in self.grads.iter_mut().zip(x) {
                *g += d * x;
            }
            self.grads[self.x_size] += d;
        }

        loss_fn.loss(&y_pred, batch.ys)
    }
}

/// Plain gradient descent that counts its steps.
pub struct Sgd {
    pub lr: f32,
    pub steps: usize,
}

impl Optimizer for Sgd {
    fn bind(&mut self, _num_params: usize) {
        self.steps = 0;
    }

    fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        params
            .iter_mut()
            .zip(grads)
            .for_each(|(p, g)| *p -= self.lr * g);
        self.steps += 1;
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.lr = learning_rate;
    }

    fn export_state(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert_tensor("lr", vec![self.lr]);
        state.insert_meta("steps", self.steps.to_string());
        state
    }

    fn import_state(&mut self, state: &StateDict) -> harness::Result<()> {
        state.copy_tensor_into("lr", "optimiser", slice::from_mut(&mut self.lr))?;
        self.steps = state
            .meta("steps")
            .and_then(|steps| steps.parse().ok())
            .ok_or_else(|| HarnessErr::Config("optimiser state has no steps".to_string()))?;
        Ok(())
    }
}

pub struct Mse;

impl LossFn for Mse {
    fn loss(&self, y_pred: &[f32], y: &[f32]) -> f32 {
        let n = y.len().max(1) as f32;
        y_pred.iter().zip(y).map(|(p, y)| (p - y).powi(2)).sum::<f32>() / n
    }

    fn grad(&self, y_pred: &[f32], y: &[f32], out: &mut [f32]) {
        let n = y.len().max(1) as f32;
        for ((o, p), y) in out.iter_mut().zip(y_pred).zip(y) {
            *o = 2.0 * (p - y) / n;
        }
    }
}

/// Samples of `y = 2 x0 - x1 + 0.5`.
pub fn samples(n: usize, rng: &mut StdRng) -> InMemoryDataset {
    let xs: Vec<f32> = (0..2 * n).map(|_| rng.random_range(-1.0..1.0)).collect();
    let ys = xs.chunks_exact(2).map(|x| 2.0 * x[0] - x[1] + 0.5).collect();
    InMemoryDataset::new(xs, ys, 2, 1).unwrap()
}

/// Builds a linear model over the bundle's dataset description.
pub fn factory(bundle: &ArgBundle, rngs: &mut SeededRngs) -> anyhow::Result<Artefacts> {
    let features = bundle.model["features"]
        .as_u64()
        .ok_or_else(|| anyhow::anyhow!("model.features must be an integer"))?;
    let samples_n = bundle.dataset["samples"]
        .as_u64()
        .ok_or_else(|| anyhow::anyhow!("dataset.samples must be an integer"))?;
    let lr = bundle.optimiser["lr"].as_f64().unwrap_or(0.01) as f32;

    let model = Linear::new(features as usize, &mut rngs.numeric);
    let train = samples(samples_n as usize, &mut rngs.general);
    let test = samples(8, &mut rngs.general);

    Ok(Artefacts::new(
        Box::new(model),
        Arc::new(train),
        OptimizerSource::Live(Box::new(Sgd { lr, steps: 0 })),
        Box::new(Mse),
    )
    .with_test_set(Arc::new(test)))
}
