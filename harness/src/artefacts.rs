//! The contracts the harness requires from caller-supplied models, optimizers and losses.

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{
    data::{BatchRef, Dataset},
    error::{HarnessErr, Result},
    platform::Device,
    replication::DistributedModel,
};

const PARAMS_KEY: &str = "params";

/// A named collection of flat tensors plus string metadata, the exported state of a model or
/// an optimizer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    tensors: BTreeMap<String, Vec<f32>>,
    meta: BTreeMap<String, String>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tensor(&mut self, name: impl Into<String>, values: Vec<f32>) {
        self.tensors.insert(name.into(), values);
    }

    pub fn insert_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta.insert(key.into(), value.into());
    }

    pub fn tensor(&self, name: &str) -> Option<&[f32]> {
        self.tensors.get(name).map(Vec::as_slice)
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    pub fn tensors(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn metas(&self) -> impl Iterator<Item = (&str, &str)> {
        self.meta.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copies the tensor `name` into `dst`, which must have the same length.
    pub fn copy_tensor_into(&self, name: &str, what: &'static str, dst: &mut [f32]) -> Result<()> {
        let src = self.tensor(name).ok_or(HarnessErr::StateMismatch {
            what,
            got: 0,
            expected: dst.len(),
        })?;

        if src.len() != dst.len() {
            return Err(HarnessErr::StateMismatch {
                what,
                got: src.len(),
                expected: dst.len(),
            });
        }

        dst.copy_from_slice(src);
        Ok(())
    }
}

/// A trainable model with flat parameter and gradient buffers.
pub trait Model: Send {
    /// Moves the model to `device`.
    fn to_device(&mut self, _device: Device) {}

    fn params(&self) -> &[f32];

    fn params_mut(&mut self) -> &mut [f32];

    fn grads_mut(&mut self) -> &mut [f32];

    /// Splits the model into its parameters and the gradients of the last backward pass.
    fn params_and_grads(&mut self) -> (&mut [f32], &[f32]);

    /// Writes the predictions for the flat features `xs` into `out`.
    fn forward(&self, xs: &[f32], out: &mut Vec<f32>);

    /// Computes the gradients of `loss` over `batch`, returning the batch loss.
    fn backward(&mut self, batch: BatchRef<'_>, loss: &dyn LossFn) -> f32;

    fn export_state(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert_tensor(PARAMS_KEY, self.params().to_vec());
        state
    }

    fn import_state(&mut self, state: &StateDict) -> Result<()> {
        state.copy_tensor_into(PARAMS_KEY, "model", self.params_mut())
    }
}

/// An optimization algorithm holding its own state over a bound parameter set.
pub trait Optimizer: Send {
    /// Binds the optimizer to a parameter set of `num_params` entries, resetting its state.
    fn bind(&mut self, num_params: usize);

    /// Updates `params` according to the algorithm's learning rule.
    fn step(&mut self, params: &mut [f32], grads: &[f32]);

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, learning_rate: f32);

    fn export_state(&self) -> StateDict;

    fn import_state(&mut self, state: &StateDict) -> Result<()>;
}

/// A loss function over flat predictions and targets.
pub trait LossFn: Send + Sync {
    fn loss(&self, y_pred: &[f32], y: &[f32]) -> f32;

    /// Writes the derivative of the loss with respect to `y_pred` into `out`.
    fn grad(&self, y_pred: &[f32], y: &[f32], out: &mut [f32]);
}

/// Builds an optimizer from the wrapped model.
pub type OptimizerBuilder = Box<dyn FnOnce(&DistributedModel) -> Box<dyn Optimizer> + Send>;

/// Adjusts the optimizer at the end of an epoch (learning-rate schedules).
pub type OptimizerStep = Box<dyn FnMut(&mut dyn Optimizer, usize) + Send>;

/// Where a worker's optimizer comes from.
pub enum OptimizerSource {
    /// A ready optimizer, rebound to the wrapped model's parameters.
    Live(Box<dyn Optimizer>),
    /// Invoked with the wrapped model to produce the optimizer.
    Builder(OptimizerBuilder),
}

impl fmt::Debug for OptimizerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live(_) => f.write_str("OptimizerSource::Live"),
            Self::Builder(_) => f.write_str("OptimizerSource::Builder"),
        }
    }
}

/// Everything a worker trains with, built inside the worker by the caller's factory.
pub struct Artefacts {
    pub model: Box<dyn Model>,
    pub train_set: Arc<dyn Dataset>,
    /// The held-out set handed to `evaluate`.
    pub test_set: Option<Arc<dyn Dataset>>,
    pub optimiser: OptimizerSource,
    pub loss_fn: Box<dyn LossFn>,
    pub optimiser_step: Option<OptimizerStep>,
}

impl fmt::Debug for Artefacts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artefacts")
            .field("params", &self.model.params().len())
            .field("train_set", &self.train_set.len())
            .field("test_set", &self.test_set.as_ref().map(|set| set.len()))
            .field("optimiser", &self.optimiser)
            .field("optimiser_step", &self.optimiser_step.is_some())
            .finish()
    }
}

impl Artefacts {
    pub fn new(
        model: Box<dyn Model>,
        train_set: Arc<dyn Dataset>,
        optimiser: OptimizerSource,
        loss_fn: Box<dyn LossFn>,
    ) -> Self {
        Self {
            model,
            train_set,
            test_set: None,
            optimiser,
            loss_fn,
            optimiser_step: None,
        }
    }

    pub fn with_test_set(mut self, test_set: Arc<dyn Dataset>) -> Self {
        self.test_set = Some(test_set);
        self
    }

    pub fn with_optimiser_step(mut self, step: OptimizerStep) -> Self {
        self.optimiser_step = Some(step);
        self
    }
}
