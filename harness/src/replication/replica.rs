use std::{fmt, sync::Arc};

use super::DistributedModel;
use crate::{
    artefacts::{LossFn, Optimizer, OptimizerStep},
    data::{DataLoader, Dataset},
    error::Result,
};

/// Everything one worker trains with once bound to its device and shard.
pub struct Replica {
    pub model: DistributedModel,
    pub optimiser: Box<dyn Optimizer>,
    pub loader: DataLoader,
    pub loss_fn: Box<dyn LossFn>,
    pub test_set: Option<Arc<dyn Dataset>>,
    pub optimiser_step: Option<OptimizerStep>,
}

impl Replica {
    /// Runs one pass over this rank's shard.
    ///
    /// Reshuffles the shard for `epoch`, then for every batch computes the synchronized
    /// gradients and steps the optimizer. The optional optimizer schedule runs once at the end.
    ///
    /// # Returns
    /// The mean local batch loss.
    pub fn train_epoch(&mut self, epoch: usize) -> Result<f32> {
        let Self {
            model,
            optimiser,
            loader,
            loss_fn,
            optimiser_step,
            ..
        } = self;

        loader.set_epoch(epoch as u64);

        let mut total = 0.0;
        let mut batches = 0usize;

        while let Some(batch) = loader.next_batch() {
            total += model.backward(batch, &**loss_fn)?;
            model.step(&mut **optimiser);
            batches += 1;
        }

        if let Some(schedule) = optimiser_step {
            schedule(&mut **optimiser, epoch);
        }

        Ok(if batches == 0 {
            0.0
        } else {
            total / batches as f32
        })
    }

    /// The mean loss of the replica over every sample of `dataset`, without touching gradients.
    pub fn evaluate(&self, dataset: &dyn Dataset) -> f32 {
        if dataset.is_empty() {
            return 0.0;
        }

        let mut y_pred = Vec::with_capacity(dataset.y_size());
        let total: f32 = (0..dataset.len())
            .map(|idx| {
                let sample = dataset.sample(idx);
                self.model.forward(sample.x, &mut y_pred);
                self.loss_fn.loss(&y_pred, sample.y)
            })
            .sum();

        total / dataset.len() as f32
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("model", &self.model)
            .field("batches", &self.loader.num_batches())
            .field("test_set", &self.test_set.as_ref().map(|ds| ds.len()))
            .finish()
    }
}
