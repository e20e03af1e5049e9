use std::{fmt, sync::Arc};

use crate::{
    artefacts::{LossFn, Model, Optimizer},
    data::BatchRef,
    error::Result,
    group::ProcessGroup,
    platform::Device,
};

/// A model replica whose gradients are averaged across the process group after every
/// backward pass.
pub struct DistributedModel {
    inner: Box<dyn Model>,
    group: Arc<ProcessGroup>,
    device: Device,
    sync: bool,
}

impl DistributedModel {
    /// Wraps `model`, already moved to `device`.
    ///
    /// When `sync` is set the wrapped replica starts from rank 0's parameters, broadcast to
    /// the whole group.
    ///
    /// # Arguments
    /// * `model` - The local replica.
    /// * `group` - The joined process group.
    /// * `device` - The device the replica lives on.
    /// * `sync` - Whether gradients must be synchronized across replicas.
    ///
    /// # Returns
    /// The wrapped model or the error of the initial broadcast.
    pub fn wrap(
        mut model: Box<dyn Model>,
        group: Arc<ProcessGroup>,
        device: Device,
        sync: bool,
    ) -> Result<Self> {
        if sync {
            group.broadcast(model.params_mut())?;
        }

        Ok(Self {
            inner: model,
            group,
            device,
            sync,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn synchronized(&self) -> bool {
        self.sync
    }

    pub fn num_params(&self) -> usize {
        self.inner.params().len()
    }

    pub fn params(&self) -> &[f32] {
        self.inner.params()
    }

    /// The local replica, used to export and import its state.
    pub fn module(&self) -> &dyn Model {
        self.inner.as_ref()
    }

    pub fn module_mut(&mut self) -> &mut dyn Model {
        self.inner.as_mut()
    }

    pub fn forward(&self, xs: &[f32], out: &mut Vec<f32>) {
        self.inner.forward(xs, out);
    }

    /// Computes the local gradients over `batch` and averages them across the group.
    ///
    /// # Returns
    /// The local batch loss.
    pub fn backward(&mut self, batch: BatchRef<'_>, loss_fn: &dyn LossFn) -> Result<f32> {
        let loss = self.inner.backward(batch, loss_fn);

        if self.sync {
            self.group.all_reduce_mean(self.inner.grads_mut())?;
        }

        Ok(loss)
    }

    /// Applies the last synchronized gradients through `optimiser`.
    pub fn step(&mut self, optimiser: &mut dyn Optimizer) {
        let (params, grads) = self.inner.params_and_grads();
        optimiser.step(params, grads);
    }
}

impl fmt::Debug for DistributedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedModel")
            .field("device", &self.device)
            .field("sync", &self.sync)
            .field("num_params", &self.num_params())
            .finish()
    }
}
