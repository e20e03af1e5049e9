use std::{num::NonZeroUsize, sync::Arc};

use log::{debug, warn};

use super::{DistributedModel, Replica};
use crate::{
    artefacts::{Artefacts, OptimizerSource},
    data::{DataLoader, ShardSampler},
    error::{HarnessErr, Result},
    executor::ArgBundle,
    group::ProcessGroup,
    platform::{Device, PlatformConfig},
};

/// Turns a worker's freshly built artefacts into a device-bound, synchronized replica with a
/// loader over this rank's shard.
#[derive(Debug)]
pub struct ReplicationBinder {
    group: Arc<ProcessGroup>,
    device: Device,
    sync: bool,
    batch_size: NonZeroUsize,
    shuffle: bool,
    seed: u64,
}

impl ReplicationBinder {
    /// Creates a new `ReplicationBinder`.
    ///
    /// # Arguments
    /// * `platform` - The platform configuration shared by the job.
    /// * `bundle` - The argument bundle, its `local_rank` pins the device ordinal when present.
    /// * `local_rank` - This worker's rank on its host.
    /// * `group` - The joined process group.
    ///
    /// # Returns
    /// A `Config` error if the bundle's batch size is zero.
    pub fn new(
        platform: &PlatformConfig,
        bundle: &ArgBundle,
        local_rank: usize,
        group: Arc<ProcessGroup>,
    ) -> Result<Self> {
        let batch_size = NonZeroUsize::new(bundle.batch_size)
            .ok_or_else(|| HarnessErr::Config("batch size must be greater than 0".to_string()))?;

        let ordinal = bundle.local_rank.unwrap_or(local_rank);

        Ok(Self {
            group,
            device: platform.device_for(ordinal),
            sync: platform.requires_sync(),
            batch_size,
            shuffle: bundle.shuffle,
            seed: platform.seed,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Binds `artefacts` to this worker.
    ///
    /// The model is moved to the device and wrapped before the optimizer is rebound, so the
    /// optimizer always manages the wrapped model's parameters.
    pub fn bind(&self, artefacts: Artefacts) -> Result<Replica> {
        let Artefacts {
            mut model,
            train_set,
            test_set,
            optimiser,
            loss_fn,
            optimiser_step,
        } = artefacts;

        let rank = self.group.rank();
        let world_size = self.group.world_size();

        model.to_device(self.device);
        let model = DistributedModel::wrap(model, Arc::clone(&self.group), self.device, self.sync)?;

        let sampler = ShardSampler::new(train_set.len(), world_size, rank)
            .with_shuffle(self.shuffle, self.seed);

        if let Some(skew) = sampler.skew() {
            warn!(rank = rank; "{skew}");
        }

        let loader = DataLoader::new(train_set, sampler, self.batch_size);

        let optimiser = match optimiser {
            OptimizerSource::Live(mut optimiser) => {
                optimiser.bind(model.num_params());
                optimiser
            }
            OptimizerSource::Builder(build) => build(&model),
        };

        debug!(
            rank = rank,
            samples = loader.len(),
            batches = loader.num_batches();
            "replica bound to {}", self.device
        );

        Ok(Replica {
            model,
            optimiser,
            loader,
            loss_fn,
            test_set,
            optimiser_step,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use serde_json::json;

    use super::*;
    use crate::{
        artefacts::{LossFn, Model, Optimizer, StateDict},
        data::{BatchRef, InMemoryDataset},
        group::GroupOptions,
        platform::DeviceKind,
    };

    struct Constant {
        params: Vec<f32>,
        grads: Vec<f32>,
        device: Option<Device>,
    }

    impl Model for Constant {
        fn to_device(&mut self, device: Device) {
            self.device = Some(device);
        }

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
            out.clear();
            out.extend(xs.iter().map(|_| self.params[0]));
        }

        fn backward(&mut self, _batch: BatchRef<'_>, _loss: &dyn LossFn) -> f32 {
            0.0
        }
    }

    struct Noop {
        bound: usize,
    }

    impl Optimizer for Noop {
        fn bind(&mut self, num_params: usize) {
            self.bound = num_params;
        }

        fn step(&mut self, _params: &mut [f32], _grads: &[f32]) {}

        fn learning_rate(&self) -> f32 {
            self.bound as f32
        }

        fn set_learning_rate(&mut self, _learning_rate: f32) {}

        fn export_state(&self) -> StateDict {
            StateDict::new()
        }

        fn import_state(&mut self, _state: &StateDict) -> Result<()> {
            Ok(())
        }
    }

    struct Zero;

    impl LossFn for Zero {
        fn loss(&self, _y_pred: &[f32], _y: &[f32]) -> f32 {
            0.0
        }

        fn grad(&self, _y_pred: &[f32], _y: &[f32], out: &mut [f32]) {
            out.fill(0.0);
        }
    }

    fn group() -> Arc<ProcessGroup> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("tcp://{}", listener.local_addr().unwrap());
        Arc::new(ProcessGroup::new(GroupOptions::new(addr, 1, 0)).unwrap())
    }

    fn bundle(extra: serde_json::Value) -> ArgBundle {
        let mut value = json!({
            "model": {},
            "dataset": {},
            "optimiser": {},
            "loss_fn": "zero",
            "epochs": 1,
            "ckpt_every": 1,
            "logdir": "./logs",
            "batch_size": 4
        });
        if let (Some(value), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            value.extend(extra.clone());
        }
        ArgBundle::from_value(value).unwrap()
    }

    fn artefacts(optimiser: OptimizerSource) -> Artefacts {
        let data = InMemoryDataset::new((0..10).map(|x| x as f32).collect(), vec![0.0; 10], 1, 1)
            .unwrap();

        Artefacts::new(
            Box::new(Constant {
                params: vec![1.0, 2.0, 3.0],
                grads: vec![0.0; 3],
                device: None,
            }),
            Arc::new(data),
            optimiser,
            Box::new(Zero),
        )
    }

    #[test]
    fn bundle_local_rank_pins_the_device() {
        let platform = PlatformConfig {
            device: DeviceKind::Gpu,
            ..Default::default()
        };

        let binder = ReplicationBinder::new(&platform, &bundle(json!({})), 0, group()).unwrap();
        assert_eq!(binder.device(), Device::Gpu(0));

        let pinned = json!({ "local_rank": 3 });
        let binder = ReplicationBinder::new(&platform, &bundle(pinned), 0, group()).unwrap();
        assert_eq!(binder.device(), Device::Gpu(3));
    }

    #[test]
    fn zero_batch_size_is_a_config_error() {
        let platform = PlatformConfig::default();
        let mut bundle = bundle(json!({}));
        bundle.batch_size = 0;

        let err = ReplicationBinder::new(&platform, &bundle, 0, group()).unwrap_err();
        assert!(matches!(err, HarnessErr::Config(_)));
    }

    #[test]
    fn live_optimizer_is_rebound_to_the_wrapped_model() {
        let binder =
            ReplicationBinder::new(&PlatformConfig::default(), &bundle(json!({})), 0, group())
                .unwrap();

        let replica = binder
            .bind(artefacts(OptimizerSource::Live(Box::new(Noop { bound: 0 }))))
            .unwrap();

        assert!(!replica.model.synchronized());
        assert_eq!(replica.optimiser.learning_rate(), 3.0);
        assert_eq!(replica.loader.len(), 10);
        assert_eq!(replica.loader.num_batches(), 3);
    }

    #[test]
    fn optimizer_builder_sees_the_wrapped_model() {
        let binder =
            ReplicationBinder::new(&PlatformConfig::default(), &bundle(json!({})), 0, group())
                .unwrap();

        let build = Box::new(|model: &DistributedModel| -> Box<dyn Optimizer> {
            Box::new(Noop {
                bound: model.num_params() * 10,
            })
        });

        let replica = binder.bind(artefacts(OptimizerSource::Builder(build))).unwrap();
        assert_eq!(replica.optimiser.learning_rate(), 30.0);
        assert_eq!(replica.model.device(), Device::Cpu);
    }
}
