//! Lifecycle harness for data-parallel training jobs.
//!
//! Spawns one worker per rank, joins them into a collective group, replicates the model and a
//! sharded data loader on every worker, and dispatches the job's train/resume/evaluate procedure.

pub mod artefacts;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod executor;
pub mod group;
pub mod job;
pub mod logger;
pub mod platform;
pub mod replication;
pub mod seed;

pub use artefacts::{Artefacts, LossFn, Model, Optimizer, OptimizerSource, StateDict};
pub use checkpoint::{CheckpointRecord, CheckpointStore};
pub use data::{BatchRef, DataLoader, Dataset, InMemoryDataset, ShardSampler};
pub use error::{HarnessErr, RendezvousErr, Result};
pub use executor::{ArgBundle, ArtefactsFactory, Executor, Workload};
pub use group::{GroupOptions, GroupPhase, InitMethod, ProcessGroup};
pub use job::{Callback, Job, JobConfig, JobMode, JobProcedures, Procedure, WorkerContext};
pub use logger::TrainingLogger;
pub use platform::{Device, DeviceKind, PlatformConfig, SpawnMode};
pub use replication::{DistributedModel, Replica, ReplicationBinder};
pub use seed::{SeedController, SeededRngs};
