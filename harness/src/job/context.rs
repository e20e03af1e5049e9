use std::{path::PathBuf, sync::Arc};

use super::JobConfig;
use crate::{
    checkpoint::CheckpointStore,
    error::Result,
    executor::ArgBundle,
    group::ProcessGroup,
    logger::TrainingLogger,
    replication::Replica,
    seed::SeededRngs,
};

/// The per-worker state handed to the job's procedures.
pub struct WorkerContext {
    pub global_rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub job: JobConfig,
    pub bundle: Arc<ArgBundle>,
    pub replica: Replica,
    pub checkpoints: CheckpointStore,
    /// Present on rank 0 only.
    pub logger: Option<TrainingLogger>,
    pub rngs: SeededRngs,
    group: Arc<ProcessGroup>,
}

impl WorkerContext {
    pub(crate) fn new(
        local_rank: usize,
        job: JobConfig,
        bundle: Arc<ArgBundle>,
        replica: Replica,
        logger: Option<TrainingLogger>,
        rngs: SeededRngs,
        group: Arc<ProcessGroup>,
    ) -> Self {
        Self {
            global_rank: group.rank(),
            local_rank,
            world_size: group.world_size(),
            checkpoints: job.checkpoints(),
            job,
            bundle,
            replica,
            logger,
            rngs,
            group,
        }
    }

    /// Whether this is the rank producing job-level output.
    pub fn is_leader(&self) -> bool {
        self.global_rank == 0
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    /// Blocks until every rank reached this point.
    pub fn barrier(&self) -> Result<()> {
        self.group.barrier()
    }

    /// Saves the replica's model and optimizer state for `epoch`.
    ///
    /// Any rank may call it, callers normally restrict it to rank 0 so a single writer owns
    /// each checkpoint file.
    pub fn save_state(&self, epoch: usize) -> Result<PathBuf> {
        let path = self.checkpoints.save(
            epoch,
            self.replica.model.module(),
            &*self.replica.optimiser,
        )?;

        self.event(format_args!("saved state of epoch {epoch} to {}", path.display()))?;
        Ok(path)
    }

    /// Records an event line on rank 0, a no-op elsewhere.
    pub fn event(&self, msg: impl std::fmt::Display) -> Result<()> {
        match &self.logger {
            Some(logger) => logger.event(msg),
            None => Ok(()),
        }
    }

    /// Records a scalar on rank 0, a no-op elsewhere.
    pub fn scalar(&self, tag: &str, step: usize, value: f32) -> Result<()> {
        match &self.logger {
            Some(logger) => logger.scalar(tag, step, value),
            None => Ok(()),
        }
    }
}
