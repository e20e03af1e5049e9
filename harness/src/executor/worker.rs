use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{ArgBundle, Workload};
use crate::{
    error::{HarnessErr, Result},
    group::{GroupOptions, ProcessGroup},
    job::{self, JobConfig, WorkerContext},
    logger::TrainingLogger,
    platform::PlatformConfig,
    replication::ReplicationBinder,
    seed::SeedController,
};

/// Everything a worker needs to run its rank, sent once at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WorkerSpec {
    pub rank: usize,
    pub local_rank: usize,
    pub platform: PlatformConfig,
    pub job: JobConfig,
    pub bundle: ArgBundle,
}

impl WorkerSpec {
    /// Checks that this spec was delivered to the worker the launcher placed it on.
    ///
    /// # Arguments
    /// * `rank` - The rank found in the worker's environment.
    /// * `local_rank` - The local rank found in the environment, if any.
    /// * `world_size` - The world size found in the environment, if any.
    pub fn check_placement(
        &self,
        rank: usize,
        local_rank: Option<usize>,
        world_size: Option<usize>,
    ) -> Result<()> {
        let placement = [
            ("rank", Some(rank), self.rank),
            ("local rank", local_rank, self.local_rank),
            ("world size", world_size, self.platform.world_size),
        ];

        for (what, found, expected) in placement {
            match found {
                Some(found) if found != expected => {
                    return Err(HarnessErr::Config(format!(
                        "worker {what} {found} does not match the spec's {expected}"
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Runs one rank from seeding to teardown.
///
/// The barriers after joining and after binding keep every rank in the same phase: no rank binds
/// before the group is complete and no rank dispatches before every replica is bound. Teardown
/// starts with a final barrier, so no rank leaves while a peer is still running its procedure.
pub(crate) fn run(spec: WorkerSpec, workload: &Workload) -> Result<()> {
    let WorkerSpec {
        rank,
        local_rank,
        platform,
        job,
        bundle,
    } = spec;

    let bundle = Arc::new(bundle);
    let mut rngs = SeedController::new(platform.seed).seed_all(platform.visible_devices());

    let group = Arc::new(ProcessGroup::new(GroupOptions::from_platform(&platform, rank))?);
    group.join()?;
    group.barrier()?;

    let artefacts = (workload.factory)(&bundle, &mut rngs).map_err(HarnessErr::Artefacts)?;
    let binder = ReplicationBinder::new(&platform, &bundle, local_rank, Arc::clone(&group))?;
    let replica = binder.bind(artefacts)?;
    group.barrier()?;

    let logger = match rank {
        0 => {
            let logger = TrainingLogger::create(&bundle.logdir)?;
            logger.event(&job)?;
            Some(logger)
        }
        _ => None,
    };

    let mut ctx = WorkerContext::new(
        local_rank,
        job,
        bundle,
        replica,
        logger,
        rngs,
        Arc::clone(&group),
    );

    job::dispatch(workload.job.as_ref(), &mut ctx)?;
    drop(ctx);

    group.teardown()?;
    debug!(rank = rank; "worker finished");

    if rank == 0 {
        info!("job finished on every rank");
    }

    Ok(())
}
