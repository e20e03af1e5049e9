mod bundle;
mod spawner;
mod worker;

use std::{env, io, sync::Arc};

use log::info;

pub use bundle::ArgBundle;
use worker::WorkerSpec;

use crate::{
    artefacts::Artefacts,
    error::{HarnessErr, Result},
    group::InitMethod,
    job::{Job, JobConfig, Procedure},
    platform::{PlatformConfig, SpawnMode},
    seed::SeededRngs,
};

/// Set on a worker process to its global rank.
pub const RANK_ENV: &str = "HARNESS_RANK";
/// Set on a worker process to its rank on the host.
pub const LOCAL_RANK_ENV: &str = "HARNESS_LOCAL_RANK";
/// Set on a worker process to the group's world size.
pub const WORLD_SIZE_ENV: &str = "HARNESS_WORLD_SIZE";

/// Builds a worker's artefacts from the argument bundle and the worker's seeded sources.
pub type ArtefactsFactory =
    Arc<dyn Fn(&ArgBundle, &mut SeededRngs) -> anyhow::Result<Artefacts> + Send + Sync>;

/// The code every worker runs: how to build its artefacts and the job to dispatch to.
#[derive(Clone)]
pub struct Workload {
    factory: ArtefactsFactory,
    job: Arc<dyn Job>,
}

impl Workload {
    pub fn new<F, J>(factory: F, job: J) -> Self
    where
        F: Fn(&ArgBundle, &mut SeededRngs) -> anyhow::Result<Artefacts> + Send + Sync + 'static,
        J: Job + 'static,
    {
        Self {
            factory: Arc::new(factory),
            job: Arc::new(job),
        }
    }

    pub fn job(&self) -> &dyn Job {
        self.job.as_ref()
    }
}

/// Launches a job over `world_size` workers and waits for all of them.
#[derive(Debug, Clone)]
pub struct Executor {
    platform: PlatformConfig,
    job: JobConfig,
}

impl Executor {
    pub fn new(platform: PlatformConfig, job: JobConfig) -> Self {
        Self { platform, job }
    }

    pub fn platform(&self) -> &PlatformConfig {
        &self.platform
    }

    pub fn job(&self) -> &JobConfig {
        &self.job
    }

    /// Runs `workload` on every rank.
    ///
    /// In process mode the launcher re-executes the current binary once per rank. Those workers
    /// reach this same call, find their rank in the environment and run it instead of
    /// launching, so `submit` has to be reached unconditionally from `main`.
    ///
    /// # Arguments
    /// * `bundle` - The arguments shared by every worker.
    /// * `workload` - The artefact factory and the job.
    ///
    /// # Returns
    /// A configuration error before anything is spawned, or the failure of the first worker
    /// that failed on its own account.
    pub fn submit(&self, bundle: &ArgBundle, workload: &Workload) -> Result<()> {
        if let Some(rank) = worker_rank()? {
            return self.run_spawned(rank, workload);
        }

        let world_size = self.platform.validate()?;
        self.job.validate()?;
        bundle.validate()?;
        bundle.check_schedule(&self.job)?;
        InitMethod::parse(&self.platform.init_method)?;

        for procedure in [Procedure::Train, Procedure::Evaluate] {
            if !workload.job.implements(procedure) {
                return Err(HarnessErr::UnimplementedProcedure {
                    procedure: procedure.name(),
                });
            }
        }

        info!(
            world_size = world_size.get();
            "launching {} through {} ({:?})",
            self.job.job_type, self.platform.init_method, self.platform.spawn
        );

        let specs = (0..world_size.get()).map(|rank| WorkerSpec {
            rank,
            local_rank: rank,
            platform: self.platform.clone(),
            job: self.job.clone(),
            bundle: bundle.clone(),
        });

        match self.platform.spawn {
            SpawnMode::Processes => spawner::processes(specs)?,
            SpawnMode::Threads => spawner::threads(specs, workload)?,
        }

        if let Some(callback) = &self.job.upon_finish {
            callback.call();
        }

        Ok(())
    }

    /// Runs the rank of a worker process, its spec arrives on stdin.
    fn run_spawned(&self, rank: usize, workload: &Workload) -> Result<()> {
        let spec: WorkerSpec = serde_json::from_reader(io::stdin().lock())?;
        spec.check_placement(rank, env_usize(LOCAL_RANK_ENV)?, env_usize(WORLD_SIZE_ENV)?)?;

        worker::run(spec, workload)
    }
}

/// The rank of this process when it is a spawned worker.
fn worker_rank() -> Result<Option<usize>> {
    env_usize(RANK_ENV)
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| HarnessErr::Config(format!("invalid {key} {value}: {e}"))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(HarnessErr::Config(format!("invalid {key}: {e}"))),
    }
}
