mod config;
mod model;
mod regression;

use std::{env, process::ExitCode};

use anyhow::Context;
use harness::{Executor, HarnessErr, JobProcedures, Workload};
use log::error;

use crate::config::NodeConfig;

const DEFAULT_CONFIG: &str = "node/config.json";

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            let code = e.downcast_ref::<HarnessErr>().map_or(1, HarnessErr::exit_code);
            ExitCode::from(code)
        }
    }
}

/// Loads the configuration and submits the job.
///
/// Worker processes re-execute this binary with the same arguments and end up in the same
/// `submit` call, which runs their rank instead of launching.
fn run() -> anyhow::Result<()> {
    let path = env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let (platform, job, bundle) =
        NodeConfig::load(&path).with_context(|| format!("failed to load {path}"))?;

    let procedures = JobProcedures::new()
        .with_train(regression::train)
        .with_evaluate(regression::evaluate);

    let workload = Workload::new(regression::artefacts, procedures);
    Executor::new(platform, job).submit(&bundle, &workload)?;

    Ok(())
}
