use std::{
    env,
    ffi::OsString,
    io::{self, Write},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, warn};

use super::{LOCAL_RANK_ENV, RANK_ENV, WORLD_SIZE_ENV, WorkerSpec, Workload, worker};
use crate::error::{HarnessErr, PEER_LOST_EXIT, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long a failure caused by a lost peer waits for the failure that caused it.
const ROOT_CAUSE_GRACE: Duration = Duration::from_secs(2);

/// Runs every rank as a re-execution of the current binary.
///
/// Each worker gets its rank in the environment and its spec on stdin. The first worker that
/// exits unsuccessfully fails the job and the remaining ones are killed.
pub(super) fn processes(specs: impl Iterator<Item = WorkerSpec>) -> Result<()> {
    let exe = env::current_exe()?;
    let args: Vec<OsString> = env::args_os().skip(1).collect();

    let mut children: Vec<Child> = Vec::new();

    for spec in specs {
        match spawn(&exe, &args, &spec) {
            Ok(child) => {
                debug!(rank = spec.rank, pid = child.id(); "spawned worker");
                children.push(child);
            }
            Err(e) => {
                kill_all(children.iter_mut());
                return Err(HarnessErr::WorkerFailed {
                    rank: spec.rank,
                    detail: format!("failed to spawn: {e}"),
                });
            }
        }
    }

    supervise(children)
}

fn spawn(exe: &Path, args: &[OsString], spec: &WorkerSpec) -> io::Result<Child> {
    let mut child = Command::new(exe)
        .args(args)
        .env(RANK_ENV, spec.rank.to_string())
        .env(LOCAL_RANK_ENV, spec.local_rank.to_string())
        .env(WORLD_SIZE_ENV, spec.platform.world_size.to_string())
        .stdin(Stdio::piped())
        .spawn()?;

    let sent = match child.stdin.take() {
        Some(mut stdin) => serde_json::to_writer(&mut stdin, spec)
            .map_err(io::Error::from)
            .and_then(|_| stdin.flush()),
        None => Err(io::Error::other("the worker's stdin is not piped")),
    };

    if let Err(e) = sent {
        kill_all(std::iter::once(&mut child));
        return Err(e);
    }

    Ok(child)
}

/// Waits for every child, failing fast on the first unsuccessful exit.
///
/// A worker that failed only because it lost its group is reported after a grace period, unless
/// the worker whose failure caused it exits meanwhile.
fn supervise(mut children: Vec<Child>) -> Result<()> {
    let mut exited = vec![false; children.len()];
    let mut secondary: Option<(usize, ExitStatus, Instant)> = None;

    loop {
        let mut failed = None;

        for (rank, child) in children.iter_mut().enumerate() {
            if exited[rank] {
                continue;
            }

            let Some(status) = child.try_wait()? else {
                continue;
            };

            exited[rank] = true;

            if status.success() {
                debug!(rank = rank; "worker exited");
            } else if status.code() == Some(i32::from(PEER_LOST_EXIT)) {
                warn!(rank = rank; "worker lost its group: {status}");
                if secondary.is_none() {
                    secondary = Some((rank, status, Instant::now()));
                }
            } else {
                failed = Some((rank, status));
                break;
            }
        }

        let all_exited = exited.iter().all(|&e| e);

        if failed.is_none() {
            if let Some((rank, status, since)) = secondary {
                if all_exited || since.elapsed() >= ROOT_CAUSE_GRACE {
                    failed = Some((rank, status));
                }
            }
        }

        if let Some((rank, status)) = failed {
            error!(rank = rank; "worker failed: {status}, stopping the remaining workers");
            kill_all(children.iter_mut());

            return Err(HarnessErr::WorkerFailed {
                rank,
                detail: status.to_string(),
            });
        }

        if all_exited {
            return Ok(());
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn kill_all<'a>(children: impl Iterator<Item = &'a mut Child>) {
    for child in children {
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Runs every rank on its own thread of the current process.
///
/// Every worker owns its runtime and seeded sources, so ranks share nothing but the group.
pub(super) fn threads(specs: impl Iterator<Item = WorkerSpec>, workload: &Workload) -> Result<()> {
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| -> Result<()> {
        for spec in specs {
            let rank = spec.rank;
            let tx = tx.clone();

            thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn_scoped(s, move || {
                    let res = worker::run(spec, workload);
                    if let Err(e) = &res {
                        error!(rank = rank; "{e}");
                    }

                    let _ = tx.send((rank, res));
                })?;
        }

        Ok(())
    })?;

    drop(tx);

    let mut failures: Vec<(usize, HarnessErr)> = rx
        .into_iter()
        .filter_map(|(rank, res)| res.err().map(|e| (rank, e)))
        .collect();

    failures.sort_by_key(|(rank, e)| (e.is_peer_lost(), *rank));

    match failures.into_iter().next() {
        Some((rank, source)) => Err(HarnessErr::Worker {
            rank,
            source: Box::new(source),
        }),
        None => Ok(()),
    }
}
