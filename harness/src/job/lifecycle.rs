use super::{Job, Procedure, WorkerContext};
use crate::error::{HarnessErr, Result};

/// Runs the job's procedure for the configured mode on one worker.
///
/// `Train` dispatches straight to `train`. `Resume` and `Evaluate` first restore the checkpoint
/// of `start_at` (skipped when it is negative) and move the job to the restored epoch, then
/// dispatch to `train` and `evaluate` respectively. The procedure is checked up front, a missing
/// one fails before any checkpoint is read.
///
/// # Arguments
/// * `job` - The user's job.
/// * `ctx` - The bound worker.
///
/// # Returns
/// `UnimplementedProcedure` if the job lacks the procedure, `MissingCheckpoint` if the
/// requested checkpoint doesn't exist, or the procedure's own error.
pub fn dispatch(job: &dyn Job, ctx: &mut WorkerContext) -> Result<()> {
    let mode = ctx.job.job_type;
    let procedure = mode.procedure();

    if !job.implements(procedure) {
        return Err(HarnessErr::UnimplementedProcedure {
            procedure: procedure.name(),
        });
    }

    if mode.restores() {
        match ctx.job.restore_epoch() {
            Some(epoch) => {
                let record = ctx.checkpoints.restore(epoch)?;
                let replica = &mut ctx.replica;
                let stopped_at =
                    record.apply(replica.model.module_mut(), &mut *replica.optimiser)?;

                ctx.job = ctx.job.resumed_at(stopped_at);
                ctx.event(format_args!(
                    "restored {} from epoch {stopped_at}",
                    ctx.checkpoints.path_for(epoch).display()
                ))?;
            }
            None => ctx.event(format_args!(
                "{mode}: start_at is {}, skipping restoration",
                ctx.job.start_at
            ))?,
        }
    }

    ctx.event(format_args!(
        "{mode}: running {procedure} from epoch {} to {}",
        ctx.job.first_epoch(),
        ctx.job.epochs
    ))?;

    match procedure {
        Procedure::Train => job.train(ctx)?,
        Procedure::Evaluate => {
            let held_out = ctx.replica.test_set.clone();
            job.evaluate(ctx, held_out.as_deref())?;
        }
    }

    ctx.event(format_args!("{mode}: {procedure} finished"))
}
