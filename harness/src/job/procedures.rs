use std::fmt;

use super::WorkerContext;
use crate::{
    data::Dataset,
    error::{HarnessErr, Result},
};

/// The user procedures a job mode dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    Train,
    Evaluate,
}

impl Procedure {
    pub fn name(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Evaluate => "evaluate",
        }
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A distributed job: anything that knows how to train and evaluate a bound replica.
///
/// Both procedures run on every rank once the replica is bound and, for the restoring modes,
/// after the checkpoint was applied. Saving checkpoints every `save_every` epochs is up to
/// `train`, see [`WorkerContext::save_state`].
pub trait Job: Send + Sync {
    fn train(&self, ctx: &mut WorkerContext) -> Result<()>;

    fn evaluate(&self, ctx: &mut WorkerContext, held_out: Option<&dyn Dataset>) -> Result<()>;

    /// Whether the job supplies `procedure`.
    fn implements(&self, _procedure: Procedure) -> bool {
        true
    }
}

type TrainFn = Box<dyn Fn(&mut WorkerContext) -> anyhow::Result<()> + Send + Sync>;
type EvaluateFn =
    Box<dyn Fn(&mut WorkerContext, Option<&dyn Dataset>) -> anyhow::Result<()> + Send + Sync>;

/// A job composed from plain functions.
#[derive(Default)]
pub struct JobProcedures {
    train: Option<TrainFn>,
    evaluate: Option<EvaluateFn>,
}

impl JobProcedures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_train<F>(mut self, train: F) -> Self
    where
        F: Fn(&mut WorkerContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.train = Some(Box::new(train));
        self
    }

    pub fn with_evaluate<F>(mut self, evaluate: F) -> Self
    where
        F: Fn(&mut WorkerContext, Option<&dyn Dataset>) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.evaluate = Some(Box::new(evaluate));
        self
    }
}

impl Job for JobProcedures {
    fn train(&self, ctx: &mut WorkerContext) -> Result<()> {
        let train = self.train.as_ref().ok_or(HarnessErr::UnimplementedProcedure {
            procedure: Procedure::Train.name(),
        })?;

        train(ctx).map_err(HarnessErr::Procedure)
    }

    fn evaluate(&self, ctx: &mut WorkerContext, held_out: Option<&dyn Dataset>) -> Result<()> {
        let evaluate = self
            .evaluate
            .as_ref()
            .ok_or(HarnessErr::UnimplementedProcedure {
                procedure: Procedure::Evaluate.name(),
            })?;

        evaluate(ctx, held_out).map_err(HarnessErr::Procedure)
    }

    fn implements(&self, procedure: Procedure) -> bool {
        match procedure {
            Procedure::Train => self.train.is_some(),
            Procedure::Evaluate => self.evaluate.is_some(),
        }
    }
}

impl fmt::Debug for JobProcedures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobProcedures")
            .field("train", &self.train.is_some())
            .field("evaluate", &self.evaluate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_supplied_procedures() {
        let job = JobProcedures::new().with_train(|_| Ok(()));

        assert!(job.implements(Procedure::Train));
        assert!(!job.implements(Procedure::Evaluate));
    }
}
