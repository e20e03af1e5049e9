use std::{fmt, path::PathBuf, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use super::Procedure;
use crate::{
    checkpoint::CheckpointStore,
    error::{HarnessErr, Result},
};

/// What the job does once every replica is bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    #[default]
    Train,
    /// Train again from a checkpoint.
    Resume,
    /// Evaluate a checkpointed model on the held-out set.
    Evaluate,
}

impl JobMode {
    /// Whether the mode restores a checkpoint before dispatching.
    pub fn restores(self) -> bool {
        matches!(self, Self::Resume | Self::Evaluate)
    }

    /// The user procedure the mode dispatches to.
    pub fn procedure(self) -> Procedure {
        match self {
            Self::Train | Self::Resume => Procedure::Train,
            Self::Evaluate => Procedure::Evaluate,
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Train => "train",
            Self::Resume => "resume",
            Self::Evaluate => "evaluate",
        })
    }
}

impl FromStr for JobMode {
    type Err = HarnessErr;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "resume" => Ok(Self::Resume),
            "evaluate" => Ok(Self::Evaluate),
            other => Err(HarnessErr::Config(format!("unknown job mode {other}"))),
        }
    }
}

/// A zero-argument hook run by the launcher once the whole job finished.
#[derive(Clone)]
pub struct Callback(Arc<dyn Fn() + Send + Sync>);

impl Callback {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self) {
        (self.0)()
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}

/// Training-related configuration of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub job_type: JobMode,
    /// The epoch to restore and start from, a negative value skips restoration.
    pub start_at: i64,
    /// The epoch at which training stops.
    pub epochs: usize,
    pub checkpoint_name_prefix: String,
    pub checkpoint_path: PathBuf,
    pub console_logs_path: PathBuf,
    pub training_logs_path: PathBuf,
    /// Save a checkpoint every `save_every` epochs, never if 0.
    pub save_every: usize,
    #[serde(skip)]
    pub upon_finish: Option<Callback>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_type: JobMode::default(),
            start_at: 0,
            epochs: 25,
            checkpoint_name_prefix: "ckpt".to_string(),
            checkpoint_path: PathBuf::from("./checkpoint"),
            console_logs_path: PathBuf::from("./logs/console_logs"),
            training_logs_path: PathBuf::from("./logs/training_logs"),
            save_every: 5,
            upon_finish: None,
        }
    }
}

impl JobConfig {
    /// Checks the configuration before any worker is spawned.
    pub fn validate(&self) -> Result<()> {
        let prefix = &self.checkpoint_name_prefix;
        if prefix.is_empty() || prefix.contains(['/', '\\']) {
            return Err(HarnessErr::Config(format!(
                "invalid checkpoint name prefix {prefix:?}"
            )));
        }

        Ok(())
    }

    /// The epoch whose checkpoint is restored, `None` when `start_at` is negative.
    pub fn restore_epoch(&self) -> Option<usize> {
        usize::try_from(self.start_at).ok()
    }

    /// The first epoch the training loop runs.
    pub fn first_epoch(&self) -> usize {
        self.restore_epoch().unwrap_or_default()
    }

    /// Returns this configuration resumed at `epoch`.
    pub fn resumed_at(&self, epoch: usize) -> Self {
        Self {
            start_at: epoch as i64,
            ..self.clone()
        }
    }

    /// Whether the state after `epochs_done` completed epochs is due for a checkpoint.
    pub fn should_save(&self, epochs_done: usize) -> bool {
        self.save_every > 0 && epochs_done > 0 && epochs_done % self.save_every == 0
    }

    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(&self.checkpoint_path, &self.checkpoint_name_prefix)
    }
}

impl fmt::Display for JobConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Job details:")?;
        writeln!(f, " • Job type:                          {}", self.job_type)?;
        writeln!(f, " • Starting epoch:                    {}", self.start_at)?;
        writeln!(f, " • Epochs:                            {}", self.epochs)?;
        writeln!(
            f,
            " • State/checkpoint save location:    {}",
            self.checkpoint_path.display()
        )?;
        writeln!(
            f,
            " • State/checkpoint name prefix:      {}",
            self.checkpoint_name_prefix
        )?;
        writeln!(
            f,
            " • Console logs path:                 {}",
            self.console_logs_path.display()
        )?;
        writeln!(
            f,
            " • Training logs path:                {}",
            self.training_logs_path.display()
        )?;
        write!(
            f,
            " • Save state/models every...         {} epochs",
            self.save_every
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let job = JobConfig::default();

        assert_eq!(job.job_type, JobMode::Train);
        assert_eq!(job.start_at, 0);
        assert_eq!(job.epochs, 25);
        assert_eq!(job.save_every, 5);
        assert_eq!(
            job.checkpoints().path_for(5),
            PathBuf::from("./checkpoint/ckpt_5.safetensors")
        );
    }

    #[test]
    fn negative_start_skips_restoration() {
        let job = JobConfig {
            start_at: -1,
            ..Default::default()
        };

        assert_eq!(job.restore_epoch(), None);
        assert_eq!(job.first_epoch(), 0);
        assert_eq!(job.resumed_at(3).restore_epoch(), Some(3));
        assert_eq!(job.start_at, -1);
    }

    #[test]
    fn save_schedule() {
        let mut job = JobConfig {
            save_every: 2,
            ..Default::default()
        };

        let due: Vec<_> = (0..=6).filter(|&e| job.should_save(e)).collect();
        assert_eq!(due, [2, 4, 6]);

        job.save_every = 0;
        assert!((0..=6).all(|e| !job.should_save(e)));
    }

    #[test]
    fn modes_parse_and_dispatch() {
        let job: JobConfig = serde_json::from_str(r#"{ "job_type": "evaluate" }"#).unwrap();
        assert_eq!(job.job_type, JobMode::Evaluate);
        assert!(job.job_type.restores());
        assert_eq!(job.job_type.procedure(), Procedure::Evaluate);

        assert_eq!("RESUME".parse::<JobMode>().unwrap(), JobMode::Resume);
        assert!("finetune".parse::<JobMode>().is_err());
        assert!(!JobMode::Train.restores());
    }

    #[test]
    fn rejects_prefix_with_separators() {
        let job = JobConfig {
            checkpoint_name_prefix: "a/b".to_string(),
            ..Default::default()
        };

        assert!(matches!(job.validate(), Err(HarnessErr::Config(_))));
    }
}
