use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{HarnessErr, Result},
    job::JobConfig,
};

const REQUIRED_KEYS: [&str; 7] = [
    "model",
    "dataset",
    "optimiser",
    "loss_fn",
    "epochs",
    "ckpt_every",
    "logdir",
];

const DEFAULT_BATCH_SIZE: usize = 100;

/// The immutable arguments every worker receives at spawn time.
///
/// The artefact entries are descriptions, not live objects: each worker's factory builds its
/// own model, dataset, optimizer and loss from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgBundle {
    pub model: Value,
    pub dataset: Value,
    pub optimiser: Value,
    pub loss_fn: Value,
    pub epochs: usize,
    pub ckpt_every: usize,
    /// Where rank 0 writes its training logs.
    pub logdir: PathBuf,
    #[serde(default)]
    pub optimiser_step: Option<Value>,
    /// Pins the device ordinal of every worker when present.
    #[serde(default)]
    pub local_rank: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_shuffle() -> bool {
    true
}

impl ArgBundle {
    /// Parses a bundle from its JSON mapping.
    ///
    /// # Returns
    /// A `Config` error naming the first missing required key, or describing the malformed entry.
    pub fn from_value(value: Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| HarnessErr::Config("the argument bundle must be a mapping".to_string()))?;

        if let Some(key) = REQUIRED_KEYS.iter().find(|key| !map.contains_key(**key)) {
            return Err(HarnessErr::Config(format!(
                "the argument bundle is missing the required key `{key}`"
            )));
        }

        Ok(serde_json::from_value(value)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(HarnessErr::Config(
                "batch size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Checks that the bundle's training schedule agrees with `job`, the one the workers follow.
    ///
    /// # Returns
    /// A `Config` error naming the first entry that disagrees.
    pub fn check_schedule(&self, job: &JobConfig) -> Result<()> {
        let schedule = [
            ("epochs", self.epochs, "epochs", job.epochs),
            ("ckpt_every", self.ckpt_every, "save_every", job.save_every),
        ];

        for (key, value, job_key, expected) in schedule {
            if value != expected {
                return Err(HarnessErr::Config(format!(
                    "bundle `{key}` is {value} but job `{job_key}` is {expected}"
                )));
            }
        }

        Ok(())
    }
}
