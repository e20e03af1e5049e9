use std::{env, fs, path::Path, str::FromStr};

use anyhow::Context;
use harness::{ArgBundle, JobConfig, JobMode, PlatformConfig};
use serde::Deserialize;

const WORLD_SIZE: &str = "WORLD_SIZE";
const INIT_METHOD: &str = "INIT_METHOD";
const JOB_MODE: &str = "JOB_MODE";
const START_AT: &str = "START_AT";

/// The contents of the node's configuration file.
#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub job: JobConfig,
    pub bundle: serde_json::Value,
}

impl NodeConfig {
    /// Reads the configuration at `path` and applies the environment overrides.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<(PlatformConfig, JobConfig, ArgBundle)> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        config.resolve(|key| env::var(key).ok())
    }

    /// Applies the overrides returned by `var` and parses the bundle.
    fn resolve(
        self,
        var: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<(PlatformConfig, JobConfig, ArgBundle)> {
        let Self {
            mut platform,
            mut job,
            bundle,
        } = self;

        if let Some(world_size) = parsed(&var, WORLD_SIZE)? {
            platform.world_size = world_size;
        }
        if let Some(init_method) = var(INIT_METHOD) {
            platform.init_method = init_method;
        }
        if let Some(mode) = var(JOB_MODE) {
            job.job_type = JobMode::from_str(&mode)?;
        }
        if let Some(start_at) = parsed(&var, START_AT)? {
            job.start_at = start_at;
        }

        let bundle = ArgBundle::from_value(bundle)?;
        Ok((platform, job, bundle))
    }
}

fn parsed<T>(var: impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|value| value.parse().with_context(|| format!("invalid {key} {value:?}")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config() -> NodeConfig {
        serde_json::from_value(serde_json::json!({
            "platform": { "world_size": 2 },
            "job": { "epochs": 4 },
            "bundle": {
                "model": { "features": 3 },
                "dataset": { "samples": 64 },
                "optimiser": { "lr": 0.1 },
                "loss_fn": "mse",
                "epochs": 4,
                "ckpt_every": 2,
                "logdir": "./logs"
            }
        }))
        .unwrap()
    }

    #[test]
    fn environment_overrides_the_file() {
        let env: HashMap<&str, &str> = [
            (WORLD_SIZE, "4"),
            (INIT_METHOD, "tcp://127.0.0.1:7000"),
            (JOB_MODE, "resume"),
            (START_AT, "2"),
        ]
        .into();

        let (platform, job, bundle) = config()
            .resolve(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(platform.world_size, 4);
        assert_eq!(platform.init_method, "tcp://127.0.0.1:7000");
        assert_eq!(job.job_type, JobMode::Resume);
        assert_eq!(job.start_at, 2);
        assert_eq!(job.epochs, 4);
        assert_eq!(bundle.ckpt_every, 2);
    }

    #[test]
    fn file_values_stand_without_overrides() {
        let (platform, job, _) = config().resolve(|_| None).unwrap();

        assert_eq!(platform.world_size, 2);
        assert_eq!(job.job_type, JobMode::Train);
    }

    #[test]
    fn invalid_override_is_reported() {
        let err = config()
            .resolve(|key| (key == WORLD_SIZE).then(|| "many".to_string()))
            .unwrap_err();

        assert!(err.to_string().contains(WORLD_SIZE));
    }
}
