use std::{fmt, num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{HarnessErr, Result};

const DEFAULT_INIT_METHOD: &str = "tcp://localhost:1640";
const DEFAULT_SEED: u64 = 1640;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// The kind of compute device the workers are bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Gpu,
}

/// A concrete device a model replica is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cpu,
    Gpu(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu(ordinal) => write!(f, "gpu:{ordinal}"),
        }
    }
}

/// How the executor materializes its workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    /// One OS process per rank, re-executing the current binary.
    #[default]
    Processes,
    /// One thread per rank inside the current process.
    Threads,
}

/// Platform-related configuration, read-only for the whole job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub world_size: usize,
    pub device: DeviceKind,
    /// Whether gradients must be synchronized across replicas. `None` derives it from the world size.
    pub requires_sync: Option<bool>,
    pub spawn: SpawnMode,
    /// The rendezvous address shared verbatim by every worker.
    pub init_method: String,
    pub seed: u64,
    pub connect_timeout_ms: u64,
    /// Upper bound for any single collective, unbounded when `None`.
    pub collective_timeout_ms: Option<u64>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            device: DeviceKind::default(),
            requires_sync: None,
            spawn: SpawnMode::default(),
            init_method: DEFAULT_INIT_METHOD.to_string(),
            seed: DEFAULT_SEED,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            collective_timeout_ms: None,
        }
    }
}

impl PlatformConfig {
    /// Checks the configuration before any worker is spawned.
    ///
    /// # Returns
    /// The world size, or a `Config` error if it is zero.
    pub fn validate(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.world_size)
            .ok_or_else(|| HarnessErr::Config("world size must be greater than 0".to_string()))
    }

    pub fn requires_sync(&self) -> bool {
        self.requires_sync.unwrap_or(self.world_size > 1)
    }

    /// The number of devices whose RNG has to be seeded on each worker.
    pub fn visible_devices(&self) -> usize {
        match self.device {
            DeviceKind::Cpu => 0,
            DeviceKind::Gpu => self.world_size,
        }
    }

    /// Resolves the device for a worker given its device ordinal.
    pub fn device_for(&self, ordinal: usize) -> Device {
        match self.device {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Gpu => Device::Gpu(ordinal),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn collective_timeout(&self) -> Option<Duration> {
        self.collective_timeout_ms.map(Duration::from_millis)
    }
}
