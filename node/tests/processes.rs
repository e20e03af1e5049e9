use std::{
    fs,
    net::TcpListener,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};

use serde_json::json;

/// Writes a two rank process mode config under `dir`, returning its path.
fn write_config(dir: &Path) -> PathBuf {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = json!({
        "platform": {
            "world_size": 2,
            "spawn": "processes",
            "init_method": format!("tcp://{addr}"),
            "seed": 7
        },
        "job": {
            "job_type": "train",
            "start_at": 0,
            "epochs": 3,
            "checkpoint_name_prefix": "ckpt",
            "checkpoint_path": dir.join("checkpoints"),
            "save_every": 1
        },
        "bundle": {
            "model": { "features": 2 },
            "dataset": { "samples": 64, "test_samples": 16, "noise": 0.01 },
            "optimiser": { "lr": 0.05 },
            "loss_fn": "mse",
            "epochs": 3,
            "ckpt_every": 1,
            "logdir": dir.join("logs"),
            "batch_size": 8
        }
    });

    let path = dir.join("config.json");
    fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    path
}

fn node(config: &Path, overrides: &[(&str, &str)]) -> ExitStatus {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_node"));
    cmd.arg(config);

    for key in [
        "WORLD_SIZE",
        "INIT_METHOD",
        "JOB_MODE",
        "START_AT",
        "HARNESS_RANK",
        "HARNESS_LOCAL_RANK",
        "HARNESS_WORLD_SIZE",
    ] {
        cmd.env_remove(key);
    }
    cmd.envs(overrides.iter().copied());

    cmd.status().unwrap()
}

#[test]
fn two_processes_train_and_checkpoint_every_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let status = node(&config, &[]);
    assert!(status.success(), "{status}");

    for epoch in 1..=3 {
        let ckpt = dir
            .path()
            .join("checkpoints")
            .join(format!("ckpt_{epoch}.safetensors"));
        assert!(ckpt.is_file(), "missing {}", ckpt.display());
    }
    assert!(!dir.path().join("checkpoints/ckpt_4.safetensors").exists());
}

#[test]
fn resuming_from_a_missing_checkpoint_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let status = node(&config, &[("JOB_MODE", "resume"), ("START_AT", "7")]);
    assert!(!status.success(), "{status}");
    assert_eq!(status.code(), Some(1));
    assert!(!dir.path().join("checkpoints/ckpt_7.safetensors").exists());
}
