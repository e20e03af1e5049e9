use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use log::info;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;

const EVENTS_FILE: &str = "events.log";
const SCALARS_FILE: &str = "scalars.jsonl";

/// One scalar data point, a line of `scalars.jsonl`.
#[derive(Debug, Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    step: usize,
    value: f32,
    wall_time: f64,
}

/// The job-level output of rank 0.
///
/// Every line is also emitted through `log`, the files under the log directory keep a copy that
/// outlives the console.
pub struct TrainingLogger {
    dir: PathBuf,
    events: Mutex<BufWriter<File>>,
    scalars: Mutex<BufWriter<File>>,
}

impl TrainingLogger {
    /// Opens the logger's files under `dir`, creating it if needed.
    ///
    /// # Arguments
    /// * `dir` - The log directory.
    ///
    /// # Returns
    /// A new `TrainingLogger` or an io error if the files can't be opened.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let open = |name: &str| -> std::io::Result<_> {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))?;

            Ok(Mutex::new(BufWriter::new(file)))
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            events: open(EVENTS_FILE)?,
            scalars: open(SCALARS_FILE)?,
        })
    }

    /// Records a free-form event line.
    pub fn event(&self, msg: impl fmt::Display) -> Result<()> {
        info!("{msg}");

        let mut events = self.events.lock();
        writeln!(events, "{:.3} {msg}", wall_time())?;
        events.flush()?;
        Ok(())
    }

    /// Records the value of `tag` at `step`.
    pub fn scalar(&self, tag: &str, step: usize, value: f32) -> Result<()> {
        info!(tag = tag, step = step, value = value; "scalar");

        let record = ScalarRecord {
            tag,
            step,
            value,
            wall_time: wall_time(),
        };

        let mut scalars = self.scalars.lock();
        serde_json::to_writer(&mut *scalars, &record).map_err(std::io::Error::from)?;
        writeln!(scalars)?;
        scalars.flush()?;
        Ok(())
    }
}

impl fmt::Debug for TrainingLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainingLogger")
            .field("dir", &self.dir)
            .finish()
    }
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_events_and_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TrainingLogger::create(dir.path().join("run")).unwrap();

        logger.event("starting").unwrap();
        logger.scalar("loss", 0, 1.5).unwrap();
        logger.scalar("loss", 1, 0.5).unwrap();

        let events = fs::read_to_string(dir.path().join("run").join(EVENTS_FILE)).unwrap();
        assert!(events.trim_end().ends_with("starting"));

        let scalars = fs::read_to_string(dir.path().join("run").join(SCALARS_FILE)).unwrap();
        let lines: Vec<serde_json::Value> = scalars
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["tag"], "loss");
        assert_eq!(lines[1]["step"], 1);
        assert_eq!(lines[1]["value"], 0.5);
    }
}
