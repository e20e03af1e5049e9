//! End-of-epoch snapshots of a model and its optimizer, one `safetensors` file per epoch.

use std::{collections::HashMap, fs, io, path::PathBuf};

use log::debug;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{
    artefacts::{Model, Optimizer, StateDict},
    error::{HarnessErr, Result},
};

const EXTENSION: &str = "safetensors";
const FORMAT_KEY: &str = "format";
const FORMAT_VERSION: &str = "1";
const STOPPED_AT_KEY: &str = "stopped_at";
const MODEL: &str = "model";
const OPTIMISER: &str = "optimiser";
const META_PREFIX: &str = "meta";

/// A restored snapshot: the epoch it was taken at and both exported states.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub stopped_at: usize,
    pub model: StateDict,
    pub optimiser: StateDict,
}

impl CheckpointRecord {
    /// Snapshots the current state of `model` and `optimiser`.
    pub fn capture(stopped_at: usize, model: &dyn Model, optimiser: &dyn Optimizer) -> Self {
        Self {
            stopped_at,
            model: model.export_state(),
            optimiser: optimiser.export_state(),
        }
    }

    /// Loads both states back into `model` and `optimiser`.
    ///
    /// # Returns
    /// The epoch the snapshot was taken at, which the caller resumes from.
    pub fn apply(self, model: &mut dyn Model, optimiser: &mut dyn Optimizer) -> Result<usize> {
        model.import_state(&self.model)?;
        optimiser.import_state(&self.optimiser)?;
        Ok(self.stopped_at)
    }
}

/// Reads and writes `<dir>/<prefix>_<epoch>.safetensors`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointStore {
    dir: PathBuf,
    prefix: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// The file holding the snapshot of `epoch`.
    pub fn path_for(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{}_{epoch}.{EXTENSION}", self.prefix))
    }

    /// Writes the snapshot of `model` and `optimiser` for `epoch`, overwriting any previous one.
    ///
    /// # Returns
    /// The path of the written file.
    pub fn save(
        &self,
        epoch: usize,
        model: &dyn Model,
        optimiser: &dyn Optimizer,
    ) -> Result<PathBuf> {
        self.save_record(&CheckpointRecord::capture(epoch, model, optimiser))
    }

    /// Writes `record` to a temporary file, then renames it over the epoch's path, so a
    /// crash mid-write never leaves a file `restore` accepts.
    pub fn save_record(&self, record: &CheckpointRecord) -> Result<PathBuf> {
        let path = self.path_for(record.stopped_at);
        let bytes = encode(record).map_err(|detail| HarnessErr::CorruptCheckpoint {
            path: path.clone(),
            detail,
        })?;

        fs::create_dir_all(&self.dir)?;

        let tmp = self
            .dir
            .join(format!(".{}_{}.{EXTENSION}.tmp", self.prefix, record.stopped_at));

        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;

        debug!(epoch = record.stopped_at; "saved checkpoint {}", path.display());
        Ok(path)
    }

    /// Reads the snapshot of `epoch`.
    ///
    /// # Returns
    /// `MissingCheckpoint` if there is no file for `epoch`, `CorruptCheckpoint` if it can't be parsed.
    pub fn restore(&self, epoch: usize) -> Result<CheckpointRecord> {
        let path = self.path_for(epoch);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(HarnessErr::MissingCheckpoint { epoch, path });
            }
            Err(e) => return Err(e.into()),
        };

        let record = decode(&bytes).map_err(|detail| HarnessErr::CorruptCheckpoint {
            path: path.clone(),
            detail,
        })?;

        debug!(epoch = record.stopped_at; "restored checkpoint {}", path.display());
        Ok(record)
    }
}

fn encode(record: &CheckpointRecord) -> std::result::Result<Vec<u8>, String> {
    let mut metadata = HashMap::new();
    metadata.insert(FORMAT_KEY.to_string(), FORMAT_VERSION.to_string());
    metadata.insert(STOPPED_AT_KEY.to_string(), record.stopped_at.to_string());

    let mut views = Vec::new();

    for (section, state) in [(MODEL, &record.model), (OPTIMISER, &record.optimiser)] {
        for (name, values) in state.tensors() {
            let data = bytemuck::cast_slice(values);
            let view = TensorView::new(Dtype::F32, vec![values.len()], data)
                .map_err(|e| format!("{section}.{name}: {e:?}"))?;

            views.push((format!("{section}.{name}"), view));
        }

        for (key, value) in state.metas() {
            metadata.insert(format!("{META_PREFIX}.{section}.{key}"), value.to_string());
        }
    }

    let views = views.iter().map(|(name, view)| (name.as_str(), view));
    safetensors::serialize(views, &Some(metadata)).map_err(|e| format!("{e:?}"))
}

fn decode(bytes: &[u8]) -> std::result::Result<CheckpointRecord, String> {
    let (_, header) = SafeTensors::read_metadata(bytes).map_err(|e| format!("{e:?}"))?;
    let metadata = header
        .metadata()
        .as_ref()
        .ok_or("the header carries no metadata")?;

    match metadata.get(FORMAT_KEY).map(String::as_str) {
        Some(FORMAT_VERSION) => {}
        other => return Err(format!("unsupported format version {other:?}")),
    }

    let stopped_at = metadata
        .get(STOPPED_AT_KEY)
        .ok_or("missing the stopped_at epoch")?
        .parse::<usize>()
        .map_err(|e| format!("invalid stopped_at epoch: {e}"))?;

    let mut model = StateDict::new();
    let mut optimiser = StateDict::new();

    for (key, value) in metadata {
        let Some(rest) = key.strip_prefix(META_PREFIX).and_then(|r| r.strip_prefix('.')) else {
            continue;
        };

        let (owner, key) = rest
            .split_once('.')
            .ok_or_else(|| format!("malformed metadata key {rest}"))?;

        section(&mut model, &mut optimiser, owner)
            .ok_or_else(|| format!("metadata for unknown section {owner}"))?
            .insert_meta(key, value.as_str());
    }

    let tensors = SafeTensors::deserialize(bytes).map_err(|e| format!("{e:?}"))?;

    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(format!("tensor {name} is {:?}, expected F32", view.dtype()));
        }

        let (owner, tensor) = name
            .split_once('.')
            .ok_or_else(|| format!("tensor {name} has no section"))?;

        let values = view
            .data()
            .chunks_exact(size_of::<f32>())
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        section(&mut model, &mut optimiser, owner)
            .ok_or_else(|| format!("tensor {name} belongs to an unknown section"))?
            .insert_tensor(tensor, values);
    }

    Ok(CheckpointRecord {
        stopped_at,
        model,
        optimiser,
    })
}

fn section<'a>(
    model: &'a mut StateDict,
    optimiser: &'a mut StateDict,
    owner: &str,
) -> Option<&'a mut StateDict> {
    match owner {
        MODEL => Some(model),
        OPTIMISER => Some(optimiser),
        _ => None,
    }
}
