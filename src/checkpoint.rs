//! Run checkpoints and model files.
//!
//! A checkpoint captures everything a training run needs to continue
//! exactly: network parameters and masks, optimizer moments, the epoch
//! cursor, the best validation loss and the Lagrangian multipliers.
//! Values are written as JSON with round-trip float formatting, so a
//! reload is bit-identical.
//!
//! Writes go to `<id>.ckp.tmp` first and are renamed over `<id>.ckp`, so an
//! interrupted save never leaves a truncated checkpoint behind.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::{NetworkSnapshot, PnnError, PnnResult};
use crate::training::{AdamState, LagrangianState};

/// Serializable state of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Next epoch to run.
    pub epoch: usize,
    pub network: NetworkSnapshot,
    pub optimizer: AdamState,
    /// Best validation loss so far; `None` before the first improvement.
    pub best_loss: Option<f64>,
    /// Learning rate the run started with.
    pub initial_lr: f64,
    /// `(λ, μ)` of augmented-Lagrangian runs.
    pub lagrangian: Option<LagrangianState>,
    /// Number of multiplier updates so far.
    pub al_updates: usize,
}

impl Checkpoint {
    /// Name of the first field holding NaN or an infinity.
    fn first_non_finite(&self) -> Option<String> {
        let rows_finite = |rows: &[Vec<f64>]| rows.iter().flatten().all(|v| v.is_finite());
        if let Some(name) = self
            .network
            .parameters
            .iter()
            .find(|(_, rows)| !rows_finite(rows.as_slice()))
            .map(|(name, _)| name)
        {
            return Some(format!("parameter {name}"));
        }
        if let Some(name) = self
            .optimizer
            .moments
            .iter()
            .find(|(_, mv)| !rows_finite(mv.m.as_slice()) || !rows_finite(mv.v.as_slice()))
            .map(|(name, _)| name)
        {
            return Some(format!("optimizer moment of {name}"));
        }
        let scalars = [
            ("learning rate", Some(self.optimizer.lr)),
            ("best loss", self.best_loss),
            ("initial learning rate", Some(self.initial_lr)),
            ("lambda", self.lagrangian.map(|s| s.lambda)),
            ("mu", self.lagrangian.map(|s| s.mu)),
        ];
        scalars
            .into_iter()
            .find(|(_, v)| v.is_some_and(|v| !v.is_finite()))
            .map(|(field, _)| field.to_string())
    }
}

/// Directory of run checkpoints keyed by run id.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> PnnResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| PnnError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.ckp"))
    }

    pub fn exists(&self, run_id: &str) -> bool {
        self.path(run_id).is_file()
    }

    /// Atomically replace the checkpoint of `checkpoint.run_id`.
    ///
    /// Non-finite values are refused, since JSON cannot represent them.
    pub fn save(&self, checkpoint: &Checkpoint) -> PnnResult<()> {
        validate_run_id(&checkpoint.run_id)?;
        if let Some(field) = checkpoint.first_non_finite() {
            return Err(PnnError::Checkpoint(format!(
                "run {} has a non-finite {field}",
                checkpoint.run_id
            )));
        }
        let path = self.path(&checkpoint.run_id);
        let tmp = self.dir.join(format!("{}.ckp.tmp", checkpoint.run_id));

        let json = serde_json::to_vec(checkpoint)?;
        let mut file = fs::File::create(&tmp).map_err(|e| PnnError::io(&tmp, e))?;
        file.write_all(&json).map_err(|e| PnnError::io(&tmp, e))?;
        file.sync_all().map_err(|e| PnnError::io(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, &path).map_err(|e| PnnError::io(&path, e))
    }

    /// The checkpoint of `run_id`, or `None` if there is none.
    pub fn load(&self, run_id: &str) -> PnnResult<Option<Checkpoint>> {
        validate_run_id(run_id)?;
        let path = self.path(run_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PnnError::io(&path, e)),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).map_err(|e| {
            PnnError::Checkpoint(format!("{} is unreadable: {e}", path.display()))
        })?;
        if checkpoint.run_id != run_id {
            return Err(PnnError::Checkpoint(format!(
                "{} belongs to run {:?}",
                path.display(),
                checkpoint.run_id
            )));
        }
        Ok(Some(checkpoint))
    }

    /// Remove the checkpoint of `run_id`. A missing file is not an error.
    pub fn delete(&self, run_id: &str) -> PnnResult<()> {
        validate_run_id(run_id)?;
        let path = self.path(run_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PnnError::io(&path, e)),
        }
    }
}

/// Run ids become file names: ASCII letters, digits, `-`, `_` and `.` only.
fn validate_run_id(run_id: &str) -> PnnResult<()> {
    let valid = !run_id.is_empty()
        && !run_id.starts_with('.')
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PnnError::Checkpoint(format!("invalid run id {run_id:?}")))
    }
}

/// Save a trained network to a JSON model file.
pub fn save_model(path: &Path, snapshot: &NetworkSnapshot) -> PnnResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PnnError::io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(snapshot)?;
    fs::write(path, json).map_err(|e| PnnError::io(path, e))
}

/// Load a network snapshot written by [`save_model`].
pub fn load_model(path: &Path) -> PnnResult<NetworkSnapshot> {
    let json = fs::read_to_string(path).map_err(|e| PnnError::io(path, e))?;
    Ok(serde_json::from_str(&json)?)
}
