//! Training loops, loss, optimizer and metrics.
//!
//! ## Submodules
//!
//! - [`loss`]: Weighted-sum and augmented-Lagrangian power penalties
//! - [`optim`]: Adam with checkpointable state
//! - [`evaluator`]: Accuracy and power of a batch
//! - [`engine`]: Progressive annealing and the augmented-Lagrangian outer loop

pub mod engine;
pub mod evaluator;
pub mod loss;
pub mod optim;

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::core::{PnnError, PnnResult};

pub use engine::{Outcome, Phase, TrainingEngine, TrainingSummary};
pub use evaluator::{Evaluation, Evaluator};
pub use loss::{LagrangianState, LossFunction, LossTerms, Penalty};
pub use optim::{Adam, AdamState};

/// Metrics of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Sample-weighted mean loss over training batches, before each step.
    pub train_loss: f64,
    /// Sample-weighted mean loss over validation batches.
    pub valid_loss: f64,
    pub train_accuracy: f64,
    pub valid_accuracy: f64,
    /// Sample-weighted mean power over training batches.
    pub train_power: f64,
    pub valid_power: f64,
    pub lr: f64,
    pub patience: usize,
    pub lambda: Option<f64>,
    pub mu: Option<f64>,
    pub epoch_secs: f64,
}

/// Appends one JSON object per line to a metrics file.
#[derive(Debug)]
pub struct MetricsRecorder {
    path: PathBuf,
    writer: BufWriter<File>,
}

#[derive(Serialize)]
struct Event<'a, T: Serialize> {
    event: &'a str,
    run: &'a str,
    #[serde(flatten)]
    data: &'a T,
}

impl MetricsRecorder {
    /// Open `path` for appending, creating parent directories.
    pub fn open(path: &Path) -> PnnResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PnnError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| PnnError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `{"event": ..., "run": ..., <data fields>}` and flush.
    pub fn record<T: Serialize>(&mut self, event: &str, run: &str, data: &T) -> PnnResult<()> {
        let line = serde_json::to_string(&Event { event, run, data })?;
        writeln!(self.writer, "{line}").map_err(|e| PnnError::io(&self.path, e))?;
        self.writer.flush().map_err(|e| PnnError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_appends_json_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("out").join("metrics.jsonl");
        let metrics = EpochMetrics {
            epoch: 3,
            train_loss: 0.5,
            valid_loss: 0.6,
            train_accuracy: 0.9,
            valid_accuracy: 0.85,
            train_power: 1e-4,
            valid_power: 1e-4,
            lr: 0.1,
            patience: 0,
            lambda: None,
            mu: None,
            epoch_secs: 0.01,
        };
        {
            let mut recorder = MetricsRecorder::open(&path).expect("open");
            recorder.record("epoch", "run", &metrics).expect("record");
            recorder.record("epoch", "run", &metrics).expect("record");
        }
        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(value["event"], "epoch");
        assert_eq!(value["epoch"], 3);
    }
}
