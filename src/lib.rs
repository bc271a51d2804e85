//! # PNN (Printed Neural Networks)
//!
//! Power-aware training of printed analog neural networks from first principles.
//!
//! ## Overview
//!
//! A printed neural network is a stack of resistor crossbars. Each crossbar
//! computes a normalized weighted sum of its inputs; a printed nonlinear
//! circuit then squashes every output. Physical conductances cannot be
//! negative, so negative weights are realized by routing the input through a
//! printed negation circuit first.
//!
//! Training minimizes classification loss while keeping the circuit's power
//! below a budget, either by a fixed weighted penalty or by an
//! augmented-Lagrangian outer loop.
//!
//! ## Structure
//!
//! - [`autodiff`]: Reverse-mode tape over 2-D arrays
//! - [`core`]: Surrogates, nonlinear circuits, crossbar layers, network and power model
//! - [`training`]: Loss, optimizer, evaluator and the annealing/AL state machine
//! - [`checkpoint`]: Crash-safe run checkpoints and model files
//! - [`data`]: Dataset loading, normalization, splitting and batching
//! - [`utils`]: Math and array conversion helpers

pub mod autodiff;
pub mod checkpoint;
pub mod core;
pub mod data;
pub mod training;
pub mod utils;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub use crate::core::{
    CircuitKind, CircuitLayer, ConductanceBounds, Network, NonlinearCircuit, PnnError, PnnResult,
    PruningReport, SurrogatePackage,
};
pub use training::{Adam, EpochMetrics, Evaluator, LossFunction, Outcome, TrainingEngine};

/// Which power penalty the loss applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PenaltySelector {
    /// `(1 − β)·task + β·power` with fixed β.
    WeightedSum,
    /// `task + λ·C + μ/2·max(0, C)²` with an outer multiplier loop.
    AugmentedLagrangian,
}

impl FromStr for PenaltySelector {
    type Err = PnnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power" => Ok(PenaltySelector::WeightedSum),
            "AL" | "al" => Ok(PenaltySelector::AugmentedLagrangian),
            other => Err(PnnError::InvalidConfig(format!(
                "unknown penalty selector {other:?}, expected \"power\" or \"AL\""
            ))),
        }
    }
}

impl TryFrom<String> for PenaltySelector {
    type Error = PnnError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PenaltySelector> for String {
    fn from(p: PenaltySelector) -> String {
        p.to_string()
    }
}

impl fmt::Display for PenaltySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PenaltySelector::WeightedSum => write!(f, "power"),
            PenaltySelector::AugmentedLagrangian => write!(f, "AL"),
        }
    }
}

/// Training and circuit configuration.
///
/// Loadable from JSON; every field is optional there and falls back to
/// [`Config::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Compute device. Only `"cpu"` is supported.
    pub device: String,
    pub lr: f64,
    /// Annealing stops once the learning rate drops to this floor.
    pub lr_min: f64,
    pub lr_decay: f64,
    /// Epochs without validation improvement before the learning rate decays.
    pub patience: usize,
    /// Wall-clock budget of one training run.
    pub time_limit_hours: f64,
    /// Power budget in watts for the augmented-Lagrangian constraint.
    pub power_budget: f64,
    pub penalty: PenaltySelector,
    /// β of the weighted-sum penalty, in `[0, 1]`.
    pub power_balance: f64,
    /// Also optimize the nonlinear circuit designs.
    pub train_circuits: bool,
    pub gmin: f64,
    pub gmax: f64,
    pub pgmin: f64,
    /// Log a progress line every this many epochs.
    pub report_every: usize,
    pub mu_init: f64,
    pub mu_growth: f64,
    pub seed: u64,
    /// Mini-batch size; 0 uses the whole split as one batch.
    pub batch_size: usize,
    /// Initial unconstrained activation design (6 values).
    pub activation_design: Vec<f64>,
    /// Initial unconstrained negation design (9 values).
    pub negation_design: Vec<f64>,
    /// Surrogate package files; the built-in nominal calibration is used when absent.
    pub activation_package: Option<PathBuf>,
    pub negation_package: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            lr: 0.1,
            lr_min: 1e-4,
            lr_decay: 0.5,
            patience: 100,
            time_limit_hours: 45.0,
            power_budget: 1e-3,
            penalty: PenaltySelector::WeightedSum,
            power_balance: 0.5,
            train_circuits: false,
            gmin: 0.01,
            gmax: 10.0,
            pgmin: 1e-7,
            report_every: 10,
            mu_init: 1.0,
            mu_growth: 1.5,
            seed: 0,
            batch_size: 0,
            activation_design: vec![0.0; CircuitKind::Activation.design_len()],
            negation_design: vec![0.0; CircuitKind::Negation.design_len()],
            activation_package: None,
            negation_package: None,
        }
    }
}

impl Config {
    /// Read a JSON config file and validate it.
    pub fn from_json_file(path: &Path) -> PnnResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| PnnError::io(path, e))?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the training loop cannot run with.
    pub fn validate(&self) -> PnnResult<()> {
        let fail = |msg: String| Err(PnnError::InvalidConfig(msg));
        if self.device != "cpu" {
            return fail(format!("unsupported device {:?}", self.device));
        }
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return fail(format!("lr must be positive, got {}", self.lr));
        }
        if !(self.lr_min > 0.0 && self.lr_min < self.lr) {
            return fail(format!(
                "lr_min must lie in (0, lr), got {} with lr {}",
                self.lr_min, self.lr
            ));
        }
        if !(self.lr_decay > 0.0 && self.lr_decay < 1.0) {
            return fail(format!("lr_decay must lie in (0, 1), got {}", self.lr_decay));
        }
        if !(self.time_limit_hours > 0.0 && self.time_limit_hours.is_finite()) {
            return fail(format!(
                "time_limit_hours must be positive, got {}",
                self.time_limit_hours
            ));
        }
        if !(0.0..=1.0).contains(&self.power_balance) {
            return fail(format!(
                "power_balance must lie in [0, 1], got {}",
                self.power_balance
            ));
        }
        if !self.power_budget.is_finite() {
            return fail("power_budget must be finite".to_string());
        }
        if !(self.gmin >= 0.0 && self.gmin < self.gmax) {
            return fail(format!(
                "conductance bounds need 0 <= gmin < gmax, got {} and {}",
                self.gmin, self.gmax
            ));
        }
        if self.pgmin <= 0.0 {
            return fail(format!("pgmin must be positive, got {}", self.pgmin));
        }
        if self.report_every == 0 {
            return fail("report_every must be at least 1".to_string());
        }
        if self.mu_init <= 0.0 || self.mu_growth < 1.0 {
            return fail(format!(
                "need mu_init > 0 and mu_growth >= 1, got {} and {}",
                self.mu_init, self.mu_growth
            ));
        }
        for (kind, design) in [
            (CircuitKind::Activation, &self.activation_design),
            (CircuitKind::Negation, &self.negation_design),
        ] {
            if design.len() != kind.design_len() {
                return fail(format!(
                    "{} design needs {} values, got {}",
                    kind.name(),
                    kind.design_len(),
                    design.len()
                ));
            }
        }
        Ok(())
    }

    pub fn bounds(&self) -> ConductanceBounds {
        ConductanceBounds {
            gmin: self.gmin,
            gmax: self.gmax,
            pgmin: self.pgmin,
        }
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs_f64(self.time_limit_hours * 3600.0)
    }

    /// Starting learning rate of the fine-tuning stage after pruning.
    pub fn fine_tune_lr(&self) -> f64 {
        self.lr / 10.0
    }

    /// Whether fine-tuning starts at or below `lr_min`, so it ends after
    /// its first decay.
    pub fn fine_tune_is_truncated(&self) -> bool {
        self.fine_tune_lr() <= self.lr_min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().expect("defaults validate");
    }

    #[test]
    fn test_penalty_selector_parsing() {
        assert_eq!("power".parse::<PenaltySelector>().ok(), Some(PenaltySelector::WeightedSum));
        assert_eq!("AL".parse::<PenaltySelector>().ok(), Some(PenaltySelector::AugmentedLagrangian));
        assert!(matches!(
            "lagrange".parse::<PenaltySelector>(),
            Err(PnnError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_json_config_overrides_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"penalty": "AL", "power_budget": 2e-4, "patience": 7}"#)
                .expect("parse");
        assert_eq!(config.penalty, PenaltySelector::AugmentedLagrangian);
        assert_eq!(config.power_budget, 2e-4);
        assert_eq!(config.patience, 7);
        assert_eq!(config.gmax, Config::default().gmax);
    }

    #[test]
    fn test_json_config_rejects_unknown_penalty() {
        assert!(serde_json::from_str::<Config>(r#"{"penalty": "energy"}"#).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = Config::default();
        config.device = "cuda".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.lr_decay = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.negation_design = vec![0.0; 6];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fine_tune_lr_against_floor() {
        let config = Config::default();
        assert_eq!(config.fine_tune_lr(), config.lr / 10.0);
        assert!(!config.fine_tune_is_truncated());

        let config = Config {
            lr: 0.05,
            lr_min: 0.005,
            ..Config::default()
        };
        config.validate().expect("valid");
        assert!(config.fine_tune_is_truncated());
    }
}
