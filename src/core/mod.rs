//! Core printed-circuit model.
//!
//! This module provides the differentiable simulation of a printed analog
//! neural network:
//! - Frozen surrogate regressors for the nonlinear circuits ([`surrogate`])
//! - Learnable activation and negation circuits ([`circuit`])
//! - Crossbar layers with sign routing, power and pruning ([`layer`])
//! - The composed network and its power model ([`network`])
//!
//! ## Power Model
//!
//! ```text
//! P = P_neg · N_neg + P_act · N_act + Σ_ℓ P_mac^ℓ
//! ```
//!
//! where `N_neg` and `N_act` are soft counts of the negation and activation
//! circuits still in use, and `P_mac^ℓ` is the crossbar power of layer ℓ for
//! the current batch.

pub mod circuit;
pub mod layer;
pub mod network;
pub mod surrogate;

use std::path::PathBuf;

pub use circuit::NonlinearCircuit;
pub use layer::{CircuitLayer, ConductanceBounds, LayerMasks, LayerPass, PruningCounts, SoftCounts};
pub use network::{Network, NetworkPass, NetworkSnapshot, PowerTerms, PruningReport};
pub use surrogate::{CircuitKind, Regressor, RegressorActivation, SurrogatePackage};

/// Error type for printed-network operations.
#[derive(Debug, thiserror::Error)]
pub enum PnnError {
    /// Shape mismatch in matrix operations
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Invalid configuration, rejected at startup
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    /// Malformed or inconsistent surrogate package
    #[error("Surrogate package: {0}")]
    Surrogate(String),
    /// Misuse of the differentiation tape
    #[error("Autodiff: {0}")]
    Autodiff(String),
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Malformed dataset contents
    #[error("Data: {0}")]
    Data(String),
    #[error("CSV: {0}")]
    Csv(#[from] csv::Error),
    /// Checkpoint present but unusable for this run
    #[error("Checkpoint: {0}")]
    Checkpoint(String),
    /// Non-finite loss or gradient
    #[error("Training diverged at epoch {epoch}: {reason}")]
    Divergence { epoch: usize, reason: String },
}

impl PnnError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PnnError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type PnnResult<T> = Result<T, PnnError>;
