//! Frozen surrogate regressors for the printed nonlinear circuits.
//!
//! A surrogate package bundles two pre-calibrated regressors that map the
//! normalized, extended design features of a circuit to
//! - the four transfer-function coefficients `η = (offset, gain, threshold, slope)`
//! - the circuit's power draw,
//!
//! together with the min/max bounds used to normalize their inputs and
//! denormalize their outputs. Packages are read once and never modified.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{PnnError, PnnResult};
use crate::autodiff::{Tape, Var};
use crate::utils::{array2_to_vecs, row, vecs_to_array2};

/// Number of transfer-function coefficients produced by a coefficient estimator.
pub const NUM_COEFFICIENTS: usize = 4;

/// The two printed nonlinear circuit types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitKind {
    /// tanh-shaped activation: resistors R1, R2 and transistors (W1, L1), (W2, L2)
    Activation,
    /// inverter: resistors R1..R3 and transistors (W1, L1)..(W3, L3)
    Negation,
}

impl CircuitKind {
    /// Number of learnable design parameters.
    pub fn design_len(self) -> usize {
        match self {
            CircuitKind::Activation => 6,
            CircuitKind::Negation => 9,
        }
    }

    /// Ratio features `(numerator, denominator)` appended after the raw design values.
    pub fn ratio_pairs(self) -> &'static [(usize, usize)] {
        match self {
            CircuitKind::Activation => &[(1, 0), (3, 2), (5, 4)],
            CircuitKind::Negation => &[(3, 4), (5, 6), (7, 8)],
        }
    }

    /// Width of the extended feature vector fed to the regressors.
    pub fn feature_len(self) -> usize {
        self.design_len() + self.ratio_pairs().len()
    }

    pub fn name(self) -> &'static str {
        match self {
            CircuitKind::Activation => "activation",
            CircuitKind::Negation => "negation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegressorActivation {
    Identity,
    Relu,
    Tanh,
    Sigmoid,
}

/// Serialized dense layer: `y = act(x · weight + bias)`, weight is (inputs, outputs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayerData {
    pub weight: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    pub activation: RegressorActivation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressorData {
    pub layers: Vec<DenseLayerData>,
}

#[derive(Debug, Clone)]
struct Dense {
    weight: Array2<f64>,
    bias: Array2<f64>,
    activation: RegressorActivation,
}

/// A frozen feed-forward regressor evaluated on the tape.
///
/// Its weights enter the tape as constants, so gradients reach its inputs
/// (the circuit design parameters) but never its own weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RegressorData", into = "RegressorData")]
pub struct Regressor {
    layers: Vec<Dense>,
}

impl TryFrom<RegressorData> for Regressor {
    type Error = PnnError;

    fn try_from(data: RegressorData) -> PnnResult<Self> {
        if data.layers.is_empty() {
            return Err(PnnError::Surrogate("regressor has no layers".to_string()));
        }
        let mut layers = Vec::with_capacity(data.layers.len());
        let mut width: Option<usize> = None;
        for (i, layer) in data.layers.into_iter().enumerate() {
            let weight = vecs_to_array2(&layer.weight)?;
            let (rows, cols) = weight.dim();
            if layer.bias.len() != cols {
                return Err(PnnError::Surrogate(format!(
                    "layer {i}: bias has {} entries for {cols} outputs",
                    layer.bias.len()
                )));
            }
            if let Some(w) = width {
                if w != rows {
                    return Err(PnnError::Surrogate(format!(
                        "layer {i}: expects {rows} inputs, previous layer yields {w}"
                    )));
                }
            }
            width = Some(cols);
            layers.push(Dense {
                weight,
                bias: row(&layer.bias),
                activation: layer.activation,
            });
        }
        Ok(Self { layers })
    }
}

impl From<Regressor> for RegressorData {
    fn from(r: Regressor) -> Self {
        RegressorData {
            layers: r
                .layers
                .iter()
                .map(|l| DenseLayerData {
                    weight: array2_to_vecs(&l.weight),
                    bias: l.bias.iter().copied().collect(),
                    activation: l.activation,
                })
                .collect(),
        }
    }
}

impl Regressor {
    pub fn input_len(&self) -> usize {
        self.layers.first().map_or(0, |l| l.weight.nrows())
    }

    pub fn output_len(&self) -> usize {
        self.layers.last().map_or(0, |l| l.weight.ncols())
    }

    /// Evaluate on a `(1, input_len)` node.
    pub fn forward(&self, tape: &mut Tape, x: Var) -> Var {
        let mut h = x;
        for layer in &self.layers {
            let w = tape.constant(layer.weight.clone());
            let b = tape.constant(layer.bias.clone());
            let z = tape.matmul(h, w);
            let z = tape.add(z, b);
            h = match layer.activation {
                RegressorActivation::Identity => z,
                RegressorActivation::Relu => tape.relu(z),
                RegressorActivation::Tanh => tape.tanh(z),
                RegressorActivation::Sigmoid => tape.sigmoid(z),
            };
        }
        h
    }
}

/// Calibration bundle for one nonlinear circuit type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurrogatePackage {
    pub kind: CircuitKind,
    pub coefficient_estimator: Regressor,
    pub power_estimator: Regressor,
    /// Per-feature lower bounds of the extended feature vector.
    pub x_min: Vec<f64>,
    pub x_max: Vec<f64>,
    /// Coefficient denormalization bounds.
    pub y_min: Vec<f64>,
    pub y_max: Vec<f64>,
    /// Power denormalization bounds.
    pub power_y_min: Vec<f64>,
    pub power_y_max: Vec<f64>,
}

impl SurrogatePackage {
    /// Load and validate a package from a JSON file.
    pub fn load(path: &Path) -> PnnResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| PnnError::io(path, e))?;
        let package: SurrogatePackage = serde_json::from_str(&json).map_err(|e| {
            PnnError::Surrogate(format!("failed to parse {}: {e}", path.display()))
        })?;
        package.validate()?;
        Ok(package)
    }

    pub fn save(&self, path: &Path) -> PnnResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| PnnError::io(path, e))
    }

    /// Check that bounds and regressor widths agree with the circuit kind.
    pub fn validate(&self) -> PnnResult<()> {
        let features = self.kind.feature_len();
        let check_len = |name: &str, len: usize, expected: usize| {
            if len == expected {
                Ok(())
            } else {
                Err(PnnError::Surrogate(format!(
                    "{} {name}: {len} entries, expected {expected}",
                    self.kind.name()
                )))
            }
        };
        check_len("x_min", self.x_min.len(), features)?;
        check_len("x_max", self.x_max.len(), features)?;
        check_len(
            "coefficient estimator input",
            self.coefficient_estimator.input_len(),
            features,
        )?;
        check_len(
            "coefficient estimator output",
            self.coefficient_estimator.output_len(),
            NUM_COEFFICIENTS,
        )?;
        check_len("y_min", self.y_min.len(), NUM_COEFFICIENTS)?;
        check_len("y_max", self.y_max.len(), NUM_COEFFICIENTS)?;
        check_len(
            "power estimator input",
            self.power_estimator.input_len(),
            features,
        )?;
        let power_out = self.power_estimator.output_len();
        check_len("power_y_min", self.power_y_min.len(), power_out)?;
        check_len("power_y_max", self.power_y_max.len(), power_out)?;
        if let Some(i) = (0..features).find(|&i| self.x_max[i] <= self.x_min[i]) {
            return Err(PnnError::Surrogate(format!(
                "{} feature {i} has an empty calibration range",
                self.kind.name()
            )));
        }
        Ok(())
    }

    /// Built-in calibration used when no package file is configured.
    ///
    /// The transfer function is close to `tanh(z)` (offset 0, gain 1,
    /// threshold 0, slope 1) and each circuit draws tens of microwatts.
    pub fn nominal(kind: CircuitKind) -> Self {
        let features = kind.feature_len();
        // R in ohms, W and L in micrometres, then the ratio features.
        let (x_min, x_max) = match kind {
            CircuitKind::Activation => (
                vec![1e4, 1e4, 200.0, 10.0, 200.0, 10.0, 0.01, 2.5, 2.5],
                vec![1e6, 1e6, 800.0, 80.0, 800.0, 80.0, 100.0, 80.0, 80.0],
            ),
            CircuitKind::Negation => (
                vec![1e4, 1e4, 1e4, 200.0, 10.0, 200.0, 10.0, 200.0, 10.0, 2.5, 2.5, 2.5],
                vec![1e6, 1e6, 1e6, 800.0, 80.0, 800.0, 80.0, 800.0, 80.0, 80.0, 80.0, 80.0],
            ),
        };
        let coefficient_estimator = Regressor {
            layers: vec![Dense {
                weight: Array2::from_shape_fn((features, NUM_COEFFICIENTS), |(i, j)| {
                    0.05 * (((i + 2 * j) % 5) as f64 - 2.0)
                }),
                bias: Array2::zeros((1, NUM_COEFFICIENTS)),
                activation: RegressorActivation::Sigmoid,
            }],
        };
        let power_estimator = Regressor {
            layers: vec![Dense {
                weight: Array2::from_shape_fn((features, 1), |(i, _)| 0.5 * ((i % 3) as f64 - 1.0)),
                bias: Array2::zeros((1, 1)),
                activation: RegressorActivation::Sigmoid,
            }],
        };

        Self {
            kind,
            coefficient_estimator,
            power_estimator,
            x_min,
            x_max,
            y_min: vec![-0.1, 0.8, -0.1, 0.8],
            y_max: vec![0.1, 1.2, 0.1, 1.2],
            power_y_min: vec![1e-6],
            power_y_max: vec![1e-4],
        }
    }
}
