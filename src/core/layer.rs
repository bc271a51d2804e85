//! Printed crossbar layer.
//!
//! A layer is a resistor crossbar followed by one activation circuit per
//! output. Conductances are physical and non-negative; the sign of a logical
//! weight is realized by feeding the *negated* input (through the shared
//! negation circuit) into that crosspoint instead of the raw input.
//!
//! ## Crossbar
//!
//! ```text
//! x̃ = [x, 1, 0]                       bias and zero-reference rows
//! x̄ = neg(x̃), last column forced to 0
//! W = |θ| / Σ_column |θ|
//! z = x̃ · (W ⊙ [θ ≥ 0]) + x̄ · (W ⊙ [θ < 0])
//! a = act(z) ⊙ m_act
//! ```

use ndarray::{s, Array2, Axis};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::rc::Rc;

use super::circuit::NonlinearCircuit;
use super::{PnnError, PnnResult};
use crate::autodiff::{Parameter, Tape, Var};
use crate::utils::{array2_to_vecs, vecs_to_array2};

/// Conductance limits of the printing process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConductanceBounds {
    /// Conductances below this magnitude are not printed.
    pub gmin: f64,
    /// Largest printable conductance magnitude.
    pub gmax: f64,
    /// Physical conductance assigned to the smallest crosspoint of a column
    /// when estimating crossbar power.
    pub pgmin: f64,
}

impl Default for ConductanceBounds {
    fn default() -> Self {
        Self {
            gmin: 0.01,
            gmax: 10.0,
            pgmin: 1e-7,
        }
    }
}

/// Nodes produced by one layer's forward pass.
#[derive(Debug, Clone, Copy)]
pub struct LayerPass {
    /// Layer activations, `(batch, n_out)`.
    pub output: Var,
    /// Effective conductances used by this pass, `(n_in + 2, n_out)`.
    pub theta: Var,
    /// Crossbar power for this batch, `(1, 1)`.
    pub mac_power: Var,
}

/// Differentiable circuit-element counts, `(1, 1)` each.
#[derive(Debug, Clone, Copy)]
pub struct SoftCounts {
    pub weights: Var,
    pub activations: Var,
    pub negations: Var,
}

/// Pruned and total element counts of one or more layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PruningCounts {
    pub pruned_weights: usize,
    pub total_weights: usize,
    pub pruned_activations: usize,
    pub total_activations: usize,
    pub pruned_negations: usize,
    pub total_negations: usize,
}

impl PruningCounts {
    pub fn merge(self, other: PruningCounts) -> PruningCounts {
        PruningCounts {
            pruned_weights: self.pruned_weights + other.pruned_weights,
            total_weights: self.total_weights + other.total_weights,
            pruned_activations: self.pruned_activations + other.pruned_activations,
            total_activations: self.total_activations + other.total_activations,
            pruned_negations: self.pruned_negations + other.pruned_negations,
            total_negations: self.total_negations + other.total_negations,
        }
    }
}

/// Serializable pruning state of a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerMasks {
    pub theta: Vec<Vec<f64>>,
    pub activation: Vec<f64>,
    pub negation: Vec<f64>,
    pub pruned: bool,
}

/// One printed crossbar stage with its activation circuits.
#[derive(Debug)]
pub struct CircuitLayer {
    n_in: usize,
    n_out: usize,
    /// Raw conductances, `(n_in + 2, n_out)`. Row `n_in` is the bias, row `n_in + 1` the zero reference.
    theta: Parameter,
    activation: Rc<NonlinearCircuit>,
    negation: Rc<NonlinearCircuit>,
    bounds: ConductanceBounds,
    /// 1 keeps a crosspoint, 0 removes it.
    theta_mask: Array2<f64>,
    /// `(1, n_out)`: 0 removes the activation circuit of an output.
    act_mask: Array2<f64>,
    /// `(n_in + 2, 1)`: 0 means the input row no longer uses a negation circuit.
    inv_mask: Array2<f64>,
    pruned: bool,
}

impl CircuitLayer {
    /// Create a layer with freshly initialized conductances.
    ///
    /// # Initialization
    ///
    /// - Input rows: `U(0, 1) / 100 + gmin`
    /// - Zero-reference row: additionally `+ gmax`
    /// - Bias row: `η₂ / (1 − η₂) · (Σ input rows + zero row)`, which centres
    ///   the crossbar output on the activation threshold `η₂`
    pub fn new<R: Rng + ?Sized>(
        index: usize,
        n_in: usize,
        n_out: usize,
        activation: Rc<NonlinearCircuit>,
        negation: Rc<NonlinearCircuit>,
        bounds: ConductanceBounds,
        rng: &mut R,
    ) -> PnnResult<Self> {
        if n_in == 0 || n_out == 0 {
            return Err(PnnError::InvalidConfig(format!(
                "layer {index} must have non-zero width, got {n_in} -> {n_out}"
            )));
        }
        let mut theta =
            Array2::random_using((n_in + 2, n_out), Uniform::new(0.0, 1.0), rng) / 100.0 + bounds.gmin;
        theta
            .row_mut(n_in + 1)
            .mapv_inplace(|v| v + bounds.gmax);

        let eta_threshold = activation.coefficient_values()?[2];
        let ratio = eta_threshold / (1.0 - eta_threshold);
        for j in 0..n_out {
            let inputs = theta.slice(s![..n_in, j]).sum();
            theta[[n_in, j]] = ratio * (inputs + theta[[n_in + 1, j]]);
        }

        Self::from_theta(index, theta, activation, negation, bounds)
    }

    /// Create a layer from explicit raw conductances of shape `(n_in + 2, n_out)`.
    pub fn from_theta(
        index: usize,
        theta: Array2<f64>,
        activation: Rc<NonlinearCircuit>,
        negation: Rc<NonlinearCircuit>,
        bounds: ConductanceBounds,
    ) -> PnnResult<Self> {
        let (rows, n_out) = theta.dim();
        if rows < 3 || n_out == 0 {
            return Err(PnnError::ShapeMismatch(format!(
                "layer {index} conductances need at least 3 rows and 1 column, got {:?}",
                theta.dim()
            )));
        }
        let n_in = rows - 2;
        Ok(Self {
            n_in,
            n_out,
            theta: Parameter::new(format!("layer{index}.theta"), theta),
            activation,
            negation,
            bounds,
            theta_mask: Array2::ones((n_in + 2, n_out)),
            act_mask: Array2::ones((1, n_out)),
            inv_mask: Array2::ones((n_in + 2, 1)),
            pruned: false,
        })
    }

    pub fn n_in(&self) -> usize {
        self.n_in
    }

    pub fn n_out(&self) -> usize {
        self.n_out
    }

    pub fn theta(&self) -> &Parameter {
        &self.theta
    }

    pub fn activation(&self) -> &Rc<NonlinearCircuit> {
        &self.activation
    }

    pub fn negation(&self) -> &Rc<NonlinearCircuit> {
        &self.negation
    }

    pub fn bounds(&self) -> ConductanceBounds {
        self.bounds
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned
    }

    pub fn activation_mask(&self) -> &Array2<f64> {
        &self.act_mask
    }

    pub fn negation_mask(&self) -> &Array2<f64> {
        &self.inv_mask
    }

    /// Raw conductances clamped to `[−gmax, gmax]` with `|θ| < gmin` set to zero.
    pub fn hard_theta(&self) -> Array2<f64> {
        let ConductanceBounds { gmin, gmax, .. } = self.bounds;
        self.theta.value().mapv(|v| {
            let c = v.clamp(-gmax, gmax);
            if c.abs() < gmin {
                0.0
            } else {
                c
            }
        })
    }

    /// Effective conductances on the tape.
    ///
    /// The forward value is the masked [`hard_theta`](Self::hard_theta); the
    /// gradient flows to the raw parameter as if no clamping or snapping had
    /// happened. Rows whose negation circuit was pruned are forced non-negative.
    pub fn effective_theta(&self, tape: &mut Tape) -> PnnResult<Var> {
        let raw = tape.param(&self.theta);
        let snapped = tape.straight_through(self.hard_theta(), raw)?;
        let mask = tape.constant(self.theta_mask.clone());
        let masked = tape.mul(snapped, mask);

        let rectified = tape.relu(masked);
        let forced = tape.constant(self.inv_mask.mapv(|m| 1.0 - m));
        let kept = tape.constant(self.inv_mask.clone());
        let rectified = tape.mul(rectified, forced);
        let signed = tape.mul(masked, kept);
        Ok(tape.add(rectified, signed))
    }

    /// Forward pass for a `(batch, n_in)` input.
    pub fn forward(&self, tape: &mut Tape, input: Var) -> PnnResult<LayerPass> {
        let (batch, width) = tape.shape(input);
        if width != self.n_in {
            return Err(PnnError::ShapeMismatch(format!(
                "layer expects {} inputs, got {width}",
                self.n_in
            )));
        }

        let theta = self.effective_theta(tape)?;
        let positive = tape.value(theta).mapv(|v| if v >= 0.0 { 1.0 } else { 0.0 });
        let negative = positive.mapv(|p| 1.0 - p);

        let ones = tape.constant(Array2::ones((batch, 1)));
        let zeros = tape.constant(Array2::zeros((batch, 1)));
        let extended = tape.concat_cols(&[input, ones, zeros])?;
        let inverted = self.negation.forward(tape, extended)?;
        let mut reference = Array2::ones((1, self.n_in + 2));
        reference[[0, self.n_in + 1]] = 0.0;
        let reference = tape.constant(reference);
        let inverted = tape.mul(inverted, reference);

        let magnitude = tape.abs(theta);
        let column_sum = tape.sum_cols(magnitude);
        let denom = tape.add_scalar(column_sum, 1e-10);
        let w = tape.div(magnitude, denom);
        let pos = tape.constant(positive.clone());
        let neg = tape.constant(negative);
        let w_pos = tape.mul(w, pos);
        let w_neg = tape.mul(w, neg);
        let z_pos = tape.matmul(extended, w_pos);
        let z_neg = tape.matmul(inverted, w_neg);
        let z = tape.add(z_pos, z_neg);

        let mac_power = self.mac_power(tape, extended, inverted, z, &positive);

        let a = self.activation.forward(tape, z)?;
        let act_mask = tape.constant(self.act_mask.clone());
        let output = tape.mul(a, act_mask);

        Ok(LayerPass {
            output,
            theta,
            mac_power,
        })
    }

    /// Crossbar power of one batch.
    ///
    /// # Algorithm
    ///
    /// ```text
    /// g̃[m, n] = pgmin · |θ_raw[m, n]| / min_m |θ_raw[m, n]|
    /// P = (1/E) Σ_{m,n} g̃[m, n] Σ_e (x̂[e, m, n] − z[e, n])²
    /// ```
    ///
    /// with `x̂ = x̃` for non-negative crosspoints and `x̂ = x̄` otherwise.
    /// The inner sum is expanded as `Σx̂² − 2 Σx̂z + Σz²` so it reduces to
    /// matrix products.
    fn mac_power(
        &self,
        tape: &mut Tape,
        extended: Var,
        inverted: Var,
        z: Var,
        positive: &Array2<f64>,
    ) -> Var {
        let batch = tape.shape(extended).0.max(1) as f64;

        let raw = tape.param(&self.theta);
        let g = tape.abs(raw);
        let g_min = tape.min_cols(g);
        // exact zeros in a raw column would otherwise divide by zero
        let g_min = tape.add_scalar(g_min, 1e-12);
        let ratio = tape.div(g, g_min);
        let g_tilde = tape.scale(ratio, self.bounds.pgmin);

        let sx2 = column_energy(tape, extended);
        let sn2 = column_energy(tape, inverted);
        let z2 = tape.square(z);
        let sz2 = tape.sum_cols(z2);

        let xt = tape.transpose(extended);
        let cross_pos = tape.matmul(xt, z);
        let cross_pos = tape.scale(cross_pos, 2.0);
        let nt = tape.transpose(inverted);
        let cross_neg = tape.matmul(nt, z);
        let cross_neg = tape.scale(cross_neg, 2.0);

        let pos_term = tape.sub(sx2, cross_pos);
        let neg_term = tape.sub(sn2, cross_neg);
        let pos_mask = tape.constant(positive.clone());
        let neg_mask = tape.constant(positive.mapv(|p| 1.0 - p));
        let pos_term = tape.mul(pos_term, pos_mask);
        let neg_term = tape.mul(neg_term, neg_mask);
        let spread = tape.add(pos_term, neg_term);
        let spread = tape.add(spread, sz2);

        let weighted = tape.mul(g_tilde, spread);
        let total = tape.sum(weighted);
        tape.scale(total, 1.0 / batch)
    }

    /// Soft element counts for the effective conductances `theta` of a pass.
    ///
    /// Forward values are the exact counts of live crosspoints, live
    /// activation circuits and input rows that need a negation circuit.
    /// Before pruning the backward pass differentiates
    /// - weights: `Σ sigmoid(|θ|)` over live crosspoints
    /// - activations: `Σ_n max_m sigmoid(|θ[m, n]|)` over live input crosspoints
    /// - negations: `Σ_m max_n (1 − sigmoid(θ[m, n]))` over negative input crosspoints
    ///
    /// After pruning the counts are constants.
    pub fn soft_counts(&self, tape: &mut Tape, theta: Var) -> PnnResult<SoftCounts> {
        let n_in = self.n_in;
        let value = tape.value(theta).clone();
        let nonzero = value.mapv(|v| if v != 0.0 { 1.0 } else { 0.0 });
        let nonzero_in = nonzero.slice(s![..n_in, ..]).to_owned();
        let negative_in = value
            .slice(s![..n_in, ..])
            .mapv(|v| if v < 0.0 { 1.0 } else { 0.0 });

        let weights_hard = nonzero.sum();
        let activations_hard = nonzero_in.fold_axis(Axis(0), 0.0, |&m: &f64, &v: &f64| m.max(v)).sum();
        let negations_hard = negative_in.fold_axis(Axis(1), 0.0, |&m: &f64, &v: &f64| m.max(v)).sum();

        if self.pruned {
            return Ok(SoftCounts {
                weights: tape.scalar_constant(weights_hard),
                activations: tape.scalar_constant(activations_hard),
                negations: tape.scalar_constant(negations_hard),
            });
        }

        let magnitude = tape.abs(theta);
        let squashed = tape.sigmoid(magnitude);
        let live = tape.constant(nonzero);
        let live_weights = tape.mul(squashed, live);
        let weights_soft = tape.sum(live_weights);
        let weights = tape.straight_through(scalar(weights_hard), weights_soft)?;

        let squashed_in = tape.slice_rows(squashed, 0, n_in);
        let live_in = tape.constant(nonzero_in);
        let live_in = tape.mul(squashed_in, live_in);
        let per_output = tape.max_cols(live_in);
        let activations_soft = tape.sum(per_output);
        let activations = tape.straight_through(scalar(activations_hard), activations_soft)?;

        let theta_in = tape.slice_rows(theta, 0, n_in);
        let sig = tape.sigmoid(theta_in);
        let flipped = tape.neg(sig);
        let flipped = tape.add_scalar(flipped, 1.0);
        let negative = tape.constant(negative_in);
        let negative = tape.mul(flipped, negative);
        let per_input = tape.max_rows(negative);
        let negations_soft = tape.sum(per_input);
        let negations = tape.straight_through(scalar(negations_hard), negations_soft)?;

        Ok(SoftCounts {
            weights,
            activations,
            negations,
        })
    }

    /// Freeze the current zero and sign pattern into the masks.
    ///
    /// One-way: the first call removes
    /// - crosspoints whose conductance is zero,
    /// - activation circuits whose inputs are all removed (and their column),
    /// - negation usage of input rows without negative conductances.
    ///
    /// Later calls change nothing and return the same counts.
    pub fn prune(&mut self) -> PruningCounts {
        if self.pruned {
            return self.pruning_counts();
        }
        let n_in = self.n_in;
        let hard = self.hard_theta();

        self.theta_mask.zip_mut_with(&hard, |m, &t| {
            if t == 0.0 {
                *m = 0.0;
            }
        });
        let live_inputs = self.theta_mask.slice(s![..n_in, ..]).sum_axis(Axis(0));
        for (j, &count) in live_inputs.iter().enumerate() {
            if count == 0.0 {
                self.act_mask[[0, j]] = 0.0;
            }
        }
        let act_mask = self.act_mask.clone();
        self.theta_mask *= &act_mask;

        let negatives = hard
            .mapv(|t| if t < 0.0 { 1.0 } else { 0.0 })
            .sum_axis(Axis(1));
        for i in 0..n_in {
            if negatives[i] == 0.0 {
                self.inv_mask[[i, 0]] = 0.0;
            }
        }

        self.pruned = true;
        self.pruning_counts()
    }

    pub fn pruning_counts(&self) -> PruningCounts {
        let zeros = |m: &Array2<f64>| m.iter().filter(|&&v| v == 0.0).count();
        PruningCounts {
            pruned_weights: zeros(&self.theta_mask),
            total_weights: self.theta_mask.len(),
            pruned_activations: zeros(&self.act_mask),
            total_activations: self.act_mask.len(),
            pruned_negations: zeros(&self.inv_mask),
            total_negations: self.inv_mask.len(),
        }
    }

    /// Project the raw conductances onto `[−gmax, gmax]`.
    pub fn project(&self) {
        let gmax = self.bounds.gmax;
        self.theta
            .update(|t| t.mapv_inplace(|v| v.clamp(-gmax, gmax)));
    }

    pub fn masks(&self) -> LayerMasks {
        LayerMasks {
            theta: array2_to_vecs(&self.theta_mask),
            activation: self.act_mask.iter().copied().collect(),
            negation: self.inv_mask.iter().copied().collect(),
            pruned: self.pruned,
        }
    }

    pub fn restore_masks(&mut self, masks: &LayerMasks) -> PnnResult<()> {
        let theta_mask = vecs_to_array2(&masks.theta)?;
        if theta_mask.dim() != (self.n_in + 2, self.n_out)
            || masks.activation.len() != self.n_out
            || masks.negation.len() != self.n_in + 2
        {
            return Err(PnnError::ShapeMismatch(format!(
                "masks do not fit a {} -> {} layer",
                self.n_in, self.n_out
            )));
        }
        self.theta_mask = theta_mask;
        self.act_mask = Array2::from_shape_fn((1, self.n_out), |(_, j)| masks.activation[j]);
        self.inv_mask = Array2::from_shape_fn((self.n_in + 2, 1), |(i, _)| masks.negation[i]);
        self.pruned = masks.pruned;
        Ok(())
    }
}

/// `Σ_e x[e, m]²` as an `(M, 1)` node.
fn column_energy(tape: &mut Tape, x: Var) -> Var {
    let sq = tape.square(x);
    let sums = tape.sum_cols(sq);
    tape.transpose(sums)
}

fn scalar(v: f64) -> Array2<f64> {
    Array2::from_elem((1, 1), v)
}
