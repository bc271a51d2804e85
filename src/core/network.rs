//! A stack of crossbar layers sharing one activation and one negation circuit.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::rc::Rc;

use super::circuit::NonlinearCircuit;
use super::layer::{CircuitLayer, ConductanceBounds, LayerMasks, LayerPass, PruningCounts};
use super::surrogate::{CircuitKind, SurrogatePackage};
use super::{PnnError, PnnResult};
use crate::autodiff::{Parameter, Tape, Var};
use crate::utils::{array2_to_vecs, vecs_to_array2};
use crate::Config;

/// Nodes produced by one network forward pass.
///
/// Power is always computed from a pass, so it always refers to the batch
/// that was just propagated.
#[derive(Debug, Clone)]
pub struct NetworkPass {
    /// Output activations, `(batch, n_classes)`. Used directly as logits.
    pub output: Var,
    pub layers: Vec<LayerPass>,
}

/// Power decomposition of one pass, all `(1, 1)` nodes.
#[derive(Debug, Clone, Copy)]
pub struct PowerTerms {
    /// `P_neg · N_neg`
    pub negation: Var,
    /// `P_act · N_act`
    pub activation: Var,
    /// `Σ_ℓ P_mac^ℓ`
    pub mac: Var,
    pub total: Var,
}

/// Aggregate pruning statistics over all layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PruningReport {
    pub counts: PruningCounts,
    pub weight_fraction: f64,
    pub activation_fraction: f64,
    pub negation_fraction: f64,
}

impl PruningReport {
    fn from_counts(counts: PruningCounts) -> Self {
        let fraction = |pruned: usize, total: usize| {
            if total == 0 {
                0.0
            } else {
                pruned as f64 / total as f64
            }
        };
        Self {
            counts,
            weight_fraction: fraction(counts.pruned_weights, counts.total_weights),
            activation_fraction: fraction(counts.pruned_activations, counts.total_activations),
            negation_fraction: fraction(counts.pruned_negations, counts.total_negations),
        }
    }
}

/// Serializable state of every parameter and mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub topology: Vec<usize>,
    pub parameters: BTreeMap<String, Vec<Vec<f64>>>,
    pub masks: Vec<LayerMasks>,
}

/// Printed analog neural network.
#[derive(Debug)]
pub struct Network {
    topology: Vec<usize>,
    layers: Vec<CircuitLayer>,
    activation: Rc<NonlinearCircuit>,
    negation: Rc<NonlinearCircuit>,
}

impl Network {
    /// Create a network with layer sizes `topology` (input, hidden..., output).
    ///
    /// Every layer receives a handle to the same two circuits.
    pub fn new(
        topology: &[usize],
        activation: Rc<NonlinearCircuit>,
        negation: Rc<NonlinearCircuit>,
        bounds: ConductanceBounds,
        seed: u64,
    ) -> PnnResult<Self> {
        if topology.len() < 2 {
            return Err(PnnError::InvalidConfig(format!(
                "topology needs at least input and output sizes, got {topology:?}"
            )));
        }
        if activation.kind() != CircuitKind::Activation || negation.kind() != CircuitKind::Negation {
            return Err(PnnError::InvalidConfig(
                "activation and negation circuits are swapped".to_string(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let layers = topology
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                CircuitLayer::new(
                    i,
                    w[0],
                    w[1],
                    Rc::clone(&activation),
                    Rc::clone(&negation),
                    bounds,
                    &mut rng,
                )
            })
            .collect::<PnnResult<Vec<_>>>()?;

        Ok(Self {
            topology: topology.to_vec(),
            layers,
            activation,
            negation,
        })
    }

    /// Build the circuits from the configured surrogate packages (or the
    /// built-in nominal calibration) and create the network.
    pub fn from_config(topology: &[usize], config: &Config) -> PnnResult<Self> {
        let activation = circuit_from_config(
            CircuitKind::Activation,
            config.activation_package.as_deref(),
            &config.activation_design,
        )?;
        let negation = circuit_from_config(
            CircuitKind::Negation,
            config.negation_package.as_deref(),
            &config.negation_design,
        )?;
        Self::new(
            topology,
            Rc::new(activation),
            Rc::new(negation),
            config.bounds(),
            config.seed,
        )
    }

    pub fn topology(&self) -> &[usize] {
        &self.topology
    }

    pub fn layers(&self) -> &[CircuitLayer] {
        &self.layers
    }

    pub fn activation(&self) -> &Rc<NonlinearCircuit> {
        &self.activation
    }

    pub fn negation(&self) -> &Rc<NonlinearCircuit> {
        &self.negation
    }

    pub fn n_inputs(&self) -> usize {
        self.topology[0]
    }

    pub fn n_outputs(&self) -> usize {
        self.topology[self.topology.len() - 1]
    }

    /// Propagate a `(batch, n_inputs)` input through every layer.
    pub fn forward(&self, tape: &mut Tape, input: &Array2<f64>) -> PnnResult<NetworkPass> {
        let mut x = tape.constant(input.clone());
        let mut passes = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let pass = layer.forward(tape, x)?;
            x = pass.output;
            passes.push(pass);
        }
        Ok(NetworkPass {
            output: x,
            layers: passes,
        })
    }

    /// Power terms for the batch of `pass`.
    ///
    /// Circuit powers are recomputed from the current design parameters on
    /// every call.
    pub fn power_terms(&self, tape: &mut Tape, pass: &NetworkPass) -> PnnResult<PowerTerms> {
        if pass.layers.len() != self.layers.len() {
            return Err(PnnError::ShapeMismatch(format!(
                "pass has {} layers, network has {}",
                pass.layers.len(),
                self.layers.len()
            )));
        }

        let mut n_neg = tape.scalar_constant(0.0);
        let mut n_act = tape.scalar_constant(0.0);
        let mut mac = tape.scalar_constant(0.0);
        for (layer, lp) in self.layers.iter().zip(&pass.layers) {
            let counts = layer.soft_counts(tape, lp.theta)?;
            n_neg = tape.add(n_neg, counts.negations);
            n_act = tape.add(n_act, counts.activations);
            mac = tape.add(mac, lp.mac_power);
        }

        let p_neg = self.negation.power(tape)?;
        let p_act = self.activation.power(tape)?;
        let negation = tape.mul(p_neg, n_neg);
        let activation = tape.mul(p_act, n_act);
        let circuits = tape.add(negation, activation);
        let total = tape.add(circuits, mac);
        Ok(PowerTerms {
            negation,
            activation,
            mac,
            total,
        })
    }

    /// Total power for the batch of `pass`, `(1, 1)`.
    pub fn power(&self, tape: &mut Tape, pass: &NetworkPass) -> PnnResult<Var> {
        Ok(self.power_terms(tape, pass)?.total)
    }

    /// Freeze every layer's structure. Idempotent.
    pub fn prune(&mut self) -> PruningReport {
        let counts = self
            .layers
            .iter_mut()
            .map(CircuitLayer::prune)
            .fold(PruningCounts::default(), PruningCounts::merge);
        PruningReport::from_counts(counts)
    }

    pub fn pruning_report(&self) -> PruningReport {
        let counts = self
            .layers
            .iter()
            .map(CircuitLayer::pruning_counts)
            .fold(PruningCounts::default(), PruningCounts::merge);
        PruningReport::from_counts(counts)
    }

    pub fn is_pruned(&self) -> bool {
        self.layers.iter().all(CircuitLayer::is_pruned)
    }

    /// Every parameter, conductances first.
    pub fn parameters(&self) -> Vec<Parameter> {
        self.trainable_parameters(true)
    }

    /// Parameters to optimise. Circuit designs stay frozen unless `train_circuits`.
    pub fn trainable_parameters(&self, train_circuits: bool) -> Vec<Parameter> {
        let mut params: Vec<Parameter> = self.layers.iter().map(|l| l.theta().clone()).collect();
        if train_circuits {
            params.push(self.activation.design().clone());
            params.push(self.negation.design().clone());
        }
        params
    }

    /// Clamp every layer's raw conductances onto `[−gmax, gmax]`.
    pub fn project_conductances(&self) {
        for layer in &self.layers {
            layer.project();
        }
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            topology: self.topology.clone(),
            parameters: self
                .parameters()
                .iter()
                .map(|p| (p.name().to_string(), array2_to_vecs(&p.value())))
                .collect(),
            masks: self.layers.iter().map(CircuitLayer::masks).collect(),
        }
    }

    /// Load parameter values and masks from a snapshot of a network with the same topology.
    pub fn restore(&mut self, snapshot: &NetworkSnapshot) -> PnnResult<()> {
        if snapshot.topology != self.topology {
            return Err(PnnError::Checkpoint(format!(
                "snapshot topology {:?} does not match network {:?}",
                snapshot.topology, self.topology
            )));
        }
        if snapshot.masks.len() != self.layers.len() {
            return Err(PnnError::Checkpoint(format!(
                "snapshot has {} layer masks, network has {} layers",
                snapshot.masks.len(),
                self.layers.len()
            )));
        }
        for param in self.parameters() {
            let stored = snapshot.parameters.get(param.name()).ok_or_else(|| {
                PnnError::Checkpoint(format!("snapshot is missing parameter {}", param.name()))
            })?;
            param.set(vecs_to_array2(stored)?)?;
        }
        for (layer, masks) in self.layers.iter_mut().zip(&snapshot.masks) {
            layer.restore_masks(masks)?;
        }
        Ok(())
    }

    /// Output activations for plain inputs, without recording gradients.
    pub fn predict(&self, input: &Array2<f64>) -> PnnResult<Array2<f64>> {
        let mut tape = Tape::detached();
        let pass = self.forward(&mut tape, input)?;
        Ok(tape.value(pass.output).clone())
    }
}

fn circuit_from_config(
    kind: CircuitKind,
    package: Option<&std::path::Path>,
    design: &[f64],
) -> PnnResult<NonlinearCircuit> {
    let package = match package {
        Some(path) => SurrogatePackage::load(path)?,
        None => SurrogatePackage::nominal(kind),
    };
    if package.kind != kind {
        return Err(PnnError::Surrogate(format!(
            "expected a {} package, got {}",
            kind.name(),
            package.kind.name()
        )));
    }
    NonlinearCircuit::new(Rc::new(package), design)
}
