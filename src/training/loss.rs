//! Task loss with a power penalty.
//!
//! ```text
//! weighted sum:          L = (1 − β)·CE + β·P
//! augmented Lagrangian:  L = CE + λ·C + μ/2·max(0, C)²,   C = P − budget
//! ```
//!
//! `λ` and `μ` are plain numbers. They never receive gradients; only the
//! outer loop in [`super::engine`] changes them.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::autodiff::{Tape, Var};
use crate::core::{Network, NetworkPass, PnnResult};
use crate::{Config, PenaltySelector};

/// Multiplier `λ` and penalty weight `μ` of the augmented Lagrangian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LagrangianState {
    pub lambda: f64,
    pub mu: f64,
}

impl LagrangianState {
    pub fn new(mu: f64) -> Self {
        Self { lambda: 0.0, mu }
    }

    /// `λ ← max(0, λ + μ·C)`, then `μ ← μ·growth`.
    pub fn update(&mut self, constraint: f64, growth: f64) {
        self.lambda = (self.lambda + self.mu * constraint).max(0.0);
        self.mu *= growth;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Penalty {
    WeightedSum { balance: f64 },
    AugmentedLagrangian(LagrangianState),
}

/// Loss nodes of one batch.
#[derive(Debug, Clone)]
pub struct LossTerms {
    pub total: Var,
    /// Mean cross-entropy.
    pub task: Var,
    pub power: Var,
    pub pass: NetworkPass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LossFunction {
    penalty: Penalty,
    budget: f64,
}

impl LossFunction {
    pub fn weighted_sum(balance: f64, budget: f64) -> Self {
        Self {
            penalty: Penalty::WeightedSum { balance },
            budget,
        }
    }

    pub fn augmented_lagrangian(state: LagrangianState, budget: f64) -> Self {
        Self {
            penalty: Penalty::AugmentedLagrangian(state),
            budget,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        match config.penalty {
            PenaltySelector::WeightedSum => Self::weighted_sum(config.power_balance, config.power_budget),
            PenaltySelector::AugmentedLagrangian => {
                Self::augmented_lagrangian(LagrangianState::new(config.mu_init), config.power_budget)
            }
        }
    }

    pub fn penalty(&self) -> Penalty {
        self.penalty
    }

    pub fn budget(&self) -> f64 {
        self.budget
    }

    /// Current `(λ, μ)`, or `None` under the weighted-sum penalty.
    pub fn lagrangian(&self) -> Option<LagrangianState> {
        match self.penalty {
            Penalty::AugmentedLagrangian(state) => Some(state),
            Penalty::WeightedSum { .. } => None,
        }
    }

    /// Replace `(λ, μ)`. Ignored under the weighted-sum penalty.
    pub fn set_lagrangian(&mut self, state: LagrangianState) {
        if let Penalty::AugmentedLagrangian(current) = &mut self.penalty {
            *current = state;
        }
    }

    /// Forward `inputs` through `network` and build the penalized loss.
    pub fn evaluate(
        &self,
        tape: &mut Tape,
        network: &Network,
        inputs: &Array2<f64>,
        labels: &[usize],
    ) -> PnnResult<LossTerms> {
        let pass = network.forward(tape, inputs)?;
        let task = tape.cross_entropy(pass.output, labels)?;
        let power = network.power(tape, &pass)?;

        let total = match self.penalty {
            Penalty::WeightedSum { balance } => {
                let task_part = tape.scale(task, 1.0 - balance);
                let power_part = tape.scale(power, balance);
                tape.add(task_part, power_part)
            }
            Penalty::AugmentedLagrangian(LagrangianState { lambda, mu }) => {
                let c = self.constraint_of(tape, power);
                let linear = tape.scale(c, lambda);
                let violation = tape.relu(c);
                let violation = tape.square(violation);
                let quadratic = tape.scale(violation, mu / 2.0);
                let penalized = tape.add(task, linear);
                tape.add(penalized, quadratic)
            }
        };

        Ok(LossTerms {
            total,
            task,
            power,
            pass,
        })
    }

    /// `C = P − budget` for the batch of `pass`. Negative means within budget.
    pub fn constraint(&self, tape: &mut Tape, network: &Network, pass: &NetworkPass) -> PnnResult<Var> {
        let power = network.power(tape, pass)?;
        Ok(self.constraint_of(tape, power))
    }

    fn constraint_of(&self, tape: &mut Tape, power: Var) -> Var {
        tape.add_scalar(power, -self.budget)
    }
}
