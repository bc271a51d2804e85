//! Accuracy and power of a network on a batch.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::autodiff::Tape;
use crate::core::{Network, PnnResult};
use crate::utils::argmax_rows;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Fraction of rows whose largest output matches the label.
    pub accuracy: f64,
    /// Total circuit power for the batch, watts.
    pub power: f64,
}

/// Stateless batch evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Evaluator;

impl Evaluator {
    /// Evaluate on a detached tape. Parameters receive no gradients.
    pub fn evaluate(&self, network: &Network, inputs: &Array2<f64>, labels: &[usize]) -> PnnResult<Evaluation> {
        let mut tape = Tape::detached();
        let pass = network.forward(&mut tape, inputs)?;
        let power = network.power(&mut tape, &pass)?;
        Ok(self.summarize(tape.value(pass.output), labels, tape.scalar(power)))
    }

    /// Evaluation from an already computed output and power.
    pub fn summarize(&self, output: &Array2<f64>, labels: &[usize], power: f64) -> Evaluation {
        Evaluation {
            accuracy: accuracy(output, labels),
            power,
        }
    }
}

/// Fraction of rows of `output` whose argmax equals the label. Empty input gives 0.
pub fn accuracy(output: &Array2<f64>, labels: &[usize]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = argmax_rows(output)
        .iter()
        .zip(labels)
        .filter(|(p, y)| p == y)
        .count();
    correct as f64 / labels.len() as f64
}
