//! Adam over shared [`Parameter`] handles.

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::autodiff::{Gradients, Parameter};
use crate::core::{PnnError, PnnResult};
use crate::utils::{array2_to_vecs, vecs_to_array2};

/// First and second moment estimates of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub m: Vec<Vec<f64>>,
    pub v: Vec<Vec<f64>>,
}

/// Everything needed to continue optimization exactly where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub lr: f64,
    pub step: u64,
    /// Keyed by parameter name.
    pub moments: BTreeMap<String, Moments>,
}

/// Adam with bias correction.
#[derive(Debug)]
pub struct Adam {
    params: Vec<Parameter>,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step: u64,
    m: Vec<Array2<f64>>,
    v: Vec<Array2<f64>>,
}

impl Adam {
    pub fn new(params: Vec<Parameter>, lr: f64) -> Self {
        let m = params.iter().map(|p| Array2::zeros(p.shape())).collect();
        let v = params.iter().map(|p| Array2::zeros(p.shape())).collect();
        Self {
            params,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step: 0,
            m,
            v,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn steps(&self) -> u64 {
        self.step
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    /// Apply one update. Parameters without a gradient keep their value and moments.
    pub fn step(&mut self, grads: &Gradients) {
        self.step += 1;
        let t = self.step as f64;
        let bias1 = 1.0 - self.beta1.powf(t);
        let bias2 = 1.0 - self.beta2.powf(t);
        let (beta1, beta2, eps, lr) = (self.beta1, self.beta2, self.eps, self.lr);

        for ((param, m), v) in self.params.iter().zip(&mut self.m).zip(&mut self.v) {
            let Some(g) = grads.get(param) else {
                continue;
            };
            // m = b1*m + (1-b1)*g, v = b2*v + (1-b2)*g^2
            Zip::from(&mut *m).and(&mut *v).and(g).for_each(|m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
            });
            param.update(|w| {
                Zip::from(w).and(&*m).and(&*v).for_each(|w, &m, &v| {
                    *w -= lr * (m / bias1) / ((v / bias2).sqrt() + eps);
                });
            });
        }
    }

    /// True when every parameter and both moment estimates are finite.
    ///
    /// A finite but huge gradient can still overflow the second moment.
    pub fn is_finite(&self) -> bool {
        let finite = |a: &Array2<f64>| a.iter().all(|v| v.is_finite());
        self.m.iter().all(finite)
            && self.v.iter().all(finite)
            && self.params.iter().all(|p| finite(&*p.value()))
    }

    pub fn state(&self) -> AdamState {
        AdamState {
            lr: self.lr,
            step: self.step,
            moments: self
                .params
                .iter()
                .zip(self.m.iter().zip(&self.v))
                .map(|(p, (m, v))| {
                    (
                        p.name().to_string(),
                        Moments {
                            m: array2_to_vecs(m),
                            v: array2_to_vecs(v),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Restore learning rate, step counter and moments saved by [`state`](Self::state).
    pub fn load_state(&mut self, state: &AdamState) -> PnnResult<()> {
        let mut m = Vec::with_capacity(self.params.len());
        let mut v = Vec::with_capacity(self.params.len());
        for param in &self.params {
            let moments = state.moments.get(param.name()).ok_or_else(|| {
                PnnError::Checkpoint(format!("optimizer state is missing {}", param.name()))
            })?;
            let (pm, pv) = (vecs_to_array2(&moments.m)?, vecs_to_array2(&moments.v)?);
            if pm.dim() != param.shape() || pv.dim() != param.shape() {
                return Err(PnnError::Checkpoint(format!(
                    "optimizer moments for {} have the wrong shape",
                    param.name()
                )));
            }
            m.push(pm);
            v.push(pv);
        }
        self.m = m;
        self.v = v;
        self.lr = state.lr;
        self.step = state.step;
        Ok(())
    }
}
