//! Training state machine.
//!
//! One control loop drives five phases:
//!
//! ```text
//!            patience exceeded              lr > floor
//! Running ───────────────────▶ LrDecay ─────────────────▶ Running
//!    │                            │ lr ≤ floor
//!    │                            ├── weighted sum ──▶ Done
//!    │                            └── AL ──▶ AlUpdate ── C ≤ 0 ──▶ Done
//!    │                                          └── C > 0 ──▶ Running
//!    └── wall clock exhausted (checked after every transition) ──▶ TimedOut
//! ```
//!
//! - **Running**: one training epoch (a gradient step per batch) and one
//!   validation pass. An improved validation loss is checkpointed.
//! - **LrDecay**: reload the best checkpoint and shrink the learning rate.
//! - **AlUpdate**: measure `C` over the training data and, while it is
//!   positive, raise `λ` and `μ` and restart annealing at
//!   `lr = 5·lr₀ / (updates + 5)`.
//! - **Done**: the checkpoint is removed; the network holds the best parameters.
//! - **TimedOut**: the best checkpoint is reloaded and kept for a later resume.
//!
//! A run whose checkpoint exists continues from it: epoch index, parameters,
//! masks, optimizer moments, best loss and `(λ, μ)` are all restored.

use std::time::{Duration, Instant};

use super::evaluator::{Evaluation, Evaluator};
use super::loss::{LagrangianState, LossFunction, Penalty};
use super::optim::Adam;
use super::{EpochMetrics, MetricsRecorder};
use crate::autodiff::Tape;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::core::{Network, PnnError, PnnResult};
use crate::data::DataSource;
use crate::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    LrDecay,
    AlUpdate,
    Done,
    TimedOut,
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Epochs run in total, including those before a resume.
    pub epochs: usize,
    pub best_valid_loss: Option<f64>,
    pub lr: f64,
    pub lagrangian: Option<LagrangianState>,
    pub al_updates: usize,
    /// `(λ, μ)` at the start of this invocation and after each update.
    pub al_history: Vec<LagrangianState>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Annealing (and the multiplier loop) finished.
    Converged(TrainingSummary),
    /// The wall-clock budget ran out; the checkpoint is kept.
    BudgetExhausted(TrainingSummary),
}

impl Outcome {
    pub fn summary(&self) -> &TrainingSummary {
        match self {
            Outcome::Converged(s) | Outcome::BudgetExhausted(s) => s,
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, Outcome::Converged(_))
    }
}

/// Loop position that survives a checkpoint round trip.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    epoch: usize,
    best_loss: f64,
    patience: usize,
    al_updates: usize,
    initial_lr: f64,
}

/// Mutable state of one `run` call.
struct Session<'a> {
    network: &'a mut Network,
    loss: &'a mut LossFunction,
    optimizer: &'a mut Adam,
    cursor: Cursor,
    history: Vec<LagrangianState>,
    started: Instant,
}

/// Sample-weighted running means over batches.
#[derive(Debug, Default)]
struct Totals {
    samples: usize,
    loss: f64,
    accuracy: f64,
    power: f64,
}

impl Totals {
    fn add(&mut self, n: usize, loss: f64, eval: Evaluation) {
        let w = n as f64;
        self.samples += n;
        self.loss += w * loss;
        self.accuracy += w * eval.accuracy;
        self.power += w * eval.power;
    }

    fn means(&self) -> (f64, f64, f64) {
        let n = self.samples.max(1) as f64;
        (self.loss / n, self.accuracy / n, self.power / n)
    }
}

/// Drives one named training run against a checkpoint store.
#[derive(Debug)]
pub struct TrainingEngine {
    config: Config,
    store: CheckpointStore,
    run_id: String,
    evaluator: Evaluator,
    recorder: Option<MetricsRecorder>,
}

impl TrainingEngine {
    pub fn new(config: Config, store: CheckpointStore, run_id: impl Into<String>) -> Self {
        Self {
            config,
            store,
            run_id: run_id.into(),
            evaluator: Evaluator,
            recorder: None,
        }
    }

    /// Also append per-epoch metrics to a JSONL file.
    pub fn with_recorder(mut self, recorder: MetricsRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Train until convergence or until the wall-clock budget is spent.
    ///
    /// `optimizer` must have been created over `network`'s trainable parameters.
    pub fn run(
        &mut self,
        network: &mut Network,
        loss: &mut LossFunction,
        optimizer: &mut Adam,
        train: &dyn DataSource,
        valid: &dyn DataSource,
    ) -> PnnResult<Outcome> {
        if train.is_empty() || valid.is_empty() {
            return Err(PnnError::Data(
                "training and validation data must not be empty".to_string(),
            ));
        }

        let initial_lr = optimizer.lr();
        let mut session = Session {
            network,
            loss,
            optimizer,
            cursor: Cursor {
                epoch: 0,
                best_loss: f64::INFINITY,
                patience: 0,
                al_updates: 0,
                initial_lr,
            },
            history: Vec::new(),
            started: Instant::now(),
        };

        if let Some(checkpoint) = self.store.load(&self.run_id)? {
            self.resume(&checkpoint, &mut session)?;
            tracing::info!(
                run = %self.run_id,
                epoch = session.cursor.epoch,
                lr = session.optimizer.lr(),
                "restarting previous training from checkpoint"
            );
        }
        session.history.extend(session.loss.lagrangian());

        let mut phase = Phase::Running;
        loop {
            phase = match phase {
                Phase::Running => {
                    self.epoch(&mut session, train, valid)?;
                    if session.cursor.patience > self.config.patience {
                        tracing::info!(run = %self.run_id, epoch = session.cursor.epoch, "early stop");
                        Phase::LrDecay
                    } else {
                        self.unless_timed_out(&session, Phase::Running)
                    }
                }
                Phase::LrDecay => self.decay(&mut session)?,
                Phase::AlUpdate => self.update_multipliers(&mut session, train)?,
                Phase::Done => {
                    self.store.delete(&self.run_id)?;
                    tracing::info!(run = %self.run_id, epochs = session.cursor.epoch, "training finished");
                    return Ok(Outcome::Converged(self.summary(&session)));
                }
                Phase::TimedOut => {
                    tracing::warn!(
                        run = %self.run_id,
                        epoch = session.cursor.epoch,
                        "time limit reached, further training is necessary"
                    );
                    self.restore_best(&mut session)?;
                    return Ok(Outcome::BudgetExhausted(self.summary(&session)));
                }
            };
        }
    }

    /// One training pass and one validation pass.
    fn epoch(
        &mut self,
        session: &mut Session<'_>,
        train: &dyn DataSource,
        valid: &dyn DataSource,
    ) -> PnnResult<EpochMetrics> {
        let epoch = session.cursor.epoch;
        let started = Instant::now();

        let mut train_totals = Totals::default();
        for batch in train.batches() {
            let mut tape = Tape::new();
            let terms = session
                .loss
                .evaluate(&mut tape, session.network, &batch.inputs, &batch.labels)?;
            let value = tape.scalar(terms.total);
            if !value.is_finite() {
                return Err(PnnError::Divergence {
                    epoch,
                    reason: format!("training loss is {value}"),
                });
            }
            let grads = tape.backward(terms.total)?;
            if !grads.all_finite() {
                return Err(PnnError::Divergence {
                    epoch,
                    reason: "non-finite gradient".to_string(),
                });
            }
            let eval = self.evaluator.summarize(
                tape.value(terms.pass.output),
                &batch.labels,
                tape.scalar(terms.power),
            );
            train_totals.add(batch.len(), value, eval);

            session.optimizer.step(&grads);
            if !session.optimizer.is_finite() {
                return Err(PnnError::Divergence {
                    epoch,
                    reason: "optimizer state overflowed".to_string(),
                });
            }
            session.network.project_conductances();
        }

        let mut valid_totals = Totals::default();
        for batch in valid.batches() {
            let mut tape = Tape::detached();
            let terms = session
                .loss
                .evaluate(&mut tape, session.network, &batch.inputs, &batch.labels)?;
            let eval = self.evaluator.summarize(
                tape.value(terms.pass.output),
                &batch.labels,
                tape.scalar(terms.power),
            );
            valid_totals.add(batch.len(), tape.scalar(terms.total), eval);
        }

        let (train_loss, train_accuracy, train_power) = train_totals.means();
        let (valid_loss, valid_accuracy, valid_power) = valid_totals.means();
        if !valid_loss.is_finite() {
            return Err(PnnError::Divergence {
                epoch,
                reason: format!("validation loss is {valid_loss}"),
            });
        }

        session.cursor.epoch += 1;
        if valid_loss < session.cursor.best_loss {
            session.cursor.best_loss = valid_loss;
            session.cursor.patience = 0;
            self.save(session)?;
        } else {
            session.cursor.patience += 1;
        }

        let lagrangian = session.loss.lagrangian();
        let metrics = EpochMetrics {
            epoch,
            train_loss,
            valid_loss,
            train_accuracy,
            valid_accuracy,
            train_power,
            valid_power,
            lr: session.optimizer.lr(),
            patience: session.cursor.patience,
            lambda: lagrangian.map(|s| s.lambda),
            mu: lagrangian.map(|s| s.mu),
            epoch_secs: started.elapsed().as_secs_f64(),
        };

        if epoch % self.config.report_every == 0 {
            tracing::info!(
                run = %self.run_id,
                epoch,
                train_loss = format_args!("{train_loss:.4}"),
                valid_loss = format_args!("{valid_loss:.4}"),
                train_acc = format_args!("{train_accuracy:.4}"),
                valid_acc = format_args!("{valid_accuracy:.4}"),
                patience = session.cursor.patience,
                lr = format_args!("{:.3e}", metrics.lr),
                power = format_args!("{train_power:.2e}"),
                lambda = ?metrics.lambda,
                mu = ?metrics.mu,
                "epoch"
            );
        } else {
            tracing::debug!(run = %self.run_id, epoch, train_loss, valid_loss, "epoch");
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record("epoch", &self.run_id, &metrics)?;
        }
        Ok(metrics)
    }

    /// Reload the best network and shrink the learning rate.
    fn decay(&mut self, session: &mut Session<'_>) -> PnnResult<Phase> {
        self.restore_best(session)?;
        let lr = session.optimizer.lr() * self.config.lr_decay;
        session.optimizer.set_lr(lr);
        tracing::info!(
            run = %self.run_id,
            epoch = session.cursor.epoch,
            lr,
            "loaded best network, continuing with lower learning rate"
        );

        if lr <= self.config.lr_min {
            return Ok(match session.loss.penalty() {
                Penalty::WeightedSum { .. } => Phase::Done,
                Penalty::AugmentedLagrangian(_) => Phase::AlUpdate,
            });
        }

        session.cursor.best_loss = f64::INFINITY;
        session.cursor.patience = 0;
        self.save(session)?;
        Ok(self.unless_timed_out(session, Phase::Running))
    }

    /// Outer augmented-Lagrangian step after the inner problem converged.
    fn update_multipliers(&mut self, session: &mut Session<'_>, train: &dyn DataSource) -> PnnResult<Phase> {
        let Some(mut state) = session.loss.lagrangian() else {
            return Ok(Phase::Done);
        };
        let constraint = self.mean_constraint(session, train)?;
        tracing::info!(run = %self.run_id, constraint, "inner problem converged");
        if constraint <= 0.0 {
            return Ok(Phase::Done);
        }

        state.update(constraint, self.config.mu_growth);
        session.loss.set_lagrangian(state);
        session.history.push(state);
        session.cursor.al_updates += 1;

        let lr = 5.0 * session.cursor.initial_lr / (session.cursor.al_updates as f64 + 5.0);
        session.optimizer.set_lr(lr);
        session.cursor.best_loss = f64::INFINITY;
        session.cursor.patience = 0;
        self.save(session)?;

        tracing::info!(
            run = %self.run_id,
            lambda = state.lambda,
            mu = state.mu,
            lr,
            updates = session.cursor.al_updates,
            "multipliers updated, learning rate reset"
        );
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record("al_update", &self.run_id, &state)?;
        }
        Ok(self.unless_timed_out(session, Phase::Running))
    }

    /// Sample-weighted mean of `C = P − budget` over the training batches.
    fn mean_constraint(&self, session: &Session<'_>, train: &dyn DataSource) -> PnnResult<f64> {
        let mut weighted = 0.0;
        let mut samples = 0;
        for batch in train.batches() {
            let mut tape = Tape::detached();
            let pass = session.network.forward(&mut tape, &batch.inputs)?;
            let c = session.loss.constraint(&mut tape, session.network, &pass)?;
            weighted += tape.scalar(c) * batch.len() as f64;
            samples += batch.len();
        }
        Ok(weighted / samples.max(1) as f64)
    }

    fn unless_timed_out(&self, session: &Session<'_>, next: Phase) -> Phase {
        if session.started.elapsed() >= self.config.time_limit() {
            Phase::TimedOut
        } else {
            next
        }
    }

    fn save(&self, session: &Session<'_>) -> PnnResult<()> {
        let cursor = session.cursor;
        self.store.save(&Checkpoint {
            run_id: self.run_id.clone(),
            epoch: cursor.epoch,
            network: session.network.snapshot(),
            optimizer: session.optimizer.state(),
            best_loss: cursor.best_loss.is_finite().then_some(cursor.best_loss),
            initial_lr: cursor.initial_lr,
            lagrangian: session.loss.lagrangian(),
            al_updates: cursor.al_updates,
        })
    }

    /// Reload parameters and optimizer state from the checkpoint, keeping the epoch cursor.
    fn restore_best(&self, session: &mut Session<'_>) -> PnnResult<()> {
        if let Some(checkpoint) = self.store.load(&self.run_id)? {
            session.network.restore(&checkpoint.network)?;
            session.optimizer.load_state(&checkpoint.optimizer)?;
        }
        Ok(())
    }

    fn resume(&self, checkpoint: &Checkpoint, session: &mut Session<'_>) -> PnnResult<()> {
        if checkpoint.lagrangian.is_some() != session.loss.lagrangian().is_some() {
            return Err(PnnError::Checkpoint(format!(
                "checkpoint of run {} was written with a different penalty",
                self.run_id
            )));
        }
        session.network.restore(&checkpoint.network)?;
        session.optimizer.load_state(&checkpoint.optimizer)?;
        if let Some(state) = checkpoint.lagrangian {
            session.loss.set_lagrangian(state);
        }
        session.cursor = Cursor {
            epoch: checkpoint.epoch,
            best_loss: checkpoint.best_loss.unwrap_or(f64::INFINITY),
            patience: 0,
            al_updates: checkpoint.al_updates,
            initial_lr: checkpoint.initial_lr,
        };
        Ok(())
    }

    fn summary(&self, session: &Session<'_>) -> TrainingSummary {
        let best = session.cursor.best_loss;
        TrainingSummary {
            epochs: session.cursor.epoch,
            best_valid_loss: best.is_finite().then_some(best),
            lr: session.optimizer.lr(),
            lagrangian: session.loss.lagrangian(),
            al_updates: session.cursor.al_updates,
            al_history: session.history.clone(),
            elapsed: session.started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::linearly_separable;
    use crate::PenaltySelector;

    fn quick_config() -> Config {
        Config {
            lr: 0.05,
            lr_min: 0.02,
            lr_decay: 0.5,
            patience: 2,
            report_every: 1000,
            ..Config::default()
        }
    }

    #[test]
    fn test_weighted_sum_run_converges_and_cleans_up() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = quick_config();
        let data = linearly_separable(40, 0.1, 3).expect("data");
        let mut network = Network::from_config(&[2, 2], &config).expect("network");
        let mut loss = LossFunction::from_config(&config);
        let mut adam = Adam::new(network.trainable_parameters(false), config.lr);
        let store = CheckpointStore::new(dir.path()).expect("store");
        let mut engine = TrainingEngine::new(config, store.clone(), "unit");

        let outcome = engine
            .run(&mut network, &mut loss, &mut adam, &data.loader(0), &data.loader(0))
            .expect("run");
        assert!(outcome.is_converged());
        assert!(outcome.summary().epochs > 0);
        assert!(outcome.summary().lr <= 0.02);
        assert!(outcome.summary().al_history.is_empty());
        assert!(!store.exists("unit"));
    }

    #[test]
    fn test_empty_data_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = Config {
            penalty: PenaltySelector::AugmentedLagrangian,
            ..quick_config()
        };
        let data = linearly_separable(10, 0.1, 3).expect("data");
        let empty = data.subset(&[]);
        let mut network = Network::from_config(&[2, 2], &config).expect("network");
        let mut loss = LossFunction::from_config(&config);
        let mut adam = Adam::new(network.trainable_parameters(false), config.lr);
        let store = CheckpointStore::new(dir.path()).expect("store");
        let mut engine = TrainingEngine::new(config, store, "empty");
        let result = engine.run(&mut network, &mut loss, &mut adam, &data.loader(0), &empty.loader(0));
        assert!(matches!(result, Err(PnnError::Data(_))));
    }
}
