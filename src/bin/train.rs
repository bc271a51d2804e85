//! PNN training binary.
//!
//! Pretrains a printed neural network with the configured power penalty,
//! prunes it, and fine-tunes the pruned circuit at a tenth of the learning
//! rate. Each stage resumes from its checkpoint after an interruption, and
//! stages whose model file already exists are skipped.
//!
//! Exit status is 0 when every stage finished, 2 when the wall-clock budget
//! ran out (rerun to continue), and 1 on errors.

use clap::Parser;
use pnn::checkpoint::{load_model, save_model, CheckpointStore};
use pnn::data::synthetic::linearly_separable;
use pnn::data::{Dataset, Split};
use pnn::training::MetricsRecorder;
use pnn::{Adam, Config, Evaluator, LossFunction, Network, Outcome, PnnResult, TrainingEngine};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Parser, Debug)]
#[command(
    name = "pnn-train",
    about = "Power-aware training of a printed analog neural network"
)]
struct Args {
    /// Headerless CSV dataset (features..., class label). A synthetic two-class set is used when absent
    #[arg(long)]
    data: Option<PathBuf>,

    /// Sample count of the synthetic dataset
    #[arg(long, default_value_t = 400)]
    synthetic_samples: usize,

    /// JSON configuration file; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hidden layer sizes, comma separated
    #[arg(long, value_delimiter = ',', default_value = "3")]
    hidden: Vec<usize>,

    /// Directory for trained model files
    #[arg(long, default_value = "data/models")]
    model_dir: PathBuf,

    /// Checkpoint directory
    #[arg(long, default_value = "data/checkpoints")]
    checkpoint_dir: PathBuf,

    /// Append per-epoch metrics to this JSONL file
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    /// Power penalty: "power" (weighted sum) or "AL" (augmented Lagrangian)
    #[arg(long)]
    penalty: Option<String>,

    /// Power budget in watts
    #[arg(long)]
    power_budget: Option<f64>,

    /// Weight of power in the weighted-sum penalty
    #[arg(long)]
    power_balance: Option<f64>,

    /// Initial learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Wall-clock budget per training stage
    #[arg(long)]
    time_limit_hours: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Mini-batch size (0 = full batch)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Also optimize the nonlinear circuit designs
    #[arg(long, default_value_t = false)]
    train_circuits: bool,
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);
    Registry::default().with(filter).with(fmt_layer).init();
}

fn build_config(args: &Args) -> PnnResult<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if let Some(penalty) = &args.penalty {
        config.penalty = penalty.parse()?;
    }
    if let Some(v) = args.power_budget {
        config.power_budget = v;
    }
    if let Some(v) = args.power_balance {
        config.power_balance = v;
    }
    if let Some(v) = args.lr {
        config.lr = v;
    }
    if let Some(v) = args.time_limit_hours {
        config.time_limit_hours = v;
    }
    if let Some(v) = args.seed {
        config.seed = v;
    }
    if let Some(v) = args.batch_size {
        config.batch_size = v;
    }
    config.train_circuits |= args.train_circuits;
    config.validate()?;
    if config.fine_tune_is_truncated() {
        tracing::warn!(
            lr = config.lr,
            lr_min = config.lr_min,
            fine_tune_lr = config.fine_tune_lr(),
            "fine tuning starts at or below lr_min and stops after its first decay"
        );
    }
    Ok(config)
}

/// Returns `Ok(false)` when a stage ran out of time.
fn run(args: &Args) -> PnnResult<bool> {
    let config = build_config(args)?;

    let (name, mut dataset) = match &args.data {
        Some(path) => (
            path.file_stem()
                .map_or_else(|| "data".to_string(), |s| s.to_string_lossy().into_owned()),
            Dataset::from_csv(path)?,
        ),
        None => (
            "synthetic".to_string(),
            linearly_separable(args.synthetic_samples, 0.05, config.seed)?,
        ),
    };
    dataset.normalize();
    let split = dataset.split(0.6, 0.2, config.seed)?;
    tracing::info!(
        dataset = %name,
        features = dataset.n_features(),
        classes = dataset.n_classes(),
        train = split.train.len(),
        valid = split.valid.len(),
        test = split.test.len(),
        "loaded data"
    );

    let setup = format!(
        "data_{name}_seed_{}_Penalty_{}_Factor_{}",
        config.seed, config.penalty, config.power_balance
    );
    let pretrained = args.model_dir.join(format!("pNN_{setup}.json"));
    let finetuned = args.model_dir.join(format!("pNN_{setup}_FT.json"));
    if finetuned.is_file() {
        tracing::info!(setup = %setup, "training was already finished, skipping");
        return Ok(true);
    }

    let mut topology = vec![dataset.n_features()];
    topology.extend(&args.hidden);
    topology.push(dataset.n_classes());
    tracing::info!(?topology, setup = %setup, "training setup");

    let store = CheckpointStore::new(&args.checkpoint_dir)?;
    let mut network = Network::from_config(&topology, &config)?;

    if pretrained.is_file() {
        network.restore(&load_model(&pretrained)?)?;
        tracing::info!("network is pretrained, now fine tuning");
    } else {
        let outcome = train_stage(&config, &store, args, &mut network, &split, format!("{setup}_PT"), config.lr)?;
        if !outcome.is_converged() {
            return Ok(false);
        }
        save_model(&pretrained, &network.snapshot())?;
        tracing::info!(path = %pretrained.display(), "pretraining is finished");
    }

    let report = network.prune();
    tracing::info!(
        "{} ({:.2}%) resistors, {} ({:.2}%) activations and {} ({:.2}%) negation circuits are pruned",
        report.counts.pruned_weights,
        report.weight_fraction * 100.0,
        report.counts.pruned_activations,
        report.activation_fraction * 100.0,
        report.counts.pruned_negations,
        report.negation_fraction * 100.0
    );

    let outcome = train_stage(
        &config,
        &store,
        args,
        &mut network,
        &split,
        format!("{setup}_FT"),
        config.fine_tune_lr(),
    )?;
    if !outcome.is_converged() {
        return Ok(false);
    }
    save_model(&finetuned, &network.snapshot())?;

    let test = Evaluator.evaluate(&network, split.test.inputs(), split.test.labels())?;
    tracing::info!(
        accuracy = format_args!("{:.4}", test.accuracy),
        power = format_args!("{:.3e}", test.power),
        path = %finetuned.display(),
        "fine tuning is finished"
    );
    Ok(true)
}

fn train_stage(
    config: &Config,
    store: &CheckpointStore,
    args: &Args,
    network: &mut Network,
    split: &Split,
    run_id: String,
    lr: f64,
) -> PnnResult<Outcome> {
    let mut loss = LossFunction::from_config(config);
    let mut optimizer = Adam::new(network.trainable_parameters(config.train_circuits), lr);
    let mut engine = TrainingEngine::new(config.clone(), store.clone(), run_id);
    if let Some(path) = args.metrics_file.as_deref() {
        engine = engine.with_recorder(MetricsRecorder::open(path)?);
    }
    engine.run(
        network,
        &mut loss,
        &mut optimizer,
        &split.train.loader(config.batch_size),
        &split.valid.loader(config.batch_size),
    )
}
