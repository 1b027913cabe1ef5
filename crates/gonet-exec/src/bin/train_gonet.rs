//! Training CLI for gonet.
//!
//! Alternates training passes and evaluations over safetensors data files.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release -p gonet-exec --bin train-gonet -- \
//!   --config plans/large20.json \
//!   --train data/train.safetensors \
//!   --test data/test.safetensors \
//!   --rounds 20 --proportion 0.1
//! ```
//!
//! The config file holds a `TrainingPlan`; any field may be omitted:
//!
//! ```json
//! {
//!   "run": { "batch_size": 32, "model": "elu", "load_model_path": "./savedmodels/large20" },
//!   "hps": { "num_residual_units": 20, "filters": 256, "optimizer": "mom" }
//! }
//! ```
//!
//! Ctrl-C closes the session at the next training step, or after the
//! current evaluation, and exits with 130. A second Ctrl-C exits at once.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use candle_core::Device;
use clap::Parser;
use gonet_core::{ArraySource, DataSource, GoNetError, RunConfig};
use gonet_exec::{EvalOptions, Executor, TrainOptions, SAVE_ACCURACY_THRESHOLD};
use gonet_model::HParams;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "train-gonet", about = "Train and evaluate a gonet policy-value network")]
struct Args {
    /// JSON training plan (run config and hyperparameters).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Training data (safetensors with features, move_probs, outcomes).
    #[arg(long)]
    train: PathBuf,

    /// Evaluation data; evaluation is skipped without it.
    #[arg(long)]
    test: Option<PathBuf>,

    /// Train/evaluate rounds.
    #[arg(long, default_value_t = 1)]
    rounds: usize,

    /// Fraction of evaluation batches used per round.
    #[arg(long, default_value_t = 0.1)]
    proportion: f64,

    /// Save after every evaluation regardless of accuracy.
    #[arg(long)]
    force_save: bool,

    /// Never save checkpoints.
    #[arg(long)]
    no_save: bool,

    /// Move accuracy an evaluation must exceed to save a checkpoint.
    #[arg(long, default_value_t = SAVE_ACCURACY_THRESHOLD)]
    save_threshold: f32,

    /// Learning rate override for every training pass.
    #[arg(long)]
    lr: Option<f64>,

    /// Shuffle seed for the data sources.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct TrainingPlan {
    run: RunConfig,
    hps: HParams,
}

fn load_plan(path: Option<&PathBuf>) -> Result<TrainingPlan, GoNetError> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&json)?)
        }
        None => Ok(TrainingPlan::default()),
    }
}

fn run(args: Args) -> Result<(), GoNetError> {
    let plan = load_plan(args.config.as_ref())?;
    let mut executor = Executor::new(plan.run, plan.hps)?;

    let flag = executor.interrupt_handle();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
    })
    .map_err(|e| GoNetError::Internal {
        message: format!("installing Ctrl-C handler: {e}"),
    })?;

    // Data stays on the host; the executor moves each batch to its device.
    let mut train = ArraySource::from_safetensors(&args.train, &Device::Cpu, args.seed)?;
    let mut test = args
        .test
        .as_ref()
        .map(|path| ArraySource::from_safetensors(path, &Device::Cpu, args.seed.wrapping_add(1)))
        .transpose()?;
    executor.check_interrupt()?;
    tracing::info!(
        train_examples = train.data_size(),
        rounds = args.rounds,
        "data loaded"
    );

    let train_options = TrainOptions {
        learning_rate: args.lr,
        ..TrainOptions::default()
    };
    let eval_options = EvalOptions {
        proportion: args.proportion,
        save_threshold: args.save_threshold,
        force_save_model: args.force_save,
        no_save: args.no_save,
    };

    for round in 0..args.rounds {
        executor.check_interrupt()?;
        train.shuffle();
        let report = executor.train(&mut train, &train_options)?;
        tracing::info!(round, steps = report.steps, skipped = report.skipped, "round trained");

        if let Some(test) = test.as_mut() {
            let metrics = executor.test(test, &eval_options)?;
            tracing::info!(
                round,
                move_accuracy = metrics.move_accuracy,
                outcome_accuracy = metrics.outcome_accuracy,
                loss = metrics.loss,
                checkpoint = ?metrics.checkpoint,
                "round evaluated"
            );
            executor.check_interrupt()?;
        }
    }

    executor.close();
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(GoNetError::Interrupted) => {
            tracing::warn!("interrupted by user");
            ExitCode::from(130)
        }
        Err(e) => {
            tracing::error!(error = %e, "train-gonet failed");
            ExitCode::FAILURE
        }
    }
}
