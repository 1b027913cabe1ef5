//! # gonet-exec
//!
//! Session lifecycle and the train/evaluate control loop.
//!
//! ## Key Components
//!
//! - [`Executor`]: builds the model once, restores, saves, closes, and
//!   answers bulk inference with [`Executor::run_many`]
//! - [`Executor::train`]: epochs of optimisation steps with NaN skipping
//!   and interrupt handling
//! - [`Executor::test`]: sampled evaluation with conditional checkpointing
//! - [`Saver`] / [`restore_latest`]: safetensors snapshots plus a
//!   `checkpoint` pointer file with bounded retention
//! - [`SummaryWriter`]: `events.jsonl` sinks for training and evaluation
//!
//! ## Example
//!
//! ```no_run
//! use gonet_core::{ArraySource, RunConfig};
//! use gonet_exec::{EvalOptions, Executor, TrainOptions};
//! use gonet_model::HParams;
//!
//! # fn main() -> Result<(), gonet_core::GoNetError> {
//! let mut executor = Executor::new(RunConfig::default(), HParams::default())?;
//! let device = executor.device()?.clone();
//! let mut train = ArraySource::from_safetensors("train.safetensors", &device, 1)?;
//! let mut test = ArraySource::from_safetensors("test.safetensors", &device, 2)?;
//!
//! executor.train(&mut train, &TrainOptions::default())?;
//! let metrics = executor.test(&mut test, &EvalOptions::default())?;
//! println!("move accuracy {:.3}", metrics.move_accuracy);
//! executor.close();
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod eval;
pub mod session;
pub mod summary;
pub mod train;

pub use checkpoint::{
    checkpoint_prefix, get_checkpoint_state, restore, restore_latest, CheckpointState, Saver,
};
pub use eval::{round_tag, should_save, EvalMetrics, EvalOptions, AVERAGING_EPSILON, SAVE_ACCURACY_THRESHOLD};
pub use session::Executor;
pub use summary::{read_summaries, SummaryRecord, SummaryWriter};
pub use train::{TrainOptions, TrainReport};
