//! Evaluation loop.
//!
//! Evaluates `floor(data_size / batch_size * proportion)` batches of a
//! freshly shuffled source in inference mode, averages the metrics and
//! optionally saves a checkpoint tagged with the rounded move accuracy.
//!
//! Averages divide by `batches - 0.01`, not `batches`: they read slightly
//! high, and zero batches yields `-0.0` rather than NaN.

use std::path::PathBuf;

use gonet_core::{preprocess, DataSource, GoNetError};
use gonet_model::Controls;

use crate::session::{batch_to_device, Executor, Session};

/// Default move accuracy above which an evaluation saves a checkpoint.
pub const SAVE_ACCURACY_THRESHOLD: f32 = 0.4;

/// Subtracted from the batch count when averaging.
pub const AVERAGING_EPSILON: f32 = 1e-2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalOptions {
    /// Fraction of the available batches to evaluate.
    pub proportion: f64,
    /// Move accuracy an evaluation must exceed to save.
    pub save_threshold: f32,
    /// Save regardless of accuracy.
    pub force_save_model: bool,
    /// Never save; overrides `force_save_model`.
    pub no_save: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            proportion: 0.1,
            save_threshold: SAVE_ACCURACY_THRESHOLD,
            force_save_model: false,
            no_save: false,
        }
    }
}

/// Aggregated evaluation results.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalMetrics {
    pub loss: f32,
    pub move_accuracy: f32,
    pub outcome_accuracy: f32,
    /// Batches evaluated.
    pub batches: usize,
    /// Data file written by this evaluation, if any.
    pub checkpoint: Option<PathBuf>,
}

/// Whether an evaluation with aggregate move accuracy `accuracy` saves.
pub fn should_save(accuracy: f32, options: &EvalOptions) -> bool {
    !options.no_save && (accuracy > options.save_threshold || options.force_save_model)
}

/// Checkpoint tag for an accuracy: rounded to four decimals.
pub fn round_tag(accuracy: f32) -> f64 {
    (f64::from(accuracy) * 1e4).round() / 1e4
}

impl Executor {
    /// Evaluates a sampled fraction of `source`.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Save`] if a triggered save fails,
    /// [`GoNetError::Closed`] after `close`, and any data-source, shape or
    /// I/O error.
    pub fn test<S: DataSource + ?Sized>(
        &mut self,
        source: &mut S,
        options: &EvalOptions,
    ) -> Result<EvalMetrics, GoNetError> {
        let batch_size = self.config.batch_size;
        let layout = self.config.layout();
        let controls = Controls {
            training: false,
            temperature: self.hps.temperature,
            ..Controls::default()
        };

        source.shuffle();
        let num_minibatches = source.data_size() / batch_size;
        let batches = (num_minibatches as f64 * options.proportion).floor() as usize;

        let (mut loss, mut move_acc, mut outcome_acc) = (0f32, 0f32, 0f32);
        {
            let Session {
                device,
                model,
                placeholders,
                test_writer,
                compute_pool,
                ..
            } = self.session_mut()?;
            let step = model.global_step()?;

            for _ in 0..batches {
                let raw = source.get_batch(batch_size)?;
                let batch = preprocess(&raw, &layout)?;
                placeholders.check(&batch)?;
                let batch = batch_to_device(batch, device)?;

                let summary = compute_pool.install(|| model.evaluate(&batch, &controls))?;
                test_writer.add_summary(&summary, step)?;
                loss += summary.loss;
                move_acc += summary.move_accuracy;
                outcome_acc += summary.outcome_accuracy;
            }
        }

        let divisor = batches as f32 - AVERAGING_EPSILON;
        let mut metrics = EvalMetrics {
            loss: loss / divisor,
            move_accuracy: move_acc / divisor,
            outcome_accuracy: outcome_acc / divisor,
            batches,
            checkpoint: None,
        };
        tracing::info!(
            batches,
            loss = metrics.loss,
            move_accuracy = metrics.move_accuracy,
            outcome_accuracy = metrics.outcome_accuracy,
            "evaluation finished"
        );

        if should_save(metrics.move_accuracy, options) {
            metrics.checkpoint = Some(self.save_model(round_tag(metrics.move_accuracy))?);
        }
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saves_above_threshold_only() {
        let options = EvalOptions::default();
        assert!(should_save(0.41, &options));
        assert!(!should_save(0.39, &options));
        assert!(!should_save(0.4, &options));
    }

    #[test]
    fn force_and_no_save() {
        let forced = EvalOptions {
            force_save_model: true,
            ..EvalOptions::default()
        };
        assert!(should_save(0.39, &forced));

        let never = EvalOptions {
            force_save_model: true,
            no_save: true,
            ..EvalOptions::default()
        };
        assert!(!should_save(0.9, &never));
    }

    #[test]
    fn threshold_is_configurable() {
        let strict = EvalOptions {
            save_threshold: 0.6,
            ..EvalOptions::default()
        };
        assert!(!should_save(0.55, &strict));
        assert!(should_save(0.61, &strict));
    }

    #[test]
    fn tags_round_to_four_decimals() {
        assert_eq!(round_tag(0.51234), 0.5123);
        assert_eq!(round_tag(0.41), 0.41);
        assert_eq!(round_tag(0.0), 0.0);
    }

    #[test]
    fn zero_batches_average_is_finite() {
        let divisor = 0f32 - AVERAGING_EPSILON;
        let avg = 0f32 / divisor;
        assert!(avg.is_finite());
        assert_eq!(avg, 0.0);
    }
}
