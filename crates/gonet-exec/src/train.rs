//! Training loop.
//!
//! Per step:
//! 1. Check the interrupt flag; if set, close the executor and stop
//! 2. Draw `batch_size` examples and preprocess them
//! 3. One optimisation step (training mode, reinforcement sign, loss kind)
//! 4. Record the summary at the current global step, then advance it
//!
//! A step that fails with [`GoNetError::NumericInstability`] is logged and
//! skipped: no update, no summary, no global-step advance.

use gonet_core::{preprocess, DataSource, GoNetError};
use gonet_model::Controls;

use crate::session::{batch_to_device, Executor, Session};

/// Per-call training controls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainOptions {
    /// Sign of the policy loss: 1.0 to imitate the targets, -1.0 to move away.
    pub direction: f64,
    /// Cross-entropy against the argmax move instead of the full target.
    pub use_sparse: bool,
    /// Overrides the optimizer learning rate from this call on.
    pub learning_rate: Option<f64>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            direction: 1.0,
            use_sparse: true,
            learning_rate: None,
        }
    }
}

/// What one `train` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainReport {
    /// Completed optimisation steps.
    pub steps: usize,
    /// Steps skipped for numeric instability.
    pub skipped: usize,
    /// Global step after the last completed step.
    pub global_step: i64,
}

impl Executor {
    /// Runs `num_epoch` passes of `data_size / batch_size` steps.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Interrupted`] once the interrupt flag is seen
    /// (the executor is closed by then), [`GoNetError::Closed`] if called
    /// after `close`, and any data-source, shape or I/O error.
    pub fn train<S: DataSource + ?Sized>(
        &mut self,
        source: &mut S,
        options: &TrainOptions,
    ) -> Result<TrainReport, GoNetError> {
        let batch_size = self.config.batch_size;
        let layout = self.config.layout();
        let steps_per_epoch = source.data_size() / batch_size;
        let controls = Controls {
            training: true,
            temperature: self.hps.temperature,
            reinforce_dir: options.direction,
            use_sparse: options.use_sparse,
        };

        if let Some(lr) = options.learning_rate {
            self.session_mut()?.model.set_learning_rate(lr);
        }

        let mut report = TrainReport {
            global_step: self.global_step()?,
            ..TrainReport::default()
        };

        for epoch in 0..self.config.num_epoch {
            for _ in 0..steps_per_epoch {
                if let Err(e) = self.check_interrupt() {
                    tracing::warn!(epoch, global_step = report.global_step, "training interrupted");
                    return Err(e);
                }

                let Session {
                    device,
                    model,
                    placeholders,
                    train_writer,
                    compute_pool,
                    ..
                } = self.session_mut()?;

                let raw = source.get_batch(batch_size)?;
                let batch = preprocess(&raw, &layout)?;
                placeholders.check(&batch)?;
                let batch = batch_to_device(batch, device)?;

                let step = model.global_step()?;
                match compute_pool.install(|| model.train_step(&batch, &controls)) {
                    Ok(summary) => {
                        train_writer.add_summary(&summary, step)?;
                        report.global_step = model.increase_global_step()?;
                        report.steps += 1;
                        tracing::debug!(
                            epoch,
                            global_step = step,
                            loss = summary.loss,
                            move_accuracy = summary.move_accuracy,
                            outcome_accuracy = summary.outcome_accuracy,
                            temperature = summary.temperature,
                            grad_norm = summary.grad_norm,
                            "train step"
                        );
                    }
                    Err(GoNetError::NumericInstability { message }) => {
                        report.skipped += 1;
                        tracing::warn!(epoch, global_step = step, %message, "skipping step");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        tracing::info!(
            steps = report.steps,
            skipped = report.skipped,
            global_step = report.global_step,
            "training pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_imitate_with_sparse_loss() {
        let options = TrainOptions::default();
        assert_eq!(options.direction, 1.0);
        assert!(options.use_sparse);
        assert!(options.learning_rate.is_none());
    }
}
