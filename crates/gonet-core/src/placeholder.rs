//! Shape contracts for the three fed inputs.

use candle_core::Tensor;

use crate::batch::Batch;
use crate::config::{Mode, RunConfig};
use crate::error::GoNetError;

/// A named input with a partially known shape.
///
/// `None` marks an unbound dimension; every `Some` dimension must match
/// exactly when a tensor is fed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub name: String,
    pub shape: Vec<Option<usize>>,
}

impl Placeholder {
    pub fn new(name: impl Into<String>, shape: Vec<Option<usize>>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    /// Checks that `tensor` can be fed to this placeholder.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Shape`] on a rank mismatch or on any bound
    /// dimension that differs.
    pub fn check(&self, tensor: &Tensor) -> Result<(), GoNetError> {
        let dims = tensor.dims();
        if dims.len() != self.shape.len() {
            return Err(GoNetError::shape(format!(
                "{}: expected rank {}, got shape {dims:?}",
                self.name,
                self.shape.len()
            )));
        }
        for (axis, (expected, actual)) in self.shape.iter().zip(dims).enumerate() {
            if let Some(expected) = expected {
                if expected != actual {
                    return Err(GoNetError::shape(format!(
                        "{}: dimension {axis} must be {expected}, got shape {dims:?}",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The images, move-label and outcome placeholders of one executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders {
    pub images: Placeholder,
    pub labels: Placeholder,
    pub results: Placeholder,
}

impl Placeholders {
    /// Builds the placeholders for `config`. The batch dimension is bound to
    /// `batch_size` in [`Mode::Train`] and left open in [`Mode::Inference`].
    pub fn new(config: &RunConfig) -> Self {
        let batch = match config.mode {
            Mode::Train => Some(config.batch_size),
            Mode::Inference => None,
        };
        Self {
            images: Placeholder::new(
                "images",
                vec![
                    batch,
                    Some(config.img_rows),
                    Some(config.img_cols),
                    Some(config.img_channels),
                ],
            ),
            labels: Placeholder::new("labels", vec![batch, Some(config.num_classes)]),
            results: Placeholder::new("results", vec![batch, Some(1)]),
        }
    }

    /// Checks all three tensors of a preprocessed batch.
    ///
    /// # Errors
    ///
    /// Returns the first [`GoNetError::Shape`] encountered.
    pub fn check(&self, batch: &Batch) -> Result<(), GoNetError> {
        self.images.check(&batch.features)?;
        self.labels.check(&batch.move_probs)?;
        self.results.check(&batch.outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn small_config(mode: Mode) -> RunConfig {
        RunConfig {
            batch_size: 4,
            img_rows: 5,
            img_cols: 5,
            num_classes: 26,
            mode,
            ..RunConfig::default()
        }
    }

    #[test]
    fn train_mode_binds_batch_dimension() {
        let ph = Placeholders::new(&small_config(Mode::Train));
        assert_eq!(ph.images.shape, vec![Some(4), Some(5), Some(5), Some(17)]);

        let ok = Tensor::zeros((4, 5, 5, 17), DType::F32, &Device::Cpu).unwrap();
        assert!(ph.images.check(&ok).is_ok());
        let wrong_batch = Tensor::zeros((3, 5, 5, 17), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            ph.images.check(&wrong_batch),
            Err(GoNetError::Shape { .. })
        ));
    }

    #[test]
    fn inference_mode_accepts_any_batch() {
        let ph = Placeholders::new(&small_config(Mode::Inference));
        assert_eq!(ph.labels.shape, vec![None, Some(26)]);
        for n in [1, 7, 100] {
            let t = Tensor::zeros((n, 26), DType::F32, &Device::Cpu).unwrap();
            assert!(ph.labels.check(&t).is_ok());
        }
    }

    #[test]
    fn rank_mismatch_rejected() {
        let ph = Placeholders::new(&small_config(Mode::Inference));
        let t = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        let err = ph.results.check(&t).unwrap_err();
        assert!(err.to_string().contains("results"));
    }
}
