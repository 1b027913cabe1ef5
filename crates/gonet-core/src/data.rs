//! Training and evaluation data sources.
//!
//! The loops only need three things from a source: its size, a shuffle,
//! and fixed-size batch retrieval. [`ArraySource`] is the in-memory
//! implementation used by the binary and the tests.

use std::path::Path;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::batch::RawBatch;
use crate::error::GoNetError;

/// A shuffled provider of fixed-size raw batches.
pub trait DataSource {
    /// Total number of examples.
    fn data_size(&self) -> usize;

    /// Reorders the examples and restarts iteration.
    fn shuffle(&mut self);

    /// Returns the next `n` examples, wrapping around at the end.
    fn get_batch(&mut self, n: usize) -> Result<RawBatch, GoNetError>;
}

/// In-memory data source over three tensors sharing a leading dimension.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use gonet_core::{ArraySource, DataSource, RawBatch};
///
/// let dev = Device::Cpu;
/// let raw = RawBatch {
///     features: Tensor::zeros((6, 5, 5, 17), DType::U8, &dev).unwrap(),
///     move_probs: Tensor::zeros((6, 26), DType::F32, &dev).unwrap(),
///     outcomes: Tensor::zeros((6, 1), DType::U8, &dev).unwrap(),
/// };
/// let mut source = ArraySource::new(raw, 7).unwrap();
/// assert_eq!(source.data_size(), 6);
/// let batch = source.get_batch(4).unwrap();
/// assert_eq!(batch.features.dims()[0], 4);
/// ```
pub struct ArraySource {
    features: Tensor,
    move_probs: Tensor,
    outcomes: Tensor,
    order: Vec<u32>,
    cursor: usize,
    rng: StdRng,
}

impl ArraySource {
    /// Wraps three tensors. `seed` drives every later shuffle.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Shape`] if the tensors are empty or disagree
    /// on the number of examples.
    pub fn new(raw: RawBatch, seed: u64) -> Result<Self, GoNetError> {
        let n = raw.features.dims().first().copied().unwrap_or(0);
        if n == 0 {
            return Err(GoNetError::shape("data source holds no examples"));
        }
        for (name, t) in [("move_probs", &raw.move_probs), ("outcomes", &raw.outcomes)] {
            if t.dims().first().copied() != Some(n) {
                return Err(GoNetError::shape(format!(
                    "{name} has shape {:?}, expected {n} examples",
                    t.dims()
                )));
            }
        }
        let order = (0..n as u32).collect();
        Ok(Self {
            features: raw.features,
            move_probs: raw.move_probs,
            outcomes: raw.outcomes,
            order,
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Loads tensors `features`, `move_probs` and `outcomes` from a
    /// safetensors file.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Internal`] if the file cannot be read and
    /// [`GoNetError::Shape`] if a tensor is missing.
    pub fn from_safetensors(
        path: impl AsRef<Path>,
        device: &Device,
        seed: u64,
    ) -> Result<Self, GoNetError> {
        let path = path.as_ref();
        let mut tensors =
            candle_core::safetensors::load(path, device).map_err(|e| GoNetError::Internal {
                message: format!("loading {}: {e}", path.display()),
            })?;
        let mut take = |name: &str| {
            tensors.remove(name).ok_or_else(|| {
                GoNetError::shape(format!("{} has no tensor '{name}'", path.display()))
            })
        };
        let raw = RawBatch {
            features: take("features")?,
            move_probs: take("move_probs")?,
            outcomes: take("outcomes")?,
        };
        tracing::debug!(path = %path.display(), "loaded data source");
        Self::new(raw, seed)
    }
}

impl DataSource for ArraySource {
    fn data_size(&self) -> usize {
        self.order.len()
    }

    fn shuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
    }

    fn get_batch(&mut self, n: usize) -> Result<RawBatch, GoNetError> {
        if n == 0 {
            return Err(GoNetError::shape("batch size must be positive"));
        }
        let len = self.order.len();
        let picks: Vec<u32> = (0..n)
            .map(|i| self.order[(self.cursor + i) % len])
            .collect();
        self.cursor = (self.cursor + n) % len;

        let map_err = |e: candle_core::Error| GoNetError::Internal {
            message: format!("get_batch: {e}"),
        };
        let index = Tensor::new(picks.as_slice(), self.features.device()).map_err(map_err)?;
        Ok(RawBatch {
            features: self.features.index_select(&index, 0).map_err(map_err)?,
            move_probs: self.move_probs.index_select(&index, 0).map_err(map_err)?,
            outcomes: self.outcomes.index_select(&index, 0).map_err(map_err)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn numbered_source(n: usize, seed: u64) -> ArraySource {
        let dev = Device::Cpu;
        let ids: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let raw = RawBatch {
            features: Tensor::zeros((n, 2, 2, 17), DType::U8, &dev).unwrap(),
            move_probs: Tensor::from_vec(ids, (n, 1), &dev).unwrap(),
            outcomes: Tensor::zeros((n, 1), DType::U8, &dev).unwrap(),
        };
        ArraySource::new(raw, seed).unwrap()
    }

    fn ids(batch: &RawBatch) -> Vec<f32> {
        batch.move_probs.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn batches_wrap_around() {
        let mut source = numbered_source(5, 0);
        assert_eq!(ids(&source.get_batch(3).unwrap()), vec![0.0, 1.0, 2.0]);
        assert_eq!(ids(&source.get_batch(3).unwrap()), vec![3.0, 4.0, 0.0]);
    }

    #[test]
    fn shuffle_is_a_seeded_permutation() {
        let mut a = numbered_source(20, 42);
        let mut b = numbered_source(20, 42);
        a.shuffle();
        b.shuffle();
        let first = ids(&a.get_batch(20).unwrap());
        assert_eq!(first, ids(&b.get_batch(20).unwrap()));

        let mut sorted = first.clone();
        sorted.sort_by(|x, y| x.partial_cmp(y).unwrap());
        let expected: Vec<f32> = (0..20).map(|i| i as f32).collect();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let dev = Device::Cpu;
        let raw = RawBatch {
            features: Tensor::zeros((4, 2, 2, 17), DType::U8, &dev).unwrap(),
            move_probs: Tensor::zeros((3, 26), DType::F32, &dev).unwrap(),
            outcomes: Tensor::zeros((4, 1), DType::U8, &dev).unwrap(),
        };
        assert!(matches!(
            ArraySource::new(raw, 0),
            Err(GoNetError::Shape { .. })
        ));
    }

    #[test]
    fn safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.safetensors");
        let dev = Device::Cpu;
        let tensors = std::collections::HashMap::from([
            (
                "features".to_string(),
                Tensor::ones((3, 2, 2, 17), DType::U8, &dev).unwrap(),
            ),
            (
                "move_probs".to_string(),
                Tensor::zeros((3, 5), DType::F32, &dev).unwrap(),
            ),
            (
                "outcomes".to_string(),
                Tensor::ones((3, 1), DType::U8, &dev).unwrap(),
            ),
        ]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let mut source = ArraySource::from_safetensors(&path, &dev, 1).unwrap();
        assert_eq!(source.data_size(), 3);
        assert_eq!(source.get_batch(2).unwrap().move_probs.dims(), &[2, 5]);
    }

    #[test]
    fn missing_tensor_is_shape_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.safetensors");
        let dev = Device::Cpu;
        let tensors = std::collections::HashMap::from([(
            "features".to_string(),
            Tensor::ones((3, 2, 2, 17), DType::U8, &dev).unwrap(),
        )]);
        candle_core::safetensors::save(&tensors, &path).unwrap();
        assert!(matches!(
            ArraySource::from_safetensors(&path, &dev, 1),
            Err(GoNetError::Shape { .. })
        ));
    }
}
