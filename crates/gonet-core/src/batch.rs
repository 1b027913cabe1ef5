//! Batch preprocessing.
//!
//! Raw batches arrive as three arrays of arbitrary dtype:
//!
//! - feature planes `[N, rows, cols, 17]`, the last plane a 0/1 colour flag
//! - move-probability targets `[N, classes]`
//! - game outcomes `[N, 1]` in {0, 1}
//!
//! Preprocessing casts everything to f32 and maps the colour plane and the
//! outcomes from {0, 1} to {-1, +1} with `(x - 0.5) * 2`. Bulk inference has
//! no outcomes and only goes through [`remap_features`].

use candle_core::{DType, Tensor};

use crate::error::GoNetError;

/// Dimensions of one example.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureLayout {
    pub rows: usize,
    pub cols: usize,
    pub channels: usize,
    pub classes: usize,
}

/// A batch exactly as a data source returns it.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub features: Tensor,
    pub move_probs: Tensor,
    pub outcomes: Tensor,
}

/// A batch ready to be fed: f32, colour plane and outcomes in {-1, +1}.
#[derive(Debug, Clone)]
pub struct Batch {
    pub features: Tensor,
    pub move_probs: Tensor,
    pub outcomes: Tensor,
}

impl Batch {
    /// Number of examples in the batch.
    pub fn len(&self) -> usize {
        self.features.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn map_err(context: &'static str) -> impl Fn(candle_core::Error) -> GoNetError {
    move |e| GoNetError::Internal {
        message: format!("{context}: {e}"),
    }
}

/// Casts feature planes to f32 and remaps the colour plane to {-1, +1}.
///
/// The colour plane is the last of `channels` planes; all other planes are
/// passed through unchanged.
///
/// # Errors
///
/// Returns [`GoNetError::Shape`] if `features` is not rank 4 with
/// `channels` planes in the last dimension.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use gonet_core::remap_features;
///
/// let planes = Tensor::ones((1, 2, 2, 17), candle_core::DType::U8, &Device::Cpu).unwrap();
/// let remapped = remap_features(&planes, 17).unwrap();
/// let colour = remapped.narrow(3, 16, 1).unwrap().flatten_all().unwrap();
/// assert_eq!(colour.to_vec1::<f32>().unwrap(), vec![1.0; 4]);
/// ```
pub fn remap_features(features: &Tensor, channels: usize) -> Result<Tensor, GoNetError> {
    let dims = features.dims();
    if dims.len() != 4 {
        return Err(GoNetError::shape(format!(
            "feature planes must be rank 4 [N, rows, cols, {channels}], got shape {dims:?}"
        )));
    }
    if channels == 0 || dims[3] != channels {
        return Err(GoNetError::shape(format!(
            "feature planes must have {channels} channels, got shape {dims:?}"
        )));
    }

    let map_err = map_err("remap_features");
    let features = features.to_dtype(DType::F32).map_err(&map_err)?;
    let colour = channels - 1;

    let colour_plane = features
        .narrow(3, colour, 1)
        .map_err(&map_err)?
        .affine(1.0, -0.5)
        .map_err(&map_err)?
        .affine(2.0, 0.0)
        .map_err(&map_err)?;

    if colour == 0 {
        return Ok(colour_plane);
    }
    let planes = features.narrow(3, 0, colour).map_err(&map_err)?;
    Tensor::cat(&[&planes, &colour_plane], 3).map_err(&map_err)
}

/// Casts outcomes to f32 and remaps {0, 1} to {-1, +1}.
///
/// # Errors
///
/// Returns [`GoNetError::Internal`] if the cast fails.
pub fn remap_outcomes(outcomes: &Tensor) -> Result<Tensor, GoNetError> {
    let map_err = map_err("remap_outcomes");
    outcomes
        .to_dtype(DType::F32)
        .map_err(&map_err)?
        .affine(1.0, -0.5)
        .map_err(&map_err)?
        .affine(2.0, 0.0)
        .map_err(&map_err)
}

/// Turns a raw batch into a feedable one.
///
/// # Errors
///
/// Returns [`GoNetError::Shape`] if any array disagrees with `layout` or
/// the three arrays disagree on the number of examples.
pub fn preprocess(raw: &RawBatch, layout: &FeatureLayout) -> Result<Batch, GoNetError> {
    let f_dims = raw.features.dims();
    if f_dims.len() != 4 || f_dims[1] != layout.rows || f_dims[2] != layout.cols {
        return Err(GoNetError::shape(format!(
            "feature planes must be [N, {}, {}, {}], got {f_dims:?}",
            layout.rows, layout.cols, layout.channels
        )));
    }
    let n = f_dims[0];

    let l_dims = raw.move_probs.dims();
    if l_dims != [n, layout.classes] {
        return Err(GoNetError::shape(format!(
            "move targets must be [{n}, {}], got {l_dims:?}",
            layout.classes
        )));
    }
    let o_dims = raw.outcomes.dims();
    if o_dims != [n, 1] {
        return Err(GoNetError::shape(format!(
            "outcome targets must be [{n}, 1], got {o_dims:?}"
        )));
    }

    let features = remap_features(&raw.features, layout.channels)?;
    let move_probs = raw
        .move_probs
        .to_dtype(DType::F32)
        .map_err(map_err("preprocess"))?;
    let outcomes = remap_outcomes(&raw.outcomes)?;

    Ok(Batch {
        features,
        move_probs,
        outcomes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn layout() -> FeatureLayout {
        FeatureLayout {
            rows: 3,
            cols: 3,
            channels: 17,
            classes: 10,
        }
    }

    fn raw_batch(n: usize) -> RawBatch {
        let device = Device::Cpu;
        // Alternate 0/1 everywhere so every plane holds both values.
        let data: Vec<u8> = (0..n * 3 * 3 * 17).map(|i| (i % 2) as u8).collect();
        let features = Tensor::from_vec(data, (n, 3, 3, 17), &device).unwrap();
        let move_probs = Tensor::zeros((n, 10), DType::F64, &device).unwrap();
        let outcomes: Vec<u8> = (0..n).map(|i| (i % 2) as u8).collect();
        let outcomes = Tensor::from_vec(outcomes, (n, 1), &device).unwrap();
        RawBatch {
            features,
            move_probs,
            outcomes,
        }
    }

    #[test]
    fn colour_plane_maps_to_plus_minus_one() {
        let raw = raw_batch(4);
        let batch = preprocess(&raw, &layout()).unwrap();

        let before = raw
            .features
            .narrow(3, 16, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<u8>()
            .unwrap();
        let after = batch
            .features
            .narrow(3, 16, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (b, a) in before.iter().zip(after.iter()) {
            let expected = if *b == 1 { 1.0 } else { -1.0 };
            assert_eq!(*a, expected);
        }
    }

    #[test]
    fn other_planes_unchanged() {
        let raw = raw_batch(2);
        let batch = preprocess(&raw, &layout()).unwrap();

        let before = raw
            .features
            .narrow(3, 0, 16)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let after = batch
            .features
            .narrow(3, 0, 16)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn outcomes_remapped_and_cast() {
        let batch = preprocess(&raw_batch(4), &layout()).unwrap();
        assert_eq!(batch.move_probs.dtype(), DType::F32);
        let outcomes = batch.outcomes.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(outcomes, vec![-1.0, 1.0, -1.0, 1.0]);
    }

    #[test]
    fn inference_remap_matches_training_remap() {
        let raw = raw_batch(3);
        let trained = preprocess(&raw, &layout()).unwrap().features;
        let inferred = remap_features(&raw.features, 17).unwrap();
        let a = trained.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = inferred.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn wrong_channel_count_is_shape_error() {
        let device = Device::Cpu;
        let features = Tensor::zeros((2, 3, 3, 16), DType::F32, &device).unwrap();
        let err = remap_features(&features, 17).unwrap_err();
        assert!(matches!(err, GoNetError::Shape { .. }));
    }

    #[test]
    fn wrong_rank_is_shape_error() {
        let device = Device::Cpu;
        let features = Tensor::zeros((3, 3, 17), DType::F32, &device).unwrap();
        assert!(matches!(
            remap_features(&features, 17),
            Err(GoNetError::Shape { .. })
        ));
    }

    #[test]
    fn mismatched_batch_dimension_is_shape_error() {
        let mut raw = raw_batch(4);
        raw.outcomes = Tensor::zeros((3, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            preprocess(&raw, &layout()),
            Err(GoNetError::Shape { .. })
        ));
    }

    #[test]
    fn wrong_label_width_is_shape_error() {
        let mut raw = raw_batch(2);
        raw.move_probs = Tensor::zeros((2, 11), DType::F32, &Device::Cpu).unwrap();
        assert!(preprocess(&raw, &layout()).is_err());
    }
}
