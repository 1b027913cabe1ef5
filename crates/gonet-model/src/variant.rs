//! The shared network contract and variant selection.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use gonet_core::{FeatureLayout, GoNetError, Variant};

use crate::full::FullPreActNet;
use crate::hparams::HParams;
use crate::norm::PendingStat;
use crate::resnet::{Activation, ResidualNet};

/// A policy-value network.
///
/// `images` is `[N, rows, cols, channels]` (NHWC, as fed). The result is
/// `(policy_logits [N, classes], value [N, 1])` with the value in `[-1, 1]`.
/// Training-mode batch statistics are pushed onto `stats` and not applied.
pub trait PolicyValueNet: Send + Sync {
    fn forward_t(
        &self,
        images: &Tensor,
        train: bool,
        stats: &mut Vec<PendingStat>,
    ) -> candle_core::Result<(Tensor, Tensor)>;
}

/// Builds the network for `variant`, creating its parameters through `vb`.
///
/// # Errors
///
/// Returns [`GoNetError::Internal`] if parameter creation fails.
pub fn build_net(
    variant: Variant,
    hps: &HParams,
    layout: &FeatureLayout,
    vb: VarBuilder,
) -> Result<Box<dyn PolicyValueNet>, GoNetError> {
    let map_err = |e: candle_core::Error| GoNetError::Internal {
        message: format!("building {variant} network: {e}"),
    };
    let net: Box<dyn PolicyValueNet> = match variant {
        Variant::Original => {
            Box::new(ResidualNet::new(hps, layout, Activation::Relu, vb).map_err(map_err)?)
        }
        Variant::Elu => {
            Box::new(ResidualNet::new(hps, layout, Activation::Elu, vb).map_err(map_err)?)
        }
        Variant::Full => Box::new(FullPreActNet::new(hps, layout, vb).map_err(map_err)?),
    };
    Ok(net)
}
