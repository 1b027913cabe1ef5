//! Full pre-activation residual tower.
//!
//! Blocks normalise and activate before each convolution and add the skip
//! connection without a trailing activation; the tower ends with one more
//! BN + ReLU. The value head pools globally instead of using a hidden layer.

use candle_core::Tensor;
use candle_nn::{conv2d_no_bias, linear, Conv2d, Conv2dConfig, Linear, Module, VarBuilder};
use gonet_core::FeatureLayout;

use crate::hparams::HParams;
use crate::norm::{BatchNorm2d, PendingStat};
use crate::resnet::{to_nchw, ConvBn};
use crate::variant::PolicyValueNet;

struct PreActBlock {
    bn_a: BatchNorm2d,
    conv_a: Conv2d,
    bn_b: BatchNorm2d,
    conv_b: Conv2d,
}

impl PreActBlock {
    fn new(f: usize, hps: &HParams, vb: VarBuilder) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            bn_a: BatchNorm2d::new(f, hps.bn_decay, hps.bn_epsilon, vb.pp("a.bn"))?,
            conv_a: conv2d_no_bias(f, f, 3, cfg, vb.pp("a.conv"))?,
            bn_b: BatchNorm2d::new(f, hps.bn_decay, hps.bn_epsilon, vb.pp("b.bn"))?,
            conv_b: conv2d_no_bias(f, f, 3, cfg, vb.pp("b.conv"))?,
        })
    }

    fn forward_t(
        &self,
        x: &Tensor,
        train: bool,
        stats: &mut Vec<PendingStat>,
    ) -> candle_core::Result<Tensor> {
        let y = self.bn_a.forward_t(x, train, stats)?.relu()?;
        let y = self.conv_a.forward(&y)?;
        let y = self.bn_b.forward_t(&y, train, stats)?.relu()?;
        let y = self.conv_b.forward(&y)?;
        y + x
    }
}

pub struct FullPreActNet {
    stem: Conv2d,
    blocks: Vec<PreActBlock>,
    final_bn: BatchNorm2d,
    policy_conv: ConvBn,
    policy_fc: Linear,
    value_out: Linear,
}

impl FullPreActNet {
    pub fn new(hps: &HParams, layout: &FeatureLayout, vb: VarBuilder) -> candle_core::Result<Self> {
        let f = hps.filters;
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let stem = conv2d_no_bias(layout.channels, f, 3, cfg, vb.pp("stem.conv"))?;
        let blocks = (0..hps.num_residual_units)
            .map(|i| PreActBlock::new(f, hps, vb.pp(format!("res_{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let final_bn = BatchNorm2d::new(f, hps.bn_decay, hps.bn_epsilon, vb.pp("final.bn"))?;

        let points = layout.rows * layout.cols;
        let policy_conv = ConvBn::new(f, 2, 1, hps, vb.pp("policy"))?;
        let policy_fc = linear(2 * points, layout.classes, vb.pp("policy.fc"))?;
        let value_out = linear(f, 1, vb.pp("value.out"))?;

        Ok(Self {
            stem,
            blocks,
            final_bn,
            policy_conv,
            policy_fc,
            value_out,
        })
    }
}

impl PolicyValueNet for FullPreActNet {
    fn forward_t(
        &self,
        images: &Tensor,
        train: bool,
        stats: &mut Vec<PendingStat>,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let mut h = self.stem.forward(&to_nchw(images)?)?;
        for block in &self.blocks {
            h = block.forward_t(&h, train, stats)?;
        }
        let h = self.final_bn.forward_t(&h, train, stats)?.relu()?;

        let p = self.policy_conv.forward_t(&h, train, stats)?.relu()?;
        let logits = self.policy_fc.forward(&p.flatten_from(1)?)?;

        // [N, C, H, W] -> [N, C]
        let pooled = h.mean(3)?.mean(2)?;
        let value = self.value_out.forward(&pooled)?.tanh()?;

        Ok((logits, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn value_head_pools_over_the_board() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let hps = HParams {
            num_residual_units: 1,
            filters: 6,
            ..HParams::default()
        };
        let layout = FeatureLayout {
            rows: 5,
            cols: 5,
            channels: 17,
            classes: 26,
        };
        FullPreActNet::new(&hps, &layout, vb).unwrap();

        let data = var_map.data().lock().unwrap();
        assert_eq!(data["value.out.weight"].as_tensor().dims(), &[1, 6]);
        assert!(data.contains_key("final.bn.running_mean"));
        assert!(!data.contains_key("value.fc.weight"));
    }
}
