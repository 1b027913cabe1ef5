//! Post-activation residual tower with policy and value heads.
//!
//! Architecture (NCHW internally):
//! Input → ConvBn(3×3) → act → [ConvBn → act → ConvBn → +skip → act] × N
//! → policy: ConvBn(1×1, 2) → act → Linear(classes)
//! → value:  ConvBn(1×1, 1) → act → Linear(hidden) → act → Linear(1) → tanh

use candle_core::Tensor;
use candle_nn::{conv2d_no_bias, linear, Conv2d, Conv2dConfig, Linear, Module, VarBuilder};
use gonet_core::FeatureLayout;

use crate::hparams::HParams;
use crate::norm::{BatchNorm2d, PendingStat};
use crate::variant::PolicyValueNet;

/// Nonlinearity used throughout a tower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Elu,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Relu => x.relu(),
            Self::Elu => x.elu(1.0),
        }
    }
}

/// Convolution without bias followed by batch normalisation.
#[derive(Debug, Clone)]
pub(crate) struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm2d,
}

impl ConvBn {
    pub(crate) fn new(
        in_c: usize,
        out_c: usize,
        kernel: usize,
        hps: &HParams,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig {
            padding: kernel / 2,
            ..Default::default()
        };
        let conv = conv2d_no_bias(in_c, out_c, kernel, cfg, vb.pp("conv"))?;
        let bn = BatchNorm2d::new(out_c, hps.bn_decay, hps.bn_epsilon, vb.pp("bn"))?;
        Ok(Self { conv, bn })
    }

    pub(crate) fn forward_t(
        &self,
        x: &Tensor,
        train: bool,
        stats: &mut Vec<PendingStat>,
    ) -> candle_core::Result<Tensor> {
        let y = self.conv.forward(x)?;
        self.bn.forward_t(&y, train, stats)
    }
}

/// NHWC feed to NCHW.
pub(crate) fn to_nchw(images: &Tensor) -> candle_core::Result<Tensor> {
    images.permute((0, 3, 1, 2))?.contiguous()
}

struct ResBlock {
    first: ConvBn,
    second: ConvBn,
}

/// The AlphaGo Zero tower; [`Activation`] selects the original or ELU form.
pub struct ResidualNet {
    stem: ConvBn,
    blocks: Vec<ResBlock>,
    policy_conv: ConvBn,
    policy_fc: Linear,
    value_conv: ConvBn,
    value_fc: Linear,
    value_out: Linear,
    act: Activation,
}

impl ResidualNet {
    pub fn new(
        hps: &HParams,
        layout: &FeatureLayout,
        act: Activation,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let f = hps.filters;
        let points = layout.rows * layout.cols;

        let stem = ConvBn::new(layout.channels, f, 3, hps, vb.pp("stem"))?;
        let mut blocks = Vec::with_capacity(hps.num_residual_units);
        for i in 0..hps.num_residual_units {
            let prefix = format!("res_{i}");
            blocks.push(ResBlock {
                first: ConvBn::new(f, f, 3, hps, vb.pp(format!("{prefix}.a")))?,
                second: ConvBn::new(f, f, 3, hps, vb.pp(format!("{prefix}.b")))?,
            });
        }

        let policy_conv = ConvBn::new(f, 2, 1, hps, vb.pp("policy"))?;
        let policy_fc = linear(2 * points, layout.classes, vb.pp("policy.fc"))?;
        let value_conv = ConvBn::new(f, 1, 1, hps, vb.pp("value"))?;
        let value_fc = linear(points, hps.value_hidden, vb.pp("value.fc"))?;
        let value_out = linear(hps.value_hidden, 1, vb.pp("value.out"))?;

        Ok(Self {
            stem,
            blocks,
            policy_conv,
            policy_fc,
            value_conv,
            value_fc,
            value_out,
            act,
        })
    }
}

impl PolicyValueNet for ResidualNet {
    fn forward_t(
        &self,
        images: &Tensor,
        train: bool,
        stats: &mut Vec<PendingStat>,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let x = to_nchw(images)?;
        let mut h = self.act.apply(&self.stem.forward_t(&x, train, stats)?)?;

        for block in &self.blocks {
            let y = self.act.apply(&block.first.forward_t(&h, train, stats)?)?;
            let y = block.second.forward_t(&y, train, stats)?;
            h = self.act.apply(&(y + &h)?)?;
        }

        let p = self.act.apply(&self.policy_conv.forward_t(&h, train, stats)?)?;
        let logits = self.policy_fc.forward(&p.flatten_from(1)?)?;

        let v = self.act.apply(&self.value_conv.forward_t(&h, train, stats)?)?;
        let v = self.act.apply(&self.value_fc.forward(&v.flatten_from(1)?)?)?;
        let value = self.value_out.forward(&v)?.tanh()?;

        Ok((logits, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn parameter_names_follow_layer_paths() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let hps = HParams {
            num_residual_units: 2,
            filters: 4,
            value_hidden: 8,
            ..HParams::default()
        };
        let layout = FeatureLayout {
            rows: 5,
            cols: 5,
            channels: 17,
            classes: 26,
        };
        ResidualNet::new(&hps, &layout, Activation::Relu, vb).unwrap();

        let data = var_map.data().lock().unwrap();
        for name in [
            "stem.conv.weight",
            "stem.bn.gamma",
            "res_1.b.bn.running_var",
            "policy.conv.weight",
            "policy.fc.bias",
            "value.fc.weight",
            "value.out.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert_eq!(data["policy.fc.weight"].as_tensor().dims(), &[26, 50]);
    }

    #[test]
    fn elu_differs_from_relu_on_negatives() {
        let x = Tensor::new(&[-1.0f32, 0.0, 2.0], &Device::Cpu).unwrap();
        let relu = Activation::Relu.apply(&x).unwrap().to_vec1::<f32>().unwrap();
        let elu = Activation::Elu.apply(&x).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(relu, vec![0.0, 0.0, 2.0]);
        assert!(elu[0] < 0.0);
        assert_eq!(elu[2], 2.0);
    }
}
