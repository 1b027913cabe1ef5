//! Batch normalisation over NCHW feature maps.
//!
//! Training mode normalises with the batch statistics; inference mode uses
//! the running averages. Running averages are not written during the
//! forward pass: each training forward pushes a [`PendingStat`] per
//! statistic, and the caller applies them only once the optimisation step
//! has succeeded. A step skipped for numeric reasons therefore leaves the
//! statistics untouched.

use candle_core::{Tensor, Var};
use candle_nn::{Init, VarBuilder};

/// Parameter names of the running statistics.
pub const RUNNING_MEAN: &str = "running_mean";
pub const RUNNING_VAR: &str = "running_var";

/// A running-statistic update waiting to be committed.
#[derive(Debug, Clone)]
pub struct PendingStat {
    var: Var,
    value: Tensor,
}

impl PendingStat {
    /// Writes the new running average into its variable.
    pub fn apply(&self) -> candle_core::Result<()> {
        self.var.set(&self.value)
    }
}

/// Per-channel batch normalisation with learnable scale and shift.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    gamma: Tensor,
    beta: Tensor,
    running_mean: Var,
    running_var: Var,
    channels: usize,
    decay: f64,
    eps: f64,
}

impl BatchNorm2d {
    pub fn new(channels: usize, decay: f64, eps: f64, vb: VarBuilder) -> candle_core::Result<Self> {
        let gamma = vb.get_with_hints(channels, "gamma", Init::Const(1.0))?;
        let beta = vb.get_with_hints(channels, "beta", Init::Const(0.0))?;
        // Tensors handed out by a VarMap are variables, so these share storage
        // with the map entries and `set` is visible to the checkpoint saver.
        let running_mean =
            Var::from_tensor(&vb.get_with_hints(channels, RUNNING_MEAN, Init::Const(0.0))?)?;
        let running_var =
            Var::from_tensor(&vb.get_with_hints(channels, RUNNING_VAR, Init::Const(1.0))?)?;
        Ok(Self {
            gamma,
            beta,
            running_mean,
            running_var,
            channels,
            decay,
            eps,
        })
    }

    /// Normalises `x` of shape `[N, C, H, W]`.
    pub fn forward_t(
        &self,
        x: &Tensor,
        train: bool,
        stats: &mut Vec<PendingStat>,
    ) -> candle_core::Result<Tensor> {
        let c = self.channels;
        let (mean, var) = if train {
            let mean = x.mean_keepdim(0)?.mean_keepdim(2)?.mean_keepdim(3)?;
            let var = x
                .broadcast_sub(&mean)?
                .sqr()?
                .mean_keepdim(0)?
                .mean_keepdim(2)?
                .mean_keepdim(3)?;

            let batch_mean = mean.flatten_all()?.detach();
            let batch_var = var.flatten_all()?.detach();
            let new_mean = ((self.running_mean.as_tensor() * self.decay)?
                + (batch_mean * (1.0 - self.decay))?)?;
            let new_var = ((self.running_var.as_tensor() * self.decay)?
                + (batch_var * (1.0 - self.decay))?)?;
            stats.push(PendingStat {
                var: self.running_mean.clone(),
                value: new_mean,
            });
            stats.push(PendingStat {
                var: self.running_var.clone(),
                value: new_var,
            });
            (mean, var)
        } else {
            (
                self.running_mean.as_tensor().reshape((1, c, 1, 1))?,
                self.running_var.as_tensor().reshape((1, c, 1, 1))?,
            )
        };

        let std = (var + self.eps)?.sqrt()?;
        let normed = x.broadcast_sub(&mean)?.broadcast_div(&std)?;
        normed
            .broadcast_mul(&self.gamma.reshape((1, c, 1, 1))?)?
            .broadcast_add(&self.beta.reshape((1, c, 1, 1))?)
    }
}
