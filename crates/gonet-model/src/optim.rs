//! Optimizers selectable through [`OptimizerKind`].
//!
//! `sgd` and `adam` are the candle-nn implementations; `mom` is classical
//! momentum (`v = mu * v + g; w -= lr * v`), which candle-nn does not ship.

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};

use crate::hparams::{HParams, OptimizerKind};

/// Configuration of [`Momentum`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsMomentum {
    pub lr: f64,
    pub momentum: f64,
}

/// SGD with a velocity slot per variable.
#[derive(Debug)]
pub struct Momentum {
    vars: Vec<(Var, Var)>,
    params: ParamsMomentum,
}

impl Optimizer for Momentum {
    type Config = ParamsMomentum;

    fn new(vars: Vec<Var>, params: ParamsMomentum) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let velocity = Var::from_tensor(&var.zeros_like()?)?;
                Ok((var, velocity))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        for (var, velocity) in &self.vars {
            if let Some(g) = grads.get(var) {
                let v = ((velocity.as_tensor() * self.params.momentum)? + g)?;
                var.set(&var.sub(&(&v * self.params.lr)?)?)?;
                velocity.set(&v)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// The optimizer behind a model handle.
pub enum GoOptimizer {
    Sgd(SGD),
    Momentum(Momentum),
    Adam(AdamW),
}

impl GoOptimizer {
    /// Creates the optimizer selected by `hps` over `vars`.
    pub fn new(hps: &HParams, vars: Vec<Var>) -> candle_core::Result<Self> {
        Ok(match hps.optimizer {
            OptimizerKind::Sgd => Self::Sgd(SGD::new(vars, hps.lrn_rate)?),
            OptimizerKind::Momentum => Self::Momentum(Momentum::new(
                vars,
                ParamsMomentum {
                    lr: hps.lrn_rate,
                    momentum: hps.momentum,
                },
            )?),
            OptimizerKind::Adam => Self::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: hps.lrn_rate,
                    weight_decay: 0.0,
                    ..ParamsAdamW::default()
                },
            )?),
        })
    }

    pub fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        match self {
            Self::Sgd(o) => o.step(grads),
            Self::Momentum(o) => o.step(grads),
            Self::Adam(o) => o.step(grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Sgd(o) => o.learning_rate(),
            Self::Momentum(o) => o.learning_rate(),
            Self::Adam(o) => o.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::Sgd(o) => o.set_learning_rate(lr),
            Self::Momentum(o) => o.set_learning_rate(lr),
            Self::Adam(o) => o.set_learning_rate(lr),
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        match self {
            Self::Sgd(_) => OptimizerKind::Sgd,
            Self::Momentum(_) => OptimizerKind::Momentum,
            Self::Adam(_) => OptimizerKind::Adam,
        }
    }
}

/// Global L2 norm over the gradients of `vars`. Missing gradients count as zero.
pub fn global_grad_norm(vars: &[Var], grads: &GradStore) -> candle_core::Result<f32> {
    let mut total = 0f32;
    for var in vars {
        if let Some(g) = grads.get(var) {
            total += g.sqr()?.sum_all()?.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
        }
    }
    Ok(total.sqrt())
}

/// Rescales every gradient of `vars` by `scale` in place.
pub fn scale_grads(vars: &[Var], grads: &mut GradStore, scale: f64) -> candle_core::Result<()> {
    for var in vars {
        if let Some(g) = grads.get(var) {
            let scaled = (g * scale)?;
            grads.insert(var, scaled);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn quadratic_grads(w: &Var) -> GradStore {
        // d/dw sum(w^2) = 2w
        w.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap()
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let w = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut opt = Momentum::new(
            vec![w.clone()],
            ParamsMomentum {
                lr: 0.1,
                momentum: 0.5,
            },
        )
        .unwrap();

        opt.step(&quadratic_grads(&w)).unwrap();
        // v = 2.0, w = 1 - 0.2
        let w1 = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((w1 - 0.8).abs() < 1e-6);

        opt.step(&quadratic_grads(&w)).unwrap();
        // v = 0.5 * 2.0 + 1.6 = 2.6, w = 0.8 - 0.26
        let w2 = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((w2 - 0.54).abs() < 1e-5);
    }

    #[test]
    fn momentum_skips_integer_vars() {
        let step = Var::zeros((), DType::I64, &Device::Cpu).unwrap();
        let opt = Momentum::new(
            vec![step],
            ParamsMomentum {
                lr: 0.1,
                momentum: 0.9,
            },
        )
        .unwrap();
        assert!(opt.vars.is_empty());
    }

    #[test]
    fn every_kind_builds_and_reports_rate() {
        for kind in [OptimizerKind::Sgd, OptimizerKind::Momentum, OptimizerKind::Adam] {
            let w = Var::new(&[1.0f32, -1.0], &Device::Cpu).unwrap();
            let hps = HParams {
                optimizer: kind,
                lrn_rate: 0.05,
                ..HParams::default()
            };
            let mut opt = GoOptimizer::new(&hps, vec![w.clone()]).unwrap();
            assert_eq!(opt.kind(), kind);
            assert_eq!(opt.learning_rate(), 0.05);
            opt.set_learning_rate(0.01);
            assert_eq!(opt.learning_rate(), 0.01);
            opt.step(&quadratic_grads(&w)).unwrap();
            let after = w.as_tensor().to_vec1::<f32>().unwrap();
            assert!(after[0] < 1.0 && after[1] > -1.0, "{kind}");
        }
    }

    #[test]
    fn clipping_rescales_to_requested_norm() {
        let w = Var::new(&[3.0f32, 4.0], &Device::Cpu).unwrap();
        let mut grads = quadratic_grads(&w);
        let vars = vec![w.clone()];
        let norm = global_grad_norm(&vars, &grads).unwrap();
        assert!((norm - 10.0).abs() < 1e-5);

        scale_grads(&vars, &mut grads, 0.1).unwrap();
        let clipped = global_grad_norm(&vars, &grads).unwrap();
        assert!((clipped - 1.0).abs() < 1e-5);
    }
}
