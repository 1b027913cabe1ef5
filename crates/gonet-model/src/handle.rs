//! The model handle: every named element the executor and loops rely on.
//!
//! A [`ModelHandle`] wraps a [`PolicyValueNet`] together with the variable
//! map it was built in and provides the complete contract:
//!
//! - forward pass to move probabilities and value estimates
//! - loss (policy cross-entropy, value MSE, L2), move accuracy and
//!   outcome accuracy
//! - one optimisation step with gradient clipping and a norm diagnostic
//! - the `global_step` counter and its explicit increment
//! - the learning rate
//!
//! ## Variable naming
//!
//! Parameter names are the `VarBuilder` paths (`res_0.a.conv.weight`,
//! `policy.fc.bias`, ...). Batch-norm running statistics end in
//! `running_mean` / `running_var`. The step counter is `global_step`.
//!
//! ## Failure semantics
//!
//! [`ModelHandle::train_step`] checks the loss and the gradient norm before
//! anything is written. A non-finite value returns
//! [`GoNetError::NumericInstability`] with parameters, batch-norm
//! statistics and the optimizer state exactly as they were.

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{Init, VarBuilder, VarMap};
use gonet_core::{Batch, FeatureLayout, GoNetError, Variant};

use crate::hparams::HParams;
use crate::norm::{PendingStat, RUNNING_MEAN, RUNNING_VAR};
use crate::optim::{global_grad_norm, scale_grads, GoOptimizer};
use crate::summary::Summary;
use crate::variant::{build_net, PolicyValueNet};

/// Name of the step counter variable.
pub const GLOBAL_STEP: &str = "global_step";

/// Variables every variant must create.
pub const REQUIRED_VARS: [&str; 3] = [GLOBAL_STEP, "policy.fc.weight", "value.out.weight"];

/// Returns true for batch-norm running statistics.
pub fn is_bn_statistic(name: &str) -> bool {
    name.ends_with(RUNNING_MEAN) || name.ends_with(RUNNING_VAR)
}

/// Returns true for optimizer-internal slot variables.
pub fn is_optimizer_slot(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("adam") || lower.contains("momentum")
}

/// Returns true for variables updated by the optimizer.
pub fn is_trainable(name: &str) -> bool {
    name != GLOBAL_STEP && !is_bn_statistic(name) && !is_optimizer_slot(name)
}

/// Returns true for variables written to and read from checkpoints.
pub fn is_checkpointed(name: &str) -> bool {
    !is_optimizer_slot(name)
}

/// All variables of `var_map`, sorted by name.
///
/// # Errors
///
/// Returns [`GoNetError::Internal`] if the map's lock is poisoned.
pub fn named_vars(var_map: &VarMap) -> Result<Vec<(String, Var)>, GoNetError> {
    let data = var_map.data().lock().map_err(|e| GoNetError::Internal {
        message: format!("variable map lock poisoned: {e}"),
    })?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Per-call control inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Controls {
    /// Batch-norm uses batch statistics when set.
    pub training: bool,
    /// Softmax temperature for move probabilities.
    pub temperature: f64,
    /// Sign applied to the policy loss (+1 imitation, -1 to push away).
    pub reinforce_dir: f64,
    /// Cross-entropy against the argmax label instead of the full target.
    pub use_sparse: bool,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            training: false,
            temperature: 1.0,
            reinforce_dir: 1.0,
            use_sparse: true,
        }
    }
}

struct LossTerms {
    cost: Tensor,
    move_accuracy: Tensor,
    outcome_accuracy: Tensor,
}

/// A built network plus its variables, optimizer and step counter.
pub struct ModelHandle {
    net: Box<dyn PolicyValueNet>,
    var_map: VarMap,
    trainable: Vec<Var>,
    decayed: Vec<Var>,
    global_step: Var,
    optimizer: GoOptimizer,
    hps: HParams,
    variant: Variant,
    device: Device,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ModelHandle({}, {} trainable tensors, optimizer={}, device={:?})",
            self.variant,
            self.trainable.len(),
            self.optimizer.kind(),
            self.device
        )
    }
}

impl ModelHandle {
    /// Builds `variant` inside `var_map`.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Config`] for invalid hyperparameters,
    /// [`GoNetError::Contract`] if a required variable is missing, and
    /// [`GoNetError::Internal`] if parameter creation fails.
    pub fn new(
        variant: Variant,
        hps: &HParams,
        layout: &FeatureLayout,
        var_map: &VarMap,
        device: &Device,
    ) -> Result<Self, GoNetError> {
        hps.validate()?;
        let vb = VarBuilder::from_varmap(var_map, DType::F32, device);
        let net = build_net(variant, hps, layout, vb)?;
        Self::with_net(variant, net, hps, var_map, device)
    }

    /// Wraps an already built network whose parameters live in `var_map`.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Contract`] if `var_map` lacks any of
    /// [`REQUIRED_VARS`] after the step counter is created.
    pub fn with_net(
        variant: Variant,
        net: Box<dyn PolicyValueNet>,
        hps: &HParams,
        var_map: &VarMap,
        device: &Device,
    ) -> Result<Self, GoNetError> {
        let map_err = |e: candle_core::Error| GoNetError::Internal {
            message: format!("ModelHandle new: {e}"),
        };

        let step = var_map
            .get((), GLOBAL_STEP, Init::Const(0.0), DType::I64, device)
            .map_err(map_err)?;
        let global_step = Var::from_tensor(&step).map_err(map_err)?;

        let named = named_vars(var_map)?;
        for required in REQUIRED_VARS {
            if !named.iter().any(|(name, _)| name == required) {
                return Err(GoNetError::Contract {
                    name: required.to_string(),
                });
            }
        }

        let trainable: Vec<Var> = named
            .iter()
            .filter(|(name, _)| is_trainable(name))
            .map(|(_, var)| var.clone())
            .collect();
        let decayed: Vec<Var> = named
            .iter()
            .filter(|(name, _)| is_trainable(name) && name.ends_with(".weight"))
            .map(|(_, var)| var.clone())
            .collect();
        let optimizer = GoOptimizer::new(hps, trainable.clone()).map_err(map_err)?;

        tracing::debug!(
            %variant,
            trainable = trainable.len(),
            optimizer = %hps.optimizer,
            "model handle ready"
        );

        Ok(Self {
            net,
            var_map: var_map.clone(),
            trainable,
            decayed,
            global_step,
            optimizer,
            hps: hps.clone(),
            variant,
            device: device.clone(),
        })
    }

    fn losses(
        &self,
        logits: &Tensor,
        value: &Tensor,
        batch: &Batch,
        controls: &Controls,
    ) -> candle_core::Result<LossTerms> {
        let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
        let policy = if controls.use_sparse {
            let target = batch.move_probs.argmax_keepdim(D::Minus1)?;
            log_probs.gather(&target, D::Minus1)?.neg()?.mean_all()?
        } else {
            (&batch.move_probs * &log_probs)?
                .sum(D::Minus1)?
                .neg()?
                .mean_all()?
        };
        let policy = (policy * controls.reinforce_dir)?;
        let value_loss = (value - &batch.outcomes)?.sqr()?.mean_all()?;

        let mut l2 = Tensor::zeros((), DType::F32, &self.device)?;
        for w in &self.decayed {
            l2 = (l2 + w.sqr()?.sum_all()?)?;
        }
        let l2 = (l2 * (0.5 * self.hps.weight_decay_rate))?;
        let cost = ((policy + value_loss)? + l2)?;

        let predicted = logits.argmax(D::Minus1)?;
        let expected = batch.move_probs.argmax(D::Minus1)?;
        let move_accuracy = predicted.eq(&expected)?.to_dtype(DType::F32)?.mean_all()?;

        let zeros = value.zeros_like()?;
        let value_sign = value.ge(&zeros)?;
        let outcome_sign = batch.outcomes.ge(&zeros)?;
        let outcome_accuracy = value_sign
            .eq(&outcome_sign)?
            .to_dtype(DType::F32)?
            .mean_all()?;

        Ok(LossTerms {
            cost,
            move_accuracy,
            outcome_accuracy,
        })
    }

    fn summarize(
        &self,
        terms: &LossTerms,
        controls: &Controls,
        grad_norm: Option<f32>,
    ) -> candle_core::Result<Summary> {
        Ok(Summary {
            loss: terms.cost.to_scalar::<f32>()?,
            move_accuracy: terms.move_accuracy.to_scalar::<f32>()?,
            outcome_accuracy: terms.outcome_accuracy.to_scalar::<f32>()?,
            learning_rate: self.optimizer.learning_rate(),
            temperature: controls.temperature,
            grad_norm,
        })
    }

    /// Runs one optimisation step on a preprocessed batch.
    ///
    /// The global step is not advanced; call
    /// [`increase_global_step`](Self::increase_global_step) after recording
    /// the returned summary.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::NumericInstability`] if the loss or the
    /// gradient norm is not finite; nothing is updated in that case.
    pub fn train_step(&mut self, batch: &Batch, controls: &Controls) -> Result<Summary, GoNetError> {
        let map_err = |e: candle_core::Error| GoNetError::Internal {
            message: format!("ModelHandle train_step: {e}"),
        };

        let mut stats: Vec<PendingStat> = Vec::new();
        let (logits, value) = self
            .net
            .forward_t(&batch.features, controls.training, &mut stats)
            .map_err(map_err)?;
        let terms = self
            .losses(&logits, &value, batch, controls)
            .map_err(map_err)?;

        let loss = terms.cost.to_scalar::<f32>().map_err(map_err)?;
        if !loss.is_finite() {
            return Err(GoNetError::NumericInstability {
                message: format!("loss is {loss}"),
            });
        }

        let mut grads = terms.cost.backward().map_err(map_err)?;
        let norm = global_grad_norm(&self.trainable, &grads).map_err(map_err)?;
        if !norm.is_finite() {
            return Err(GoNetError::NumericInstability {
                message: format!("gradient norm is {norm}"),
            });
        }
        if f64::from(norm) > self.hps.global_norm {
            let scale = self.hps.global_norm / f64::from(norm);
            scale_grads(&self.trainable, &mut grads, scale).map_err(map_err)?;
        }

        self.optimizer.step(&grads).map_err(map_err)?;
        for stat in &stats {
            stat.apply().map_err(map_err)?;
        }

        self.summarize(&terms, controls, Some(norm)).map_err(map_err)
    }

    /// Computes loss and accuracies without touching any variable.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Internal`] if a tensor operation fails.
    pub fn evaluate(&self, batch: &Batch, controls: &Controls) -> Result<Summary, GoNetError> {
        let map_err = |e: candle_core::Error| GoNetError::Internal {
            message: format!("ModelHandle evaluate: {e}"),
        };
        let mut discarded = Vec::new();
        let (logits, value) = self
            .net
            .forward_t(&batch.features, controls.training, &mut discarded)
            .map_err(map_err)?;
        let terms = self
            .losses(&logits, &value, batch, controls)
            .map_err(map_err)?;
        self.summarize(&terms, controls, None).map_err(map_err)
    }

    /// Inference forward pass on remapped feature planes.
    ///
    /// Returns `(move_probs [N, classes], value [N, 1])`; the move
    /// distribution is `softmax(logits / temperature)`.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Internal`] if a tensor operation fails.
    pub fn predict(&self, images: &Tensor, temperature: f64) -> Result<(Tensor, Tensor), GoNetError> {
        let map_err = |e: candle_core::Error| GoNetError::Internal {
            message: format!("ModelHandle predict: {e}"),
        };
        let mut discarded = Vec::new();
        let (logits, value) = self
            .net
            .forward_t(images, false, &mut discarded)
            .map_err(map_err)?;
        let scaled = (logits / temperature).map_err(map_err)?;
        let probs = candle_nn::ops::softmax(&scaled, D::Minus1).map_err(map_err)?;
        Ok((probs, value))
    }

    /// Current value of the step counter.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Internal`] if the counter cannot be read.
    pub fn global_step(&self) -> Result<i64, GoNetError> {
        self.global_step
            .as_tensor()
            .to_scalar::<i64>()
            .map_err(|e| GoNetError::Internal {
                message: format!("reading global_step: {e}"),
            })
    }

    /// Advances the step counter by one and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Internal`] if the counter cannot be written.
    pub fn increase_global_step(&self) -> Result<i64, GoNetError> {
        let next = self.global_step()? + 1;
        let value = Tensor::new(next, &self.device).map_err(|e| GoNetError::Internal {
            message: format!("increasing global_step: {e}"),
        })?;
        self.global_step
            .set(&value)
            .map_err(|e| GoNetError::Internal {
                message: format!("increasing global_step: {e}"),
            })?;
        Ok(next)
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    /// Variables persisted by checkpoints, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Internal`] if the variable map is poisoned.
    pub fn checkpoint_vars(&self) -> Result<Vec<(String, Var)>, GoNetError> {
        Ok(named_vars(&self.var_map)?
            .into_iter()
            .filter(|(name, _)| is_checkpointed(name))
            .collect())
    }

    /// Number of scalars across all checkpointed variables.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Internal`] if the variable map is poisoned.
    pub fn total_parameters(&self) -> Result<usize, GoNetError> {
        Ok(self
            .checkpoint_vars()?
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum())
    }

    pub fn hps(&self) -> &HParams {
        &self.hps
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
