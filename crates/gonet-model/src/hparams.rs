//! Model hyperparameters.

use std::fmt;
use std::str::FromStr;

use gonet_core::GoNetError;
use serde::{Deserialize, Serialize};

/// Which optimizer drives the training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// Plain stochastic gradient descent.
    #[serde(rename = "sgd")]
    Sgd,
    /// SGD with classical momentum.
    #[default]
    #[serde(rename = "mom")]
    Momentum,
    /// Adam (no decoupled weight decay; L2 is part of the loss).
    #[serde(rename = "adam")]
    Adam,
}

impl OptimizerKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Sgd => "sgd",
            Self::Momentum => "mom",
            Self::Adam => "adam",
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for OptimizerKind {
    type Err = GoNetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sgd" => Ok(Self::Sgd),
            "mom" => Ok(Self::Momentum),
            "adam" => Ok(Self::Adam),
            other => Err(GoNetError::config(format!(
                "unknown optimizer '{other}'. Valid: sgd, mom, adam"
            ))),
        }
    }
}

/// Architecture and optimisation hyperparameters.
///
/// # Example
///
/// ```
/// use gonet_model::{HParams, OptimizerKind};
///
/// let hps = HParams {
///     filters: 8,
///     num_residual_units: 2,
///     optimizer: OptimizerKind::Adam,
///     ..HParams::default()
/// };
/// assert!(hps.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HParams {
    /// Residual blocks in the tower.
    pub num_residual_units: usize,
    /// Convolution filters per layer.
    pub filters: usize,
    /// Width of the hidden layer in the value head.
    pub value_hidden: usize,
    pub lrn_rate: f64,
    /// L2 coefficient applied to every `.weight` parameter.
    pub weight_decay_rate: f64,
    /// Momentum coefficient, used by [`OptimizerKind::Momentum`] only.
    pub momentum: f64,
    pub optimizer: OptimizerKind,
    /// Softmax temperature of move predictions.
    pub temperature: f64,
    /// Gradients are rescaled when their global norm exceeds this.
    pub global_norm: f64,
    /// Exponential decay of batch-norm running statistics.
    pub bn_decay: f64,
    pub bn_epsilon: f64,
}

impl Default for HParams {
    fn default() -> Self {
        Self {
            num_residual_units: 20,
            filters: 256,
            value_hidden: 256,
            lrn_rate: 0.1,
            weight_decay_rate: 1e-4,
            momentum: 0.9,
            optimizer: OptimizerKind::default(),
            temperature: 1.0,
            global_norm: 100.0,
            bn_decay: 0.9,
            bn_epsilon: 1e-5,
        }
    }
}

impl HParams {
    /// # Errors
    ///
    /// Returns [`GoNetError::Config`] for non-positive sizes, rates or
    /// temperature, or a decay outside `[0, 1)`.
    pub fn validate(&self) -> Result<(), GoNetError> {
        if self.filters == 0 || self.value_hidden == 0 {
            return Err(GoNetError::config("filters and value_hidden must be positive"));
        }
        if !(self.lrn_rate > 0.0) {
            return Err(GoNetError::config(format!(
                "lrn_rate must be positive, got {}",
                self.lrn_rate
            )));
        }
        if !(self.temperature > 0.0) {
            return Err(GoNetError::config(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if !(self.global_norm > 0.0) {
            return Err(GoNetError::config("global_norm must be positive"));
        }
        if self.weight_decay_rate < 0.0 || !(0.0..1.0).contains(&self.momentum) {
            return Err(GoNetError::config(
                "weight_decay_rate must be >= 0 and momentum in [0, 1)",
            ));
        }
        if !(0.0..1.0).contains(&self.bn_decay) || !(self.bn_epsilon > 0.0) {
            return Err(GoNetError::config(
                "bn_decay must be in [0, 1) and bn_epsilon positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let hps = HParams::default();
        assert!(hps.validate().is_ok());
        assert_eq!(hps.optimizer, OptimizerKind::Momentum);
    }

    #[test]
    fn optimizer_names_match_config_tags() {
        let hps: HParams = serde_json::from_str(r#"{"optimizer": "adam"}"#).unwrap();
        assert_eq!(hps.optimizer, OptimizerKind::Adam);
        assert_eq!("mom".parse::<OptimizerKind>().unwrap(), OptimizerKind::Momentum);
        assert!("rmsprop".parse::<OptimizerKind>().is_err());
    }

    #[test]
    fn rejects_zero_temperature() {
        let hps = HParams {
            temperature: 0.0,
            ..HParams::default()
        };
        assert!(matches!(hps.validate(), Err(GoNetError::Config { .. })));
    }
}
