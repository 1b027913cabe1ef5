//! # gonet-model
//!
//! Residual policy-value networks for 19×19 Go and the [`ModelHandle`]
//! that exposes them to the executor.
//!
//! ## Variants
//!
//! - [`Variant::Original`]: AlphaGo Zero tower, ReLU
//! - [`Variant::Elu`]: the same tower with ELU
//! - [`Variant::Full`]: full pre-activation tower, pooled value head
//!
//! All variants take NHWC feature planes and return policy logits plus a
//! tanh value. They are built through a `candle_nn::VarBuilder`, so every
//! parameter lives in one `VarMap` that the checkpoint saver reads.
//!
//! ## Example
//!
//! ```
//! use candle_core::Device;
//! use candle_nn::VarMap;
//! use gonet_core::{RunConfig, Variant};
//! use gonet_model::{HParams, ModelHandle};
//!
//! let config = RunConfig { img_rows: 5, img_cols: 5, num_classes: 26, ..RunConfig::default() };
//! let hps = HParams { filters: 4, num_residual_units: 1, value_hidden: 8, ..HParams::default() };
//! let var_map = VarMap::new();
//! let handle = ModelHandle::new(Variant::Elu, &hps, &config.layout(), &var_map, &Device::Cpu).unwrap();
//! assert_eq!(handle.global_step().unwrap(), 0);
//! ```

pub mod full;
pub mod handle;
pub mod hparams;
pub mod norm;
pub mod optim;
pub mod resnet;
pub mod summary;
pub mod variant;

pub use gonet_core::Variant;
pub use handle::{
    is_bn_statistic, is_checkpointed, is_optimizer_slot, is_trainable, named_vars, Controls,
    ModelHandle, GLOBAL_STEP, REQUIRED_VARS,
};
pub use hparams::{HParams, OptimizerKind};
pub use norm::{BatchNorm2d, PendingStat};
pub use optim::{GoOptimizer, Momentum, ParamsMomentum};
pub use summary::Summary;
pub use variant::{build_net, PolicyValueNet};
