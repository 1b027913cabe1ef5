//! Run and session configuration.
//!
//! Every struct here has a `Default` and a `serde` derive with
//! `#[serde(default)]`, so a JSON file only needs the fields it overrides.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::batch::FeatureLayout;
use crate::error::GoNetError;
use crate::{BOARD_SIZE, NUM_FEATURE_PLANES, NUM_MOVES};

/// Selectable residual network architecture.
///
/// # Example
///
/// ```
/// use gonet_core::Variant;
///
/// let v: Variant = "elu".parse().unwrap();
/// assert_eq!(v, Variant::Elu);
/// assert_eq!(v.tag(), "elu");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// AlphaGo Zero residual tower with ReLU activations.
    #[default]
    Original,
    /// The same tower with ELU activations.
    Elu,
    /// Full pre-activation residual tower with a pooled value head.
    Full,
}

impl Variant {
    /// Short tag used in configuration files and checkpoint paths.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Elu => "elu",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Variant {
    type Err = GoNetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "original" => Ok(Self::Original),
            "elu" => Ok(Self::Elu),
            "full" => Ok(Self::Full),
            other => Err(GoNetError::config(format!(
                "unknown model variant '{other}'. Valid: original, elu, full"
            ))),
        }
    }
}

/// Whether placeholders carry a fixed batch dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Every fed batch must have exactly `batch_size` examples.
    #[default]
    Train,
    /// The batch dimension is unbound (self-play queues, evaluation).
    Inference,
}

impl FromStr for Mode {
    type Err = GoNetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Self::Train),
            "inference" => Ok(Self::Inference),
            other => Err(GoNetError::config(format!(
                "unknown mode '{other}'. Valid: train, inference"
            ))),
        }
    }
}

/// Device and thread-pool settings, fixed for the executor's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Threads available to a single forward/backward pass.
    pub intra_op_threads: usize,
    /// Threads used to run replicas side by side.
    pub inter_op_threads: usize,
    /// Fraction of device memory the session may claim.
    pub memory_fraction: f32,
    /// Place the graph on CUDA device 0 when available, else on the CPU.
    pub allow_gpu: bool,
    /// Number of replicas a bulk inference batch is split across.
    pub num_replicas: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            intra_op_threads: 4,
            inter_op_threads: 4,
            memory_fraction: 0.4,
            allow_gpu: true,
            num_replicas: 1,
        }
    }
}

impl SessionConfig {
    /// # Errors
    ///
    /// Returns [`GoNetError::Config`] for zero thread or replica counts and
    /// for a memory fraction outside `(0, 1]`.
    pub fn validate(&self) -> Result<(), GoNetError> {
        if self.intra_op_threads == 0 || self.inter_op_threads == 0 {
            return Err(GoNetError::config("thread counts must be positive"));
        }
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(GoNetError::config(format!(
                "memory_fraction must be in (0, 1], got {}",
                self.memory_fraction
            )));
        }
        if self.num_replicas == 0 {
            return Err(GoNetError::config("num_replicas must be positive"));
        }
        Ok(())
    }
}

/// Everything the executor needs besides the model hyperparameters.
///
/// # Example
///
/// ```
/// use gonet_core::{Mode, RunConfig, Variant};
///
/// let config = RunConfig {
///     model: Variant::Full,
///     mode: Mode::Inference,
///     ..RunConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// assert!(config.checkpoint_dir().ends_with("full"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Examples per training/evaluation batch.
    pub batch_size: usize,
    /// Passes over the training source per `train` call.
    pub num_epoch: usize,
    pub img_rows: usize,
    pub img_cols: usize,
    pub img_channels: usize,
    /// Width of the move-probability target (board points plus pass).
    pub num_classes: usize,
    /// Architecture to build.
    pub model: Variant,
    pub mode: Mode,
    /// Checkpoint directory to restore from at construction, if any.
    pub load_model_path: Option<PathBuf>,
    /// Root under which `<run_tag>/model-<tag>.ckpt-<step>` files are written.
    pub save_root: PathBuf,
    /// Subdirectory name for saved checkpoints; defaults to the variant tag.
    pub run_tag: Option<String>,
    /// Number of checkpoints kept before the oldest is deleted.
    pub max_to_keep: usize,
    pub train_log_dir: PathBuf,
    pub test_log_dir: PathBuf,
    pub session: SessionConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_epoch: 1,
            img_rows: BOARD_SIZE,
            img_cols: BOARD_SIZE,
            img_channels: NUM_FEATURE_PLANES,
            num_classes: NUM_MOVES,
            model: Variant::default(),
            mode: Mode::default(),
            load_model_path: None,
            save_root: PathBuf::from("./savedmodels"),
            run_tag: None,
            max_to_keep: 10,
            train_log_dir: PathBuf::from("./train_log"),
            test_log_dir: PathBuf::from("./test_log"),
            session: SessionConfig::default(),
        }
    }
}

impl RunConfig {
    /// # Errors
    ///
    /// Returns [`GoNetError::Config`] if any size is zero, if the channel
    /// count differs from the 17-plane feature layout, or if the session
    /// settings are invalid.
    pub fn validate(&self) -> Result<(), GoNetError> {
        if self.batch_size == 0 {
            return Err(GoNetError::config("batch_size must be positive"));
        }
        if self.img_rows == 0 || self.img_cols == 0 || self.num_classes == 0 {
            return Err(GoNetError::config(
                "image dimensions and class count must be positive",
            ));
        }
        if self.img_channels != NUM_FEATURE_PLANES {
            return Err(GoNetError::config(format!(
                "img_channels must be {NUM_FEATURE_PLANES}, got {}",
                self.img_channels
            )));
        }
        if self.max_to_keep == 0 {
            return Err(GoNetError::config("max_to_keep must be positive"));
        }
        self.session.validate()
    }

    /// Feature layout expected by the preprocessor and the model.
    pub fn layout(&self) -> FeatureLayout {
        FeatureLayout {
            rows: self.img_rows,
            cols: self.img_cols,
            channels: self.img_channels,
            classes: self.num_classes,
        }
    }

    /// Directory checkpoints of this run are written to.
    pub fn checkpoint_dir(&self) -> PathBuf {
        let tag = self.run_tag.as_deref().unwrap_or(self.model.tag());
        self.save_root.join(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.layout().classes, 362);
        assert_eq!(config.checkpoint_dir(), PathBuf::from("./savedmodels/original"));
    }

    #[test]
    fn run_tag_overrides_variant_directory() {
        let config = RunConfig {
            run_tag: Some("large20".into()),
            ..RunConfig::default()
        };
        assert_eq!(config.checkpoint_dir(), PathBuf::from("./savedmodels/large20"));
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let config = RunConfig {
            img_channels: 16,
            ..RunConfig::default()
        };
        assert!(matches!(config.validate(), Err(GoNetError::Config { .. })));
    }

    #[test]
    fn rejects_bad_memory_fraction() {
        let mut config = RunConfig::default();
        config.session.memory_fraction = 1.5;
        assert!(config.validate().is_err());
        config.session.memory_fraction = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn variant_parsing_round_trips() {
        for v in [Variant::Original, Variant::Elu, Variant::Full] {
            assert_eq!(v.tag().parse::<Variant>().unwrap(), v);
        }
        assert!("resnet".parse::<Variant>().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let json = r#"{"batch_size": 8, "model": "full", "mode": "inference"}"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.model, Variant::Full);
        assert_eq!(config.mode, Mode::Inference);
        assert_eq!(config.max_to_keep, 10);
        assert_eq!(config.session.inter_op_threads, 4);
    }
}
