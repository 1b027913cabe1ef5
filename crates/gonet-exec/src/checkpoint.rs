//! Checkpoint persistence.
//!
//! A checkpoint directory holds snapshots named
//! `model-<tag>.ckpt-<step>.safetensors` and a JSON pointer file named
//! `checkpoint` that lists the snapshots written by the current run, newest last:
//!
//! ```json
//! {
//!   "model_checkpoint_path": "model-0.5123.ckpt-120",
//!   "all_model_checkpoint_paths": ["model-0.4801.ckpt-60", "model-0.5123.ckpt-120"]
//! }
//! ```
//!
//! Snapshot and pointer file are both written to a `.tmp` sibling and
//! renamed into place, so a crash never leaves a half-written file under
//! the final name.
//!
//! Restores are all-or-nothing: every variable is matched against the file
//! by name, shape and dtype before the first one is overwritten.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Tensor, Var};
use gonet_core::GoNetError;
use serde::{Deserialize, Serialize};

/// Name of the pointer file inside a checkpoint directory.
pub const CHECKPOINT_STATE_FILE: &str = "checkpoint";

/// Extension of snapshot data files.
pub const CHECKPOINT_EXT: &str = "safetensors";

/// Contents of the pointer file. Paths are prefixes relative to the
/// checkpoint directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub model_checkpoint_path: String,
    pub all_model_checkpoint_paths: Vec<String>,
}

/// Snapshot prefix for an accuracy tag and a global step.
///
/// Integral tags keep one decimal place and `-0.0` is written as `0.0`.
///
/// # Example
///
/// ```
/// use gonet_exec::checkpoint_prefix;
///
/// assert_eq!(checkpoint_prefix(0.5123, 7), "model-0.5123.ckpt-7");
/// assert_eq!(checkpoint_prefix(-0.0, 3), "model-0.0.ckpt-3");
/// ```
pub fn checkpoint_prefix(tag: f64, step: i64) -> String {
    let tag = if tag == 0.0 { 0.0 } else { tag };
    if tag.is_finite() && tag.fract() == 0.0 {
        format!("model-{tag:.1}.ckpt-{step}")
    } else {
        format!("model-{tag}.ckpt-{step}")
    }
}

/// Data file of a snapshot prefix inside `dir`.
pub fn data_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}.{CHECKPOINT_EXT}"))
}

/// Reads the pointer file in `dir`; `None` if there is none.
///
/// # Errors
///
/// Returns [`GoNetError::Io`] or [`GoNetError::Serde`] if the file exists
/// but cannot be read or parsed.
pub fn get_checkpoint_state(dir: impl AsRef<Path>) -> Result<Option<CheckpointState>, GoNetError> {
    let path = dir.as_ref().join(CHECKPOINT_STATE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&json)?))
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes snapshots of a fixed variable subset and prunes old ones.
///
/// Retention only covers snapshots written by this saver: files left by
/// earlier runs are never deleted, and the pointer file is rewritten from
/// the in-memory list on every save without being read first.
#[derive(Debug, Clone)]
pub struct Saver {
    dir: PathBuf,
    max_to_keep: usize,
    last_checkpoints: Vec<String>,
}

impl Saver {
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> Self {
        Self {
            dir: dir.into(),
            max_to_keep: max_to_keep.max(1),
            last_checkpoints: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Prefixes written by this saver and still on disk, oldest first.
    pub fn last_checkpoints(&self) -> &[String] {
        &self.last_checkpoints
    }

    /// Writes `vars` under `model-<tag>.ckpt-<step>` and updates the pointer
    /// file. Returns the data file path.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Save`] for any I/O or encoding failure.
    pub fn save(&mut self, vars: &[(String, Var)], tag: f64, step: i64) -> Result<PathBuf, GoNetError> {
        let prefix = checkpoint_prefix(tag, step);
        let path = data_path(&self.dir, &prefix);
        let save_err = |message: String| GoNetError::Save {
            path: path.clone(),
            message,
        };

        std::fs::create_dir_all(&self.dir).map_err(|e| save_err(e.to_string()))?;

        let tensors: HashMap<String, Tensor> = vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        let tmp = tmp_sibling(&path);
        candle_core::safetensors::save(&tensors, &tmp).map_err(|e| save_err(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| save_err(e.to_string()))?;

        self.last_checkpoints.retain(|p| p != &prefix);
        self.last_checkpoints.push(prefix.clone());
        while self.last_checkpoints.len() > self.max_to_keep {
            let old = self.last_checkpoints.remove(0);
            let old_path = data_path(&self.dir, &old);
            match std::fs::remove_file(&old_path) {
                Ok(()) => tracing::debug!(path = %old_path.display(), "pruned checkpoint"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %old_path.display(), error = %e, "could not prune checkpoint")
                }
            }
        }

        let state = CheckpointState {
            model_checkpoint_path: prefix,
            all_model_checkpoint_paths: self.last_checkpoints.clone(),
        };
        let state_path = self.dir.join(CHECKPOINT_STATE_FILE);
        let state_tmp = tmp_sibling(&state_path);
        let json = serde_json::to_string_pretty(&state).map_err(|e| save_err(e.to_string()))?;
        std::fs::write(&state_tmp, json).map_err(|e| save_err(e.to_string()))?;
        std::fs::rename(&state_tmp, &state_path).map_err(|e| save_err(e.to_string()))?;

        Ok(path)
    }
}

/// Loads the data file at `path` into `vars`.
///
/// # Errors
///
/// Returns [`GoNetError::Restore`] if the file is unreadable or any
/// variable is missing or has a different shape or dtype. No variable is
/// modified in that case.
pub fn restore(vars: &[(String, Var)], path: impl AsRef<Path>) -> Result<(), GoNetError> {
    let path = path.as_ref();
    let restore_err = |message: String| GoNetError::Restore {
        path: path.to_path_buf(),
        message,
    };
    let Some((_, first)) = vars.first() else {
        return Ok(());
    };

    let mut tensors = candle_core::safetensors::load(path, first.device())
        .map_err(|e| restore_err(e.to_string()))?;

    let mut matched = Vec::with_capacity(vars.len());
    for (name, var) in vars {
        let tensor = tensors
            .remove(name)
            .ok_or_else(|| restore_err(format!("missing variable '{name}'")))?;
        if tensor.dims() != var.dims() {
            return Err(restore_err(format!(
                "'{name}' has shape {:?}, expected {:?}",
                tensor.dims(),
                var.dims()
            )));
        }
        if tensor.dtype() != var.dtype() {
            return Err(restore_err(format!(
                "'{name}' has dtype {:?}, expected {:?}",
                tensor.dtype(),
                var.dtype()
            )));
        }
        matched.push((var, tensor));
    }

    for (var, tensor) in matched {
        var.set(&tensor).map_err(|e| restore_err(e.to_string()))?;
    }
    Ok(())
}

/// Restores the newest snapshot listed in `dir`'s pointer file and returns
/// its data file path.
///
/// # Errors
///
/// Returns [`GoNetError::Restore`] if there is no usable pointer file or
/// the snapshot cannot be applied.
pub fn restore_latest(vars: &[(String, Var)], dir: impl AsRef<Path>) -> Result<PathBuf, GoNetError> {
    let dir = dir.as_ref();
    let state = get_checkpoint_state(dir)
        .map_err(|e| GoNetError::Restore {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?
        .ok_or_else(|| GoNetError::Restore {
            path: dir.to_path_buf(),
            message: "no checkpoint state".into(),
        })?;
    let path = data_path(dir, &state.model_checkpoint_path);
    restore(vars, &path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn vars(values: &[f32]) -> Vec<(String, Var)> {
        let dev = Device::Cpu;
        vec![
            ("a.weight".to_string(), Var::new(values, &dev).unwrap()),
            ("global_step".to_string(), Var::zeros((), DType::I64, &dev).unwrap()),
        ]
    }

    fn read(var: &Var) -> Vec<f32> {
        var.as_tensor().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn save_then_restore_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let mut saver = Saver::new(dir.path(), 10);
        let original = vars(&[0.1, -2.5, 3.25]);
        let path = saver.save(&original, 0.5123, 3).unwrap();
        assert!(path.ends_with("model-0.5123.ckpt-3.safetensors"));

        let target = vars(&[0.0, 0.0, 0.0]);
        let restored = restore_latest(&target, dir.path()).unwrap();
        assert_eq!(restored, path);
        assert_eq!(read(&target[0].1), vec![0.1, -2.5, 3.25]);
    }

    #[test]
    fn pointer_file_tracks_latest() {
        let dir = tempfile::tempdir().unwrap();
        let mut saver = Saver::new(dir.path(), 10);
        saver.save(&vars(&[1.0]), 0.41, 1).unwrap();
        saver.save(&vars(&[2.0]), 0.45, 2).unwrap();

        let state = get_checkpoint_state(dir.path()).unwrap().unwrap();
        assert_eq!(state.model_checkpoint_path, "model-0.45.ckpt-2");
        assert_eq!(state.all_model_checkpoint_paths.len(), 2);
        assert!(!dir.path().join("checkpoint.tmp").exists());
    }

    #[test]
    fn retention_prunes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut saver = Saver::new(dir.path(), 2);
        for step in 0..4 {
            saver.save(&vars(&[step as f32]), 0.5, step).unwrap();
        }
        let state = get_checkpoint_state(dir.path()).unwrap().unwrap();
        assert_eq!(
            state.all_model_checkpoint_paths,
            vec!["model-0.5.ckpt-2".to_string(), "model-0.5.ckpt-3".to_string()]
        );
        assert!(!data_path(dir.path(), "model-0.5.ckpt-0").exists());
        assert!(!data_path(dir.path(), "model-0.5.ckpt-1").exists());
        assert!(data_path(dir.path(), "model-0.5.ckpt-3").exists());
    }

    #[test]
    fn shape_mismatch_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut saver = Saver::new(dir.path(), 10);
        saver.save(&vars(&[1.0, 2.0]), 0.5, 1).unwrap();

        let dev = Device::Cpu;
        let target = vec![
            ("global_step".to_string(), Var::zeros((), DType::I64, &dev).unwrap()),
            ("a.weight".to_string(), Var::new(&[9.0f32, 9.0, 9.0], &dev).unwrap()),
        ];
        let err = restore_latest(&target, dir.path()).unwrap_err();
        assert!(matches!(err, GoNetError::Restore { .. }));
        assert_eq!(read(&target[1].1), vec![9.0, 9.0, 9.0]);
    }

    #[test]
    fn missing_directory_is_restore_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = restore_latest(&vars(&[1.0]), dir.path().join("absent")).unwrap_err();
        assert!(err.to_string().contains("no checkpoint state"));
    }

    #[test]
    fn corrupt_pointer_file_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CHECKPOINT_STATE_FILE), "garbage{").unwrap();

        let mut saver = Saver::new(dir.path(), 10);
        let path = saver.save(&vars(&[1.0]), 0.5, 4).unwrap();
        assert!(path.exists());

        let state = get_checkpoint_state(dir.path()).unwrap().unwrap();
        assert_eq!(state.model_checkpoint_path, "model-0.5.ckpt-4");
        assert_eq!(state.all_model_checkpoint_paths, vec!["model-0.5.ckpt-4".to_string()]);
    }

    #[test]
    fn earlier_runs_are_never_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = Saver::new(dir.path(), 2);
        first.save(&vars(&[1.0]), 0.9, 100).unwrap();
        first.save(&vars(&[2.0]), 0.9, 200).unwrap();

        let mut second = Saver::new(dir.path(), 2);
        second.save(&vars(&[3.0]), 0.45, 0).unwrap();
        second.save(&vars(&[4.0]), 0.45, 1).unwrap();
        second.save(&vars(&[5.0]), 0.45, 2).unwrap();

        assert!(data_path(dir.path(), "model-0.9.ckpt-100").exists());
        assert!(data_path(dir.path(), "model-0.9.ckpt-200").exists());
        assert!(!data_path(dir.path(), "model-0.45.ckpt-0").exists());
        assert_eq!(
            second.last_checkpoints(),
            ["model-0.45.ckpt-1".to_string(), "model-0.45.ckpt-2".to_string()]
        );
    }

    #[test]
    fn integral_tags_keep_a_decimal() {
        assert_eq!(checkpoint_prefix(0.0, 5), "model-0.0.ckpt-5");
        assert_eq!(checkpoint_prefix(-0.0, 5), "model-0.0.ckpt-5");
        assert_eq!(checkpoint_prefix(1.0, 2), "model-1.0.ckpt-2");
        assert_eq!(checkpoint_prefix(0.41, 2), "model-0.41.ckpt-2");
    }

    #[test]
    fn unwritable_directory_is_save_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let mut saver = Saver::new(blocker.join("sub"), 10);
        assert!(matches!(
            saver.save(&vars(&[1.0]), 0.5, 1),
            Err(GoNetError::Save { .. })
        ));
    }
}
