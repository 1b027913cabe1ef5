//! The executor: one model, one variable map, one session lifetime.
//!
//! [`Executor::new`] builds everything once: device selection, the model
//! handle and its variables, placeholders, the saver and both summary
//! sinks. It then tries to restore `load_model_path`; a failed restore is
//! logged and the fresh initialisation is kept.
//!
//! [`Executor::close`] drops the session. Every later call that needs it
//! returns [`GoNetError::Closed`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use gonet_core::{remap_features, Batch, GoNetError, Placeholder, Placeholders, RunConfig, SessionConfig};
use gonet_model::{HParams, ModelHandle};
use rayon::prelude::*;

use crate::checkpoint::{self, Saver};
use crate::summary::SummaryWriter;

pub(crate) struct Session {
    pub(crate) device: Device,
    pub(crate) model: ModelHandle,
    pub(crate) placeholders: Placeholders,
    pub(crate) saver: Saver,
    pub(crate) train_writer: SummaryWriter,
    pub(crate) test_writer: SummaryWriter,
    /// Runs training and evaluation steps.
    pub(crate) compute_pool: rayon::ThreadPool,
    /// Runs bulk-inference replicas side by side.
    pub(crate) replica_pool: rayon::ThreadPool,
}

/// Owns the session for one model.
pub struct Executor {
    pub(crate) config: RunConfig,
    pub(crate) hps: HParams,
    pub(crate) session: Option<Session>,
    pub(crate) interrupt: Arc<AtomicBool>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("model", &self.config.model)
            .field("mode", &self.config.mode)
            .field("closed", &self.session.is_none())
            .finish()
    }
}

fn select_device(session: &SessionConfig) -> Device {
    if session.allow_gpu {
        Device::cuda_if_available(0).unwrap_or(Device::Cpu)
    } else {
        Device::Cpu
    }
}

fn build_pool(threads: usize, name: &'static str) -> Result<rayon::ThreadPool, GoNetError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("gonet-{name}-{i}"))
        .build()
        .map_err(|e| GoNetError::Internal {
            message: format!("building {name} pool: {e}"),
        })
}

/// Moves a preprocessed batch onto `device`.
pub(crate) fn batch_to_device(batch: Batch, device: &Device) -> Result<Batch, GoNetError> {
    let map_err = |e: candle_core::Error| GoNetError::Internal {
        message: format!("moving batch to {device:?}: {e}"),
    };
    Ok(Batch {
        features: batch.features.to_device(device).map_err(map_err)?,
        move_probs: batch.move_probs.to_device(device).map_err(map_err)?,
        outcomes: batch.outcomes.to_device(device).map_err(map_err)?,
    })
}

impl Executor {
    /// Builds the session for `config` and `hps`.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Config`] or [`GoNetError::Contract`] if the
    /// model cannot be built, and [`GoNetError::Io`] if a summary directory
    /// cannot be created. Restore failures are not errors.
    pub fn new(config: RunConfig, hps: HParams) -> Result<Self, GoNetError> {
        config.validate()?;
        hps.validate()?;

        let device = select_device(&config.session);
        let var_map = VarMap::new();
        let model = ModelHandle::new(config.model, &hps, &config.layout(), &var_map, &device)?;
        let placeholders = Placeholders::new(&config);
        let saver = Saver::new(config.checkpoint_dir(), config.max_to_keep);
        let train_writer = SummaryWriter::create(&config.train_log_dir)?;
        let test_writer = SummaryWriter::create(&config.test_log_dir)?;
        let compute_pool = build_pool(config.session.intra_op_threads, "compute")?;
        let replica_pool = build_pool(config.session.inter_op_threads, "replica")?;

        tracing::info!(
            model = %config.model,
            device = ?device,
            total_parameters = model.total_parameters()?,
            memory_fraction = config.session.memory_fraction,
            "executor ready"
        );

        if let Some(dir) = &config.load_model_path {
            match checkpoint::restore_latest(&model.checkpoint_vars()?, dir) {
                Ok(path) => tracing::info!(
                    path = %path.display(),
                    global_step = model.global_step()?,
                    "restored checkpoint"
                ),
                Err(e) => tracing::warn!(error = %e, "restore failed, keeping fresh initialization"),
            }
        }

        Ok(Self {
            config,
            hps,
            session: Some(Session {
                device,
                model,
                placeholders,
                saver,
                train_writer,
                test_writer,
                compute_pool,
                replica_pool,
            }),
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) fn session(&self) -> Result<&Session, GoNetError> {
        self.session.as_ref().ok_or(GoNetError::Closed)
    }

    pub(crate) fn session_mut(&mut self) -> Result<&mut Session, GoNetError> {
        self.session.as_mut().ok_or(GoNetError::Closed)
    }

    /// Releases the session. Calling it again is a no-op.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let step = session.model.global_step().unwrap_or(-1);
            tracing::info!(global_step = step, "session closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    /// Flag polled before every training step. Setting it closes the
    /// executor and makes `train` return [`GoNetError::Interrupted`].
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Closes the executor and returns [`GoNetError::Interrupted`] if the
    /// interrupt flag is set; otherwise does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Interrupted`] once the flag has been set.
    pub fn check_interrupt(&mut self) -> Result<(), GoNetError> {
        if !self.interrupt.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.close();
        Err(GoNetError::Interrupted)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn hps(&self) -> &HParams {
        &self.hps
    }

    /// # Errors
    ///
    /// Returns [`GoNetError::Closed`] after `close`.
    pub fn model(&self) -> Result<&ModelHandle, GoNetError> {
        Ok(&self.session()?.model)
    }

    /// # Errors
    ///
    /// Returns [`GoNetError::Closed`] after `close`.
    pub fn device(&self) -> Result<&Device, GoNetError> {
        Ok(&self.session()?.device)
    }

    /// # Errors
    ///
    /// Returns [`GoNetError::Closed`] after `close`.
    pub fn global_step(&self) -> Result<i64, GoNetError> {
        self.session()?.model.global_step()
    }

    /// The persisted variable subset, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Closed`] after `close`.
    pub fn checkpoint_variables(&self) -> Result<Vec<(String, Var)>, GoNetError> {
        self.session()?.model.checkpoint_vars()
    }

    /// Directory checkpoints are written to.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.config.checkpoint_dir()
    }

    /// Saves the checkpoint subset tagged with `tag` and the current global
    /// step. Returns the data file path.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Save`] on I/O failure and
    /// [`GoNetError::Closed`] after `close`.
    pub fn save_model(&mut self, tag: f64) -> Result<PathBuf, GoNetError> {
        let session = self.session_mut()?;
        let step = session.model.global_step()?;
        let vars = session.model.checkpoint_vars()?;
        let path = session.saver.save(&vars, tag, step)?;
        tracing::info!(path = %path.display(), tag, global_step = step, "saved checkpoint");
        Ok(path)
    }

    /// Restores the newest checkpoint listed in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Restore`] if nothing usable is found; the
    /// variables are unchanged in that case.
    pub fn restore(&mut self, dir: impl AsRef<Path>) -> Result<PathBuf, GoNetError> {
        let session = self.session()?;
        checkpoint::restore_latest(&session.model.checkpoint_vars()?, dir)
    }

    /// Bulk inference on raw feature planes `[N, rows, cols, 17]`.
    ///
    /// Applies the colour-plane remap, runs the network in inference mode
    /// at temperature 1.0 split across `num_replicas` shards, and returns
    /// `(move_probs [N, classes], values [N, 1])` in input order.
    ///
    /// # Errors
    ///
    /// Returns [`GoNetError::Shape`] for an empty or misshapen input and
    /// [`GoNetError::Closed`] after `close`.
    pub fn run_many(&self, features: &Tensor) -> Result<(Tensor, Tensor), GoNetError> {
        let session = self.session()?;
        let map_err = |e: candle_core::Error| GoNetError::Internal {
            message: format!("Executor run_many: {e}"),
        };

        let n = features.dims().first().copied().unwrap_or(0);
        if n == 0 {
            return Err(GoNetError::shape("run_many needs at least one position"));
        }
        let images = remap_features(features, self.config.img_channels)?;
        let mut unbound = session.placeholders.images.shape.clone();
        unbound[0] = None;
        Placeholder::new("images", unbound).check(&images)?;
        let images = images.to_device(&session.device).map_err(map_err)?;

        let replicas = self.config.session.num_replicas.min(n);
        let chunk = n.div_ceil(replicas);
        let shards = (0..n)
            .step_by(chunk)
            .map(|start| images.narrow(0, start, chunk.min(n - start)))
            .collect::<candle_core::Result<Vec<_>>>()
            .map_err(map_err)?;

        let model = &session.model;
        let outputs = session.replica_pool.install(|| {
            shards
                .par_iter()
                .map(|shard| model.predict(shard, 1.0))
                .collect::<Result<Vec<_>, GoNetError>>()
        })?;

        let (probs, values): (Vec<Tensor>, Vec<Tensor>) = outputs.into_iter().unzip();
        let probs = Tensor::cat(&probs, 0).map_err(map_err)?;
        let values = Tensor::cat(&values, 0).map_err(map_err)?;
        tracing::debug!(positions = n, replicas, "run_many");
        Ok((probs, values))
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.close();
    }
}
