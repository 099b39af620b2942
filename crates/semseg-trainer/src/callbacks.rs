//! # Training Callbacks
//!
//! Learning-rate monitoring, early stopping and top-k checkpointing, all
//! keyed on the `val_loss` reported at the end of each validation round.

use std::fs;
use std::path::{Path, PathBuf};

use semseg_core::Checkpointable;
use semseg_tracking::{Metrics, Tracker};
use tracing::{debug, info, warn};

use crate::error::{Result, TrainerError};

/// Metric watched by early stopping and checkpointing.
pub const MONITOR: &str = "val_loss";

/// Whether the fit loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Continue,
    Stop,
}

/// Records the optimizer's learning rate at every step.
#[derive(Debug, Clone)]
pub struct LearningRateMonitor {
    key: String,
}

impl LearningRateMonitor {
    pub fn new(optimizer_name: &str) -> Self {
        Self {
            key: format!("lr-{optimizer_name}"),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn on_train_step(&self, step: u64, lr: f64, tracker: &mut dyn Tracker) -> Result<()> {
        let mut metrics = Metrics::new();
        metrics.insert(self.key.clone(), lr);
        tracker.log_metrics(step, &metrics)?;
        Ok(())
    }
}

/// Stops training once `val_loss` has not strictly decreased for
/// `patience` consecutive validation rounds.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: Option<f64>,
    wait: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: None,
            wait: 0,
            stopped_epoch: None,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    pub fn on_validation_end(&mut self, epoch: usize, val_loss: f64) -> Signal {
        if !val_loss.is_finite() {
            warn!(epoch, val_loss, "monitored metric is not finite, stopping");
            self.stopped_epoch = Some(epoch);
            return Signal::Stop;
        }

        match self.best {
            Some(best) if val_loss >= best => {
                self.wait += 1;
                debug!(epoch, val_loss, best, wait = self.wait, "no improvement");
                if self.wait >= self.patience {
                    info!(
                        epoch,
                        patience = self.patience,
                        best,
                        "{MONITOR} did not improve, stopping"
                    );
                    self.stopped_epoch = Some(epoch);
                    return Signal::Stop;
                }
            }
            previous => {
                if let Some(previous) = previous {
                    info!(epoch, improvement = previous - val_loss, best = val_loss, "{MONITOR} improved");
                }
                self.best = Some(val_loss);
                self.wait = 0;
            }
        }
        Signal::Continue
    }
}

/// Keeps the `top_k` lowest-`val_loss` checkpoints on disk.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    dir: PathBuf,
    top_k: usize,
    /// `(val_loss, path)`, unordered.
    kept: Vec<(f64, PathBuf)>,
}

impl ModelCheckpoint {
    pub const DEFAULT_TOP_K: usize = 3;

    pub fn new(dir: impl Into<PathBuf>, top_k: usize) -> Self {
        Self {
            dir: dir.into(),
            top_k,
            kept: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `sem-epoch=04-val_loss=0.37.safetensors`
    pub fn file_name(epoch: usize, val_loss: f64) -> String {
        format!("sem-epoch={epoch:02}-val_loss={val_loss:.2}.safetensors")
    }

    /// Kept checkpoints, best first.
    pub fn kept(&self) -> Vec<(f64, PathBuf)> {
        let mut kept = self.kept.clone();
        kept.sort_by(|a, b| a.0.total_cmp(&b.0));
        kept
    }

    pub fn best_model_path(&self) -> Option<PathBuf> {
        self.kept().into_iter().next().map(|(_, path)| path)
    }

    /// Save when `val_loss` ranks in the top k; returns the new file if any.
    pub fn on_validation_end(
        &mut self,
        epoch: usize,
        val_loss: f64,
        model: &dyn Checkpointable,
    ) -> Result<Option<PathBuf>> {
        if self.top_k == 0 || !val_loss.is_finite() {
            return Ok(None);
        }

        let worst = self
            .kept
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.0.total_cmp(&b.1.0))
            .map(|(i, (loss, _))| (i, *loss));
        let evict = match worst {
            _ if self.kept.len() < self.top_k => None,
            Some((i, worst_loss)) if val_loss < worst_loss => Some(i),
            _ => {
                debug!(epoch, val_loss, "not in top {}", self.top_k);
                return Ok(None);
            }
        };

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(Self::file_name(epoch, val_loss));
        model
            .save_checkpoint(&path)
            .map_err(|e| TrainerError::Checkpoint(format!("{}: {e}", path.display())))?;
        info!(epoch, val_loss, path = %path.display(), "checkpoint saved");

        if let Some(i) = evict {
            let (loss, old) = self.kept.swap_remove(i);
            if old != path {
                fs::remove_file(&old).map_err(|e| {
                    TrainerError::Checkpoint(format!("evicting {}: {e}", old.display()))
                })?;
            }
            debug!(val_loss = loss, path = %old.display(), "checkpoint evicted");
        }
        self.kept.push((val_loss, path.clone()));
        Ok(Some(path))
    }
}
