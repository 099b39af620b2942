//! # Trainer
//!
//! Fixed-epoch fit loop with one validation round per epoch, followed by a
//! single test pass. Metrics go to the tracker handle passed in by the
//! caller; callbacks decide on checkpoints and early termination.

use std::path::{Path, PathBuf};

use candle_nn::Optimizer;
use semseg_core::data::BatchLoader;
use semseg_core::{Config, SegModel, SemDataModule, Stage, StageMetrics};
use semseg_tracking::{Metrics, Tracker};
use tracing::{debug, info, warn};

use crate::callbacks::{EarlyStopping, LearningRateMonitor, ModelCheckpoint, Signal};
use crate::error::{Result, TrainerError};

pub const CHECKPOINT_DIR: &str = "checkpoints";
pub const OPTIMIZER_NAME: &str = "AdamW";

/// Loop settings derived from the run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    pub patience: usize,
    /// `None` disables checkpointing.
    pub checkpoint_dir: Option<PathBuf>,
    pub save_top_k: usize,
    pub log_every_n_steps: u64,
}

impl TrainerConfig {
    /// Checkpoints land in `<root>/checkpoints` when enabled.
    pub fn from_config(config: &Config, root: &Path) -> Self {
        let experiment = &config.experiment;
        Self {
            max_epochs: experiment.num_epochs,
            patience: experiment.patience,
            checkpoint_dir: experiment
                .use_checkpointing
                .then(|| root.join(CHECKPOINT_DIR)),
            save_top_k: ModelCheckpoint::DEFAULT_TOP_K,
            log_every_n_steps: 2,
        }
    }
}

/// What happened during [`Trainer::fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    pub epochs_run: usize,
    pub global_steps: u64,
    pub stopped_early: bool,
    pub best_val_loss: Option<f64>,
    pub best_checkpoint: Option<PathBuf>,
    pub last_epoch: Option<EpochMetrics>,
}

/// Epoch-level metrics, as logged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train: StageMetrics,
    pub val: Option<StageMetrics>,
}

impl EpochMetrics {
    fn to_metrics(self) -> Metrics {
        let mut m = Metrics::new();
        m.insert("epoch".into(), self.epoch as f64);
        m.insert("train_loss_epoch".into(), self.train.loss);
        m.insert("train_iou".into(), self.train.iou);
        if let Some(val) = self.val {
            m.insert("val_loss".into(), val.loss);
            m.insert("val_iou".into(), val.iou);
            m.insert("val_acc".into(), val.accuracy);
        }
        m
    }
}

pub struct Trainer {
    config: TrainerConfig,
    lr_monitor: LearningRateMonitor,
    early_stopping: EarlyStopping,
    checkpoint: Option<ModelCheckpoint>,
    global_step: u64,
}

impl Trainer {
    /// `log_every_n_steps` below 1 is treated as 1.
    pub fn new(mut config: TrainerConfig) -> Self {
        config.log_every_n_steps = config.log_every_n_steps.max(1);
        let checkpoint = config
            .checkpoint_dir
            .as_ref()
            .map(|dir| ModelCheckpoint::new(dir, config.save_top_k));
        Self {
            lr_monitor: LearningRateMonitor::new(OPTIMIZER_NAME),
            early_stopping: EarlyStopping::new(config.patience),
            checkpoint,
            global_step: 0,
            config,
        }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn checkpoint(&self) -> Option<&ModelCheckpoint> {
        self.checkpoint.as_ref()
    }

    pub fn fit(
        &mut self,
        model: &mut SegModel,
        dm: &mut SemDataModule,
        tracker: &mut dyn Tracker,
    ) -> Result<FitSummary> {
        dm.setup()?;
        let train = dm.train_dataloader()?;
        let val = dm.val_dataloader()?;
        if train.is_empty() {
            return Err(TrainerError::EmptySplit {
                split: "train".into(),
            });
        }
        if val.is_empty() {
            warn!("validation split is empty; early stopping and checkpointing are inactive");
        }

        let (mut optimizer, scheduler) = model.configure_optimizers()?;
        info!(
            epochs = self.config.max_epochs,
            train_batches = train.len(),
            val_batches = val.len(),
            scheduler = scheduler.is_some(),
            "fit started"
        );

        let mut summary = FitSummary {
            epochs_run: 0,
            global_steps: 0,
            stopped_early: false,
            best_val_loss: None,
            best_checkpoint: None,
            last_epoch: None,
        };

        for epoch in 0..self.config.max_epochs {
            let train_metrics = self.train_epoch(model, &train, &mut optimizer, epoch, tracker)?;
            let val_metrics = run_eval(model, &val, Stage::Validate)?;

            let epoch_metrics = EpochMetrics {
                epoch,
                train: train_metrics,
                val: val_metrics,
            };
            tracker.log_metrics(self.global_step, &epoch_metrics.to_metrics())?;
            info!(
                epoch,
                train_loss = train_metrics.loss,
                val_loss = ?val_metrics.map(|m| m.loss),
                val_iou = ?val_metrics.map(|m| m.iou),
                "epoch finished"
            );
            summary.epochs_run = epoch + 1;
            summary.last_epoch = Some(epoch_metrics);

            if let Some(sched) = &scheduler {
                let lr = sched.lr_at(epoch + 1);
                optimizer.set_learning_rate(lr);
                debug!(epoch, lr, "learning rate scheduled");
            }

            let Some(val_loss) = val_metrics.map(|m| m.loss) else {
                continue;
            };
            if let Some(checkpoint) = &mut self.checkpoint {
                checkpoint.on_validation_end(epoch, val_loss, &*model)?;
            }
            if self.early_stopping.on_validation_end(epoch, val_loss) == Signal::Stop {
                summary.stopped_early = true;
                break;
            }
        }

        summary.global_steps = self.global_step;
        summary.best_val_loss = self.early_stopping.best();
        summary.best_checkpoint = self
            .checkpoint
            .as_ref()
            .and_then(ModelCheckpoint::best_model_path);
        info!(
            epochs = summary.epochs_run,
            steps = summary.global_steps,
            stopped_early = summary.stopped_early,
            best_val_loss = ?summary.best_val_loss,
            "fit finished"
        );
        Ok(summary)
    }

    fn train_epoch(
        &mut self,
        model: &mut SegModel,
        loader: &BatchLoader,
        optimizer: &mut impl Optimizer,
        epoch: usize,
        tracker: &mut dyn Tracker,
    ) -> Result<StageMetrics> {
        model.reset_metrics(Stage::Train);
        for batch in loader {
            let batch = batch?;
            let out = model.training_step(&batch)?;
            let lr = optimizer.learning_rate();
            optimizer
                .backward_step(&out.loss)
                .map_err(|source| TrainerError::OptimizerStep {
                    step: self.global_step,
                    source,
                })?;
            self.global_step += 1;

            self.lr_monitor.on_train_step(self.global_step, lr, tracker)?;
            if self.global_step % self.config.log_every_n_steps == 0 {
                let mut m = Metrics::new();
                m.insert("train_loss".into(), f64::from(out.loss_value));
                m.insert("epoch".into(), epoch as f64);
                tracker.log_metrics(self.global_step, &m)?;
            }
            debug!(epoch, step = self.global_step, loss = out.loss_value, "train step");
        }
        model
            .epoch_metrics(Stage::Train)
            .ok_or_else(|| TrainerError::EmptySplit {
                split: "train".into(),
            })
    }

    /// One pass over the test split; logs `test_loss`, `test_iou`, `test_acc`.
    pub fn test(
        &mut self,
        model: &mut SegModel,
        dm: &mut SemDataModule,
        tracker: &mut dyn Tracker,
    ) -> Result<StageMetrics> {
        dm.setup()?;
        let loader = dm.test_dataloader()?;
        let metrics = run_eval(model, &loader, Stage::Test)?.ok_or_else(|| {
            TrainerError::EmptySplit {
                split: "test".into(),
            }
        })?;

        let mut m = Metrics::new();
        m.insert("test_loss".into(), metrics.loss);
        m.insert("test_iou".into(), metrics.iou);
        m.insert("test_acc".into(), metrics.accuracy);
        tracker.log_metrics(self.global_step, &m)?;
        info!(
            loss = metrics.loss,
            iou = metrics.iou,
            acc = metrics.accuracy,
            "test finished"
        );
        Ok(metrics)
    }
}

/// Validation or test pass. `None` when the loader is empty.
fn run_eval(model: &mut SegModel, loader: &BatchLoader, stage: Stage) -> Result<Option<StageMetrics>> {
    model.reset_metrics(stage);
    for batch in loader {
        let batch = batch?;
        match stage {
            Stage::Test => model.test_step(&batch)?,
            _ => model.validation_step(&batch)?,
        };
    }
    Ok(model.epoch_metrics(stage))
}
