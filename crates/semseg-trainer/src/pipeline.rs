//! # Run Pipeline
//!
//! One training run end to end: seed, load, split, build the data module
//! and model, open tracking, fit, test, and optionally render prediction
//! artifacts. Every relative output path is resolved against `root`.
//!
//! Inputs that would only fail late (mask ids the model cannot predict,
//! splits too small to evaluate) are rejected before the first step.

use std::path::{Path, PathBuf};

use candle_core::Device;
use semseg_core::data::DataModuleConfig;
use semseg_core::{
    Config, ModelSpec, SegModel, SemDataModule, StageMetrics, check_mask_classes, load_data,
    resolve_device, split_data,
};
use semseg_tracking::Tracker;
use tracing::info;

use crate::artifact::predict_and_log;
use crate::error::{Result, TrainerError};
use crate::trainer::{FitSummary, Trainer, TrainerConfig};

pub const ARTIFACT_DIR: &str = "artifacts";
pub const MODEL_FILE: &str = "model.safetensors";
/// Tracker artifact key for the saved weights.
pub const MODEL_ARTIFACT: &str = "model";
/// Tracker artifact key for the best checkpoint.
pub const CHECKPOINT_ARTIFACT: &str = "checkpoints";

/// Outcome of [`run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub fit: FitSummary,
    pub test: StageMetrics,
    /// Saved weights and prediction grids; empty unless `log_artifacts`.
    pub artifacts: Vec<PathBuf>,
}

/// Train and evaluate according to `config`, logging to `tracker`.
pub fn run(config: &Config, root: &Path, tracker: &mut dyn Tracker) -> Result<RunReport> {
    let experiment = &config.experiment;
    let device = resolve_device(experiment.accelerator, &experiment.devices)?;
    seed_device(&device, experiment.random_seed);

    let dataset = root.join(config.dataset_path());
    let (images, masks) = load_data(&dataset)?;
    check_mask_classes(&dataset, &masks, config.model.num_classes)?;
    let split = split_data(
        &images,
        &masks,
        experiment.split_ratio.valid(),
        experiment.split_ratio.test(),
        experiment.random_seed,
    )?;
    drop((images, masks));

    let mut dm = SemDataModule::new(
        split,
        DataModuleConfig {
            batch_size: experiment.batch_size,
            num_workers: experiment.num_workers,
            image_size: experiment.image_size.dims(),
            seed: experiment.random_seed,
        },
        device.clone(),
    );
    check_split_sizes(&dm, experiment.log_artifacts)?;
    let mut model = SegModel::new(ModelSpec::from_config(config), &device)?;

    let mut trainer = Trainer::new(TrainerConfig::from_config(config, root));
    let fit = trainer.fit(&mut model, &mut dm, tracker)?;
    if let Some(best) = &fit.best_checkpoint {
        tracker.log_artifact(CHECKPOINT_ARTIFACT, best)?;
    }
    let test = trainer.test(&mut model, &mut dm, tracker)?;

    let artifacts = if experiment.log_artifacts {
        log_artifacts(&model, &mut dm, tracker, &root.join(ARTIFACT_DIR), trainer.global_step())?
    } else {
        Vec::new()
    };

    info!(
        epochs = fit.epochs_run,
        test_loss = test.loss,
        test_iou = test.iou,
        artifacts = artifacts.len(),
        "run complete"
    );
    Ok(RunReport {
        fit,
        test,
        artifacts,
    })
}

/// Fail before training when a split the run needs is empty. Validation
/// may be empty unless its prediction grid is requested.
fn check_split_sizes(dm: &SemDataModule, log_artifacts: bool) -> Result<()> {
    let (train, valid, test) = dm.split_sizes();
    let empty = if train == 0 {
        Some("train")
    } else if test == 0 {
        Some("test")
    } else if valid == 0 && log_artifacts {
        Some("valid")
    } else {
        None
    };
    match empty {
        Some(split) => Err(TrainerError::EmptySplit {
            split: split.into(),
        }),
        None => Ok(()),
    }
}

/// Persist and upload the weights, freeze, and log one prediction grid per
/// split.
fn log_artifacts(
    model: &SegModel,
    dm: &mut SemDataModule,
    tracker: &mut dyn Tracker,
    artifact_dir: &Path,
    step: u64,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(artifact_dir)?;
    let weights = artifact_dir.join(MODEL_FILE);
    model.save(&weights)?;
    tracker.log_artifact(MODEL_ARTIFACT, &weights)?;
    let frozen = model.freeze()?;

    dm.setup()?;
    let loaders = [
        ("Train", dm.train_dataloader()?),
        ("Valid", dm.val_dataloader()?),
        ("Test", dm.test_dataloader()?),
    ];

    let mut written = vec![weights];
    for (title, loader) in &loaders {
        written.push(predict_and_log(&frozen, loader, title, tracker, artifact_dir, step)?);
    }
    Ok(written)
}

/// Seed the device RNG used for weight initialisation. CPU has no seedable
/// generator; data shuffling is seeded separately.
fn seed_device(device: &Device, seed: u64) {
    if !device.is_cpu() {
        if let Err(e) = device.set_seed(seed) {
            tracing::warn!(error = %e, "could not seed device");
        }
    }
}
