//! End-to-end runs on a tiny synthetic dataset, tracked in memory.

use std::fs;
use std::path::Path;

use candle_core::Device;
use image::{GrayImage, Luma};
use semseg_core::data::DataModuleConfig;
use semseg_core::{Config, ModelSpec, SegModel, SemDataModule, SemsegError, split_data};
use semseg_tracking::{Event, MemoryTracker};
use semseg_trainer::{
    CHECKPOINT_ARTIFACT, MODEL_ARTIFACT, PREDICTIONS_KEY, TrainerError, predict_and_log, run,
};

fn write_dataset(root: &Path, n: usize) {
    let images = root.join("data/sem/images");
    let masks = root.join("data/sem/masks");
    fs::create_dir_all(&images).unwrap();
    fs::create_dir_all(&masks).unwrap();
    for i in 0..n {
        let image = GrayImage::from_fn(16, 16, |x, y| Luma([((x * 13 + y * 5 + i as u32) % 200) as u8]));
        let mask = GrayImage::from_fn(16, 16, |x, _| Luma([if x < 8 { 0 } else { 255 }]));
        image.save(images.join(format!("s{i:02}.png"))).unwrap();
        mask.save(masks.join(format!("s{i:02}.png"))).unwrap();
    }
}

fn config(root: &Path, log_artifacts: bool, use_checkpointing: bool) -> Config {
    Config::from_toml_str(&config_toml(root, log_artifacts, use_checkpointing)).unwrap()
}

fn config_toml(root: &Path, log_artifacts: bool, use_checkpointing: bool) -> String {
    format!(
        r#"
[experiment]
name = "sem-seg-test"
random_seed = 7
split_ratio = 0.2
batch_size = 4
num_workers = 0
image_size = 16
learning_rate = 0.01
use_scheduler = true
num_epochs = 2
accelerator = "cpu"
devices = 1
patience = 3
use_checkpointing = {use_checkpointing}
log_artifacts = {log_artifacts}

[data]
data_dir = '{}'
dataset_folder = "sem"

[model]
name = "unet"
encoder = "tiny"
num_classes = 2

[loss]
name = "cross_entropy"
"#,
        root.join("data").display()
    )
}

#[test]
fn run_without_artifacts_writes_and_uploads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 10);
    let cfg = config(dir.path(), false, false);
    let tracker = MemoryTracker::new();

    let report = run(&cfg, dir.path(), &mut tracker.clone()).unwrap();

    assert_eq!(report.fit.epochs_run, 2);
    assert!(report.artifacts.is_empty());
    assert!(!dir.path().join("artifacts").exists());
    assert!(!dir.path().join("checkpoints").exists());
    assert!(tracker.images().is_empty());
    assert!(tracker.artifacts().is_empty());

    // 6 training samples, batch 4 -> 2 steps per epoch.
    assert_eq!(report.fit.global_steps, 4);
    let lr = tracker.metric_series("lr-AdamW");
    assert_eq!(lr.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert!((lr[0].1 - 0.01).abs() < 1e-12);
    assert!(lr[2].1 < lr[0].1, "cosine schedule lowers the rate for epoch 1");

    let steps: Vec<u64> = tracker.metric_series("train_loss").iter().map(|(s, _)| *s).collect();
    assert_eq!(steps, vec![2, 4]);
    assert_eq!(tracker.metric_series("val_loss").len(), 2);
    assert_eq!(tracker.metric_series("train_loss_epoch").len(), 2);
    assert_eq!(tracker.metric_series("test_acc").len(), 1);
    assert!((0.0..=1.0).contains(&report.test.accuracy));
}

#[test]
fn run_with_artifacts_logs_three_prediction_grids() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 10);
    let cfg = config(dir.path(), true, true);
    let tracker = MemoryTracker::new();

    let report = run(&cfg, dir.path(), &mut tracker.clone()).unwrap();

    let artifacts = dir.path().join("artifacts");
    assert!(artifacts.join("model.safetensors").is_file());
    for title in ["train", "valid", "test"] {
        let path = artifacts.join(format!("{title}-predictions.png"));
        assert!(path.is_file(), "{}", path.display());
        let grid = image::open(&path).unwrap();
        assert!(grid.width() > 3 * 16);
    }
    assert_eq!(report.artifacts.len(), 4);

    let images = tracker.images();
    assert_eq!(images.len(), 3);
    assert!(images.iter().all(|(key, _)| key == PREDICTIONS_KEY));

    let checkpoints: Vec<_> = fs::read_dir(dir.path().join("checkpoints")).unwrap().collect();
    assert!((1..=3).contains(&checkpoints.len()));
    let best = report.fit.best_checkpoint.unwrap();
    assert!(best.is_file());

    let uploaded = tracker.artifacts();
    assert_eq!(uploaded.len(), 2);
    assert!(uploaded.contains(&(CHECKPOINT_ARTIFACT.to_string(), best)));
    assert!(uploaded.contains(&(MODEL_ARTIFACT.to_string(), artifacts.join("model.safetensors"))));

    assert!(!tracker.events().contains(&Event::Finish), "the caller owns finishing");
}

#[test]
fn predicting_on_an_empty_split_fails() {
    let images: Vec<GrayImage> = (0..4).map(|_| GrayImage::new(8, 8)).collect();
    let split = split_data(&images, &images, 0.0, 0.5, 1).unwrap();
    let mut dm = SemDataModule::new(
        split,
        DataModuleConfig {
            batch_size: 2,
            num_workers: 0,
            image_size: (8, 8),
            seed: 1,
        },
        Device::Cpu,
    );
    dm.setup().unwrap();

    let cfg = config(Path::new("."), false, false);
    let model = SegModel::new(ModelSpec::from_config(&cfg), &Device::Cpu).unwrap();
    let frozen = model.freeze().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut tracker = MemoryTracker::new();
    let err = predict_and_log(
        &frozen,
        &dm.val_dataloader().unwrap(),
        "Valid",
        &mut tracker,
        dir.path(),
        0,
    )
    .unwrap_err();
    assert!(matches!(err, TrainerError::EmptySplit { ref split } if split == "Valid"));
    assert!(tracker.images().is_empty());
    assert!(!dir.path().join("valid-predictions.png").exists());
}

#[test]
fn empty_test_split_fails_before_training() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 10);
    // 10 * 0.04 rounds to zero samples for both held-out splits.
    let toml = config_toml(dir.path(), false, false).replace("split_ratio = 0.2", "split_ratio = 0.04");
    let cfg = Config::from_toml_str(&toml).unwrap();
    let tracker = MemoryTracker::new();

    let err = run(&cfg, dir.path(), &mut tracker.clone()).unwrap_err();

    assert!(matches!(err, TrainerError::EmptySplit { ref split } if split == "test"), "{err}");
    assert!(tracker.events().is_empty(), "nothing is logged before the check");
}

#[test]
fn empty_valid_split_fails_only_when_artifacts_are_requested() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 10);
    let explicit = "split_ratio = { valid = 0.0, test = 0.2 }";
    let toml = config_toml(dir.path(), true, false).replace("split_ratio = 0.2", explicit);
    let cfg = Config::from_toml_str(&toml).unwrap();
    let tracker = MemoryTracker::new();

    let err = run(&cfg, dir.path(), &mut tracker.clone()).unwrap_err();
    assert!(matches!(err, TrainerError::EmptySplit { ref split } if split == "valid"), "{err}");
    assert!(tracker.events().is_empty());
    assert!(!dir.path().join("artifacts").exists());
}

#[test]
fn mask_ids_beyond_the_model_are_rejected_at_load() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 10);
    // Three gray levels: not a {0, 255} binary mask, so ids stay as stored.
    let noisy = GrayImage::from_fn(16, 16, |x, _| Luma([(x % 3) as u8 * 100]));
    noisy.save(dir.path().join("data/sem/masks/s03.png")).unwrap();
    let cfg = config(dir.path(), false, false);
    let tracker = MemoryTracker::new();

    let err = run(&cfg, dir.path(), &mut tracker.clone()).unwrap_err();

    match err {
        TrainerError::Core(SemsegError::Dataset { reason, .. }) => {
            assert!(reason.contains("mask #3"), "{reason}");
            assert!(reason.contains("class id 200"), "{reason}");
        }
        other => panic!("expected a dataset error, got {other}"),
    }
    assert!(tracker.events().is_empty());
}
