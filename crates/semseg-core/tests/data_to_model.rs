//! Disk dataset through split, batching and one optimisation step.

use std::path::Path;

use candle_core::Device;
use candle_nn::Optimizer;
use image::{GrayImage, Luma};
use semseg_core::config::{Architecture, EncoderName, LossKind};
use semseg_core::data::{DataModuleConfig, SemDataModule};
use semseg_core::model::{ModelSpec, SegModel, Stage};
use semseg_core::{load_data, split_data};

fn write_dataset(root: &Path, n: usize) {
    std::fs::create_dir_all(root.join("images")).unwrap();
    std::fs::create_dir_all(root.join("masks")).unwrap();
    for i in 0..n {
        let image = GrayImage::from_fn(20, 20, |x, y| Luma([((x * 7 + y * 3 + i as u32) % 256) as u8]));
        let mask = GrayImage::from_fn(20, 20, |x, _| Luma([if x >= 10 { 255 } else { 0 }]));
        image.save(root.join("images").join(format!("img_{i:03}.png"))).unwrap();
        mask.save(root.join("masks").join(format!("img_{i:03}.png"))).unwrap();
    }
}

#[test]
fn dataset_on_disk_trains_one_epoch() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 10);

    let (images, masks) = load_data(dir.path()).unwrap();
    assert_eq!(images.len(), 10);
    let split = split_data(&images, &masks, 0.2, 0.2, 42).unwrap();
    assert_eq!(split.sizes(), (6, 2, 2));

    let mut dm = SemDataModule::new(
        split,
        DataModuleConfig {
            batch_size: 4,
            num_workers: 2,
            image_size: (16, 16),
            seed: 42,
        },
        Device::Cpu,
    );
    dm.setup().unwrap();

    let spec = ModelSpec {
        architecture: Architecture::Linknet,
        encoder: EncoderName::Tiny,
        num_classes: 1,
        loss: LossKind::Dice,
        learning_rate: 1e-3,
        use_scheduler: false,
        num_epochs: 1,
    };
    let mut model = SegModel::new(spec, &Device::Cpu).unwrap();
    let (mut opt, scheduler) = model.configure_optimizers().unwrap();
    assert!(scheduler.is_none());

    for batch in &dm.train_dataloader().unwrap() {
        let out = model.training_step(&batch.unwrap()).unwrap();
        opt.backward_step(&out.loss).unwrap();
    }
    for batch in &dm.val_dataloader().unwrap() {
        model.validation_step(&batch.unwrap()).unwrap();
    }

    let train = model.epoch_metrics(Stage::Train).unwrap();
    assert_eq!(train.batches, 2);
    assert!(train.loss.is_finite());
    let val = model.epoch_metrics(Stage::Validate).unwrap();
    assert!((0.0..=1.0).contains(&val.iou));
    assert!(model.epoch_metrics(Stage::Test).is_none());
}
