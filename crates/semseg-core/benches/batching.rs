use candle_core::Device;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use image::{GrayImage, Luma};
use semseg_core::data::{DataModuleConfig, SemDataModule};
use semseg_core::split::split_data;

fn synthetic(n: usize, side: u32) -> (Vec<GrayImage>, Vec<GrayImage>) {
    let images = (0..n)
        .map(|i| GrayImage::from_fn(side, side, |x, y| Luma([((x + y + i as u32) % 256) as u8])))
        .collect();
    let masks = (0..n)
        .map(|_| GrayImage::from_fn(side, side, |x, _| Luma([(x > side / 2) as u8])))
        .collect();
    (images, masks)
}

fn bench_train_pass(c: &mut Criterion) {
    let (images, masks) = synthetic(64, 96);

    for workers in [0usize, 4] {
        let split = split_data(&images, &masks, 0.1, 0.1, 42).unwrap();
        let mut dm = SemDataModule::new(
            split,
            DataModuleConfig {
                batch_size: 8,
                num_workers: workers,
                image_size: (64, 64),
                seed: 42,
            },
            Device::Cpu,
        );
        dm.setup().unwrap();
        let loader = dm.train_dataloader().unwrap();

        c.bench_function(&format!("train_pass_resize_workers_{workers}"), |b| {
            b.iter(|| {
                for batch in &loader {
                    black_box(batch.unwrap());
                }
            });
        });
    }
}

fn bench_split(c: &mut Criterion) {
    let ids: Vec<usize> = (0..10_000).collect();
    c.bench_function("split_10k", |b| {
        b.iter(|| split_data(black_box(&ids), black_box(&ids), 0.2, 0.1, 7).unwrap());
    });
}

criterion_group!(benches, bench_train_pass, bench_split);
criterion_main!(benches);
