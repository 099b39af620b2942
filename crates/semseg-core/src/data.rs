//! # Data Module
//!
//! Wraps the six split collections into restartable batch providers.
//! Batches are resized to the configured image size and, for the train
//! split, reshuffled on every pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::{Device, Tensor};
use image::GrayImage;
use image::imageops::{self, FilterType};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::error::{Result, SemsegError};
use crate::split::{DatasetSplit, permutation};

/// One batch: images `[B, 1, H, W]` (f32 in `[0, 1]`) and masks `[B, H, W]` (u32 class ids).
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub masks: Tensor,
}

impl Batch {
    /// Leading dimension shared by images and masks.
    pub fn len(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Batching parameters shared by all three providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataModuleConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    /// `(height, width)`
    pub image_size: (u32, u32),
    /// Base seed for train-split shuffling.
    pub seed: u64,
}

#[derive(Debug)]
struct SplitSamples {
    images: Vec<GrayImage>,
    masks: Vec<GrayImage>,
}

#[derive(Clone)]
struct Providers {
    train: Arc<SplitSamples>,
    valid: Arc<SplitSamples>,
    test: Arc<SplitSamples>,
    pool: Option<Arc<ThreadPool>>,
}

/// Owns the split collections and hands out batch providers after [`setup`](Self::setup).
pub struct SemDataModule {
    split: Arc<DatasetSplit<GrayImage>>,
    config: DataModuleConfig,
    device: Device,
    providers: Option<Providers>,
}

impl SemDataModule {
    pub fn new(split: DatasetSplit<GrayImage>, config: DataModuleConfig, device: Device) -> Self {
        Self {
            split: Arc::new(split),
            config,
            device,
            providers: None,
        }
    }

    pub fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    /// `(train, valid, test)` sample counts.
    pub fn split_sizes(&self) -> (usize, usize, usize) {
        self.split.sizes()
    }

    /// Materialise the per-split providers. Safe to call more than once.
    pub fn setup(&mut self) -> Result<()> {
        if self.providers.is_some() {
            debug!("data module already set up");
            return Ok(());
        }

        let pool = if self.config.num_workers > 0 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(self.config.num_workers)
                .thread_name(|i| format!("semseg-loader-{i}"))
                .build()?;
            Some(Arc::new(pool))
        } else {
            None
        };

        let split = &self.split;
        self.providers = Some(Providers {
            train: Arc::new(SplitSamples {
                images: split.train_images.clone(),
                masks: split.train_masks.clone(),
            }),
            valid: Arc::new(SplitSamples {
                images: split.valid_images.clone(),
                masks: split.valid_masks.clone(),
            }),
            test: Arc::new(SplitSamples {
                images: split.test_images.clone(),
                masks: split.test_masks.clone(),
            }),
            pool,
        });
        debug!(workers = self.config.num_workers, "data module set up");
        Ok(())
    }

    pub fn train_dataloader(&self) -> Result<BatchLoader> {
        let p = self.providers.as_ref().ok_or(SemsegError::NotSetUp)?;
        Ok(self.loader(p.train.clone(), p.pool.clone(), true))
    }

    pub fn val_dataloader(&self) -> Result<BatchLoader> {
        let p = self.providers.as_ref().ok_or(SemsegError::NotSetUp)?;
        Ok(self.loader(p.valid.clone(), p.pool.clone(), false))
    }

    pub fn test_dataloader(&self) -> Result<BatchLoader> {
        let p = self.providers.as_ref().ok_or(SemsegError::NotSetUp)?;
        Ok(self.loader(p.test.clone(), p.pool.clone(), false))
    }

    fn loader(
        &self,
        samples: Arc<SplitSamples>,
        pool: Option<Arc<ThreadPool>>,
        shuffle: bool,
    ) -> BatchLoader {
        BatchLoader {
            samples,
            batch_size: self.config.batch_size.max(1),
            image_size: self.config.image_size,
            shuffle,
            seed: self.config.seed,
            pool,
            device: self.device.clone(),
            passes: AtomicU64::new(0),
        }
    }
}

/// A finite, restartable batch provider for one split.
pub struct BatchLoader {
    samples: Arc<SplitSamples>,
    batch_size: usize,
    image_size: (u32, u32),
    shuffle: bool,
    seed: u64,
    pool: Option<Arc<ThreadPool>>,
    device: Device,
    passes: AtomicU64,
}

impl BatchLoader {
    pub fn num_samples(&self) -> usize {
        self.samples.images.len()
    }

    /// Number of batches per pass (the last one may be short).
    pub fn len(&self) -> usize {
        self.num_samples().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Start a new pass over the split.
    pub fn iter(&self) -> Batches<'_> {
        let pass = self.passes.fetch_add(1, Ordering::Relaxed);
        let n = self.num_samples();
        let order = if self.shuffle {
            permutation(n, self.seed.wrapping_add(pass))
        } else {
            (0..n).collect()
        };
        Batches {
            loader: self,
            order,
            cursor: 0,
        }
    }

    fn assemble(&self, indices: &[usize]) -> Result<Batch> {
        let (h, w) = self.image_size;
        let prepare = |&i: &usize| prepare_sample(&self.samples, i, h, w);
        let prepared: Vec<(Vec<f32>, Vec<u32>)> = match &self.pool {
            Some(pool) => pool.install(|| indices.par_iter().map(prepare).collect()),
            None => indices.iter().map(prepare).collect(),
        };

        let b = prepared.len();
        let (h, w) = (h as usize, w as usize);
        let mut images = Vec::with_capacity(b * h * w);
        let mut masks = Vec::with_capacity(b * h * w);
        for (img, mask) in prepared {
            images.extend_from_slice(&img);
            masks.extend_from_slice(&mask);
        }

        Ok(Batch {
            images: Tensor::from_vec(images, (b, 1, h, w), &self.device)?,
            masks: Tensor::from_vec(masks, (b, h, w), &self.device)?,
        })
    }
}

impl<'a> IntoIterator for &'a BatchLoader {
    type Item = Result<Batch>;
    type IntoIter = Batches<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over one pass of a [`BatchLoader`].
pub struct Batches<'a> {
    loader: &'a BatchLoader,
    order: Vec<usize>,
    cursor: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;
        Some(self.loader.assemble(indices))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.cursor).div_ceil(self.loader.batch_size);
        (left, Some(left))
    }
}

fn prepare_sample(samples: &SplitSamples, i: usize, h: u32, w: u32) -> (Vec<f32>, Vec<u32>) {
    let image = &samples.images[i];
    let mask = &samples.masks[i];

    let image = if image.dimensions() == (w, h) {
        image.clone()
    } else {
        imageops::resize(image, w, h, FilterType::Triangle)
    };
    let mask = if mask.dimensions() == (w, h) {
        mask.clone()
    } else {
        imageops::resize(mask, w, h, FilterType::Nearest)
    };

    let pixels = image.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
    let classes = mask.as_raw().iter().map(|&v| v as u32).collect();
    (pixels, classes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::split_data;
    use image::Luma;

    fn module(n: usize, batch_size: usize, workers: usize) -> SemDataModule {
        let images: Vec<GrayImage> = (0..n)
            .map(|i| GrayImage::from_pixel(6, 4, Luma([i as u8])))
            .collect();
        let masks: Vec<GrayImage> = (0..n)
            .map(|i| GrayImage::from_pixel(6, 4, Luma([(i % 2) as u8])))
            .collect();
        let split = split_data(&images, &masks, 0.2, 0.2, 5).unwrap();
        SemDataModule::new(
            split,
            DataModuleConfig {
                batch_size,
                num_workers: workers,
                image_size: (8, 8),
                seed: 5,
            },
            Device::Cpu,
        )
    }

    #[test]
    fn test_accessors_require_setup() {
        let dm = module(10, 2, 0);
        assert!(matches!(dm.train_dataloader(), Err(SemsegError::NotSetUp)));
    }

    #[test]
    fn test_batch_shapes_and_short_last_batch() {
        let mut dm = module(20, 5, 2);
        dm.setup().unwrap();
        let train = dm.train_dataloader().unwrap();
        assert_eq!(train.num_samples(), 12);
        assert_eq!(train.len(), 3);

        let mut sizes = Vec::new();
        for batch in &train {
            let batch = batch.unwrap();
            assert_eq!(batch.images.dims()[0], batch.masks.dims()[0]);
            assert_eq!(batch.images.dims(), &[batch.len(), 1, 8, 8]);
            assert_eq!(batch.masks.dims(), &[batch.len(), 8, 8]);
            assert!(batch.len() <= 5);
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![5, 5, 2]);
    }

    #[test]
    fn test_setup_twice_is_stable() {
        let mut dm = module(15, 4, 0);
        dm.setup().unwrap();
        let first: Vec<Vec<f32>> = dm
            .val_dataloader()
            .unwrap()
            .iter()
            .map(|b| b.unwrap().images.flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        dm.setup().unwrap();
        let second: Vec<Vec<f32>> = dm
            .val_dataloader()
            .unwrap()
            .iter()
            .map(|b| b.unwrap().images.flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_train_reshuffles_between_passes() {
        let mut dm = module(40, 24, 0);
        dm.setup().unwrap();
        let train = dm.train_dataloader().unwrap();
        let first_pixels = |batch: Batch| -> Vec<f32> {
            let v: Vec<f32> = batch.images.flatten_all().unwrap().to_vec1().unwrap();
            v.chunks(64).map(|c| c[0]).collect()
        };
        let a = first_pixels(train.iter().next().unwrap().unwrap());
        let b = first_pixels(train.iter().next().unwrap().unwrap());
        assert_ne!(a, b);

        // A fresh provider replays the same order.
        let again = dm.train_dataloader().unwrap();
        let c = first_pixels(again.iter().next().unwrap().unwrap());
        assert_eq!(a, c);
    }

    #[test]
    fn test_masks_resized_with_nearest() {
        let mut dm = module(10, 10, 0);
        dm.setup().unwrap();
        for batch in &dm.train_dataloader().unwrap() {
            let masks: Vec<u32> = batch.unwrap().masks.flatten_all().unwrap().to_vec1().unwrap();
            assert!(masks.iter().all(|&m| m <= 1));
        }
    }
}
