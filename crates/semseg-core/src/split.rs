//! Deterministic train/valid/test partitioning.

use crate::config::check_ratios;
use crate::error::{Result, SemsegError};

/// Six index-aligned collections produced by [`split_data`].
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSplit<T> {
    pub train_images: Vec<T>,
    pub valid_images: Vec<T>,
    pub test_images: Vec<T>,
    pub train_masks: Vec<T>,
    pub valid_masks: Vec<T>,
    pub test_masks: Vec<T>,
}

impl<T> DatasetSplit<T> {
    /// `(train, valid, test)` sizes.
    pub fn sizes(&self) -> (usize, usize, usize) {
        (
            self.train_images.len(),
            self.valid_images.len(),
            self.test_images.len(),
        )
    }
}

/// Number of `(valid, test)` items for `n` samples.
///
/// Both counts are rounded against the full size; train receives the rest.
pub fn split_sizes(n: usize, valid_ratio: f64, test_ratio: f64) -> (usize, usize) {
    let n_test = ((n as f64) * test_ratio).round() as usize;
    let n_test = n_test.min(n);
    let n_valid = ((n as f64) * valid_ratio).round() as usize;
    let n_valid = n_valid.min(n - n_test);
    (n_valid, n_test)
}

/// Seeded Fisher-Yates permutation of `0..n`.
pub fn permutation(n: usize, seed: u64) -> Vec<usize> {
    let mut rng = oorandom::Rand64::new(seed as u128);
    let mut indices: Vec<usize> = (0..n).collect();
    for i in (1..n).rev() {
        let j = rng.rand_range(0..(i as u64 + 1)) as usize;
        indices.swap(i, j);
    }
    indices
}

/// Partition images and masks into train/valid/test with a fixed seed.
pub fn split_data<T: Clone>(
    images: &[T],
    masks: &[T],
    valid_ratio: f64,
    test_ratio: f64,
    seed: u64,
) -> Result<DatasetSplit<T>> {
    if images.len() != masks.len() {
        return Err(SemsegError::LengthMismatch {
            images: images.len(),
            masks: masks.len(),
        });
    }
    check_ratios(valid_ratio, test_ratio)?;

    let n = images.len();
    let (n_valid, n_test) = split_sizes(n, valid_ratio, test_ratio);
    let order = permutation(n, seed);

    let (test_idx, rest) = order.split_at(n_test);
    let (valid_idx, train_idx) = rest.split_at(n_valid);

    let take = |idx: &[usize], source: &[T]| -> Vec<T> {
        idx.iter().map(|&i| source[i].clone()).collect()
    };

    let split = DatasetSplit {
        train_images: take(train_idx, images),
        valid_images: take(valid_idx, images),
        test_images: take(test_idx, images),
        train_masks: take(train_idx, masks),
        valid_masks: take(valid_idx, masks),
        test_masks: take(test_idx, masks),
    };

    let (tr, va, te) = split.sizes();
    tracing::info!(train = tr, valid = va, test = te, seed, "dataset split");
    Ok(split)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(n: usize) -> (Vec<usize>, Vec<usize>) {
        let images: Vec<usize> = (0..n).collect();
        // Mask i belongs to image i; offset keeps the two collections distinct.
        let masks: Vec<usize> = (0..n).map(|i| i + 1000).collect();
        (images, masks)
    }

    #[test]
    fn test_scenario_100_items() {
        let (images, masks) = pairs(100);
        let split = split_data(&images, &masks, 0.2, 0.1, 7).unwrap();
        assert_eq!(split.sizes(), (70, 20, 10));
    }

    #[test]
    fn test_sizes_sum_and_alignment() {
        for n in [0usize, 1, 2, 3, 9, 10, 37, 101] {
            for (valid, test) in [(0.0, 0.0), (0.1, 0.1), (0.25, 0.15), (0.33, 0.33), (0.0, 0.5)] {
                let (images, masks) = pairs(n);
                let split = split_data(&images, &masks, valid, test, 3).unwrap();
                let (tr, va, te) = split.sizes();
                assert_eq!(tr + va + te, n, "n={n} valid={valid} test={test}");

                let groups = [
                    (&split.train_images, &split.train_masks),
                    (&split.valid_images, &split.valid_masks),
                    (&split.test_images, &split.test_masks),
                ];
                let mut seen = Vec::new();
                for (imgs, msks) in groups {
                    assert_eq!(imgs.len(), msks.len());
                    for (img, msk) in imgs.iter().zip(msks.iter()) {
                        assert_eq!(img + 1000, *msk);
                        seen.push(*img);
                    }
                }
                seen.sort_unstable();
                assert_eq!(seen, images, "splits must not overlap");
            }
        }
    }

    #[test]
    fn test_deterministic_per_seed() {
        let (images, masks) = pairs(50);
        let a = split_data(&images, &masks, 0.2, 0.2, 11).unwrap();
        let b = split_data(&images, &masks, 0.2, 0.2, 11).unwrap();
        assert_eq!(a, b);

        let c = split_data(&images, &masks, 0.2, 0.2, 12).unwrap();
        assert_ne!(a.train_images, c.train_images);
    }

    #[test]
    fn test_invalid_inputs() {
        let (images, masks) = pairs(10);
        assert!(matches!(
            split_data(&images, &masks[..9], 0.1, 0.1, 0),
            Err(SemsegError::LengthMismatch { images: 10, masks: 9 })
        ));
        assert!(matches!(
            split_data(&images, &masks, 0.5, 0.5, 0),
            Err(SemsegError::InvalidRatios { .. })
        ));
        assert!(split_data(&images, &masks, -0.1, 0.1, 0).is_err());
        assert!(split_data(&images, &masks, f64::NAN, 0.1, 0).is_err());
    }

    #[test]
    fn test_permutation_is_permutation() {
        let mut p = permutation(64, 99);
        p.sort_unstable();
        assert_eq!(p, (0..64).collect::<Vec<_>>());
    }
}
