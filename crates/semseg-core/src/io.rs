//! Dataset loading for SEM images and their masks.
//!
//! Expected layout:
//!
//! ```text
//! <dataset>/images/<stem>.<ext>
//! <dataset>/masks/<stem>.<ext>
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::GrayImage;
use tracing::{debug, info};

use crate::error::{Result, SemsegError};

pub const IMAGES_SUBDIR: &str = "images";
pub const MASKS_SUBDIR: &str = "masks";

/// File extensions accepted for both images and masks.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "tif", "tiff", "jpg", "jpeg", "bmp"];

/// Load every image/mask pair under `dataset_path`, ordered by file stem.
pub fn load_data<P: AsRef<Path>>(dataset_path: P) -> Result<(Vec<GrayImage>, Vec<GrayImage>)> {
    let root = dataset_path.as_ref();
    let image_files = index_dir(&root.join(IMAGES_SUBDIR))?;
    let mask_files = index_dir(&root.join(MASKS_SUBDIR))?;

    if image_files.is_empty() {
        return Err(SemsegError::Dataset {
            path: root.join(IMAGES_SUBDIR),
            reason: "no images found".into(),
        });
    }

    let mut images = Vec::with_capacity(image_files.len());
    let mut masks = Vec::with_capacity(image_files.len());

    for (stem, image_path) in &image_files {
        let mask_path = mask_files.get(stem).ok_or_else(|| SemsegError::Dataset {
            path: image_path.clone(),
            reason: format!("no mask named {stem:?} in {MASKS_SUBDIR}/"),
        })?;

        let image = image::open(image_path)?.to_luma8();
        let mask = load_mask(mask_path)?;
        if image.dimensions() != mask.dimensions() {
            return Err(SemsegError::Dataset {
                path: mask_path.clone(),
                reason: format!(
                    "mask is {:?} but image is {:?}",
                    mask.dimensions(),
                    image.dimensions()
                ),
            });
        }
        images.push(image);
        masks.push(mask);
    }

    let orphans = mask_files.len().saturating_sub(images.len());
    if orphans > 0 {
        debug!(orphans, "masks without a matching image were ignored");
    }
    info!(samples = images.len(), path = %root.display(), "loaded dataset");
    Ok((images, masks))
}

/// Decode a mask as a class-index map. Binary masks stored as {0, 255} map to {0, 1}.
pub fn load_mask<P: AsRef<Path>>(path: P) -> Result<GrayImage> {
    let mut mask = image::open(path.as_ref())?.to_luma8();
    if is_binary_255(&mask) {
        for p in mask.pixels_mut() {
            if p.0[0] == 255 {
                p.0[0] = 1;
            }
        }
    }
    Ok(mask)
}

/// Reject masks holding class ids the model cannot predict.
///
/// Binary models (`num_classes == 1`) accept ids `{0, 1}`; multiclass models
/// accept `0..num_classes`. `masks` is in the order returned by [`load_data`].
pub fn check_mask_classes(dataset_path: &Path, masks: &[GrayImage], num_classes: usize) -> Result<()> {
    let limit = num_classes.max(2);
    for (i, mask) in masks.iter().enumerate() {
        let Some(&max) = mask.as_raw().iter().max() else {
            continue;
        };
        if usize::from(max) >= limit {
            return Err(SemsegError::Dataset {
                path: dataset_path.join(MASKS_SUBDIR),
                reason: format!(
                    "mask #{i} (sorted by name) contains class id {max}, but the model \
                     predicts ids below {limit}; binary masks must be {{0, 1}} or {{0, 255}}"
                ),
            });
        }
    }
    debug!(masks = masks.len(), limit, "mask class ids checked");
    Ok(())
}

fn is_binary_255(mask: &GrayImage) -> bool {
    let mut saw_255 = false;
    for p in mask.pixels() {
        match p.0[0] {
            0 => {}
            255 => saw_255 = true,
            _ => return false,
        }
    }
    saw_255
}

fn index_dir(dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
    if !dir.is_dir() {
        return Err(SemsegError::Dataset {
            path: dir.to_path_buf(),
            reason: "directory not found".into(),
        });
    }

    let mut files = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !supported {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(previous) = files.insert(stem.to_string(), path.clone()) {
            return Err(SemsegError::Dataset {
                path,
                reason: format!("duplicate stem, also found {}", previous.display()),
            });
        }
    }
    Ok(files)
}
