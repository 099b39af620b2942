//! Prediction snapshots uploaded as run artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use semseg_core::FrozenSegModel;
use semseg_core::data::BatchLoader;
use semseg_tracking::Tracker;
use tracing::info;

use crate::error::{Result, TrainerError};
use crate::viz::render_grid;

/// Tracker key under which prediction grids are uploaded.
pub const PREDICTIONS_KEY: &str = "predictions";

/// `<artifact_dir>/<title lowercase>-predictions.png`
pub fn predictions_path(artifact_dir: &Path, title: &str) -> PathBuf {
    artifact_dir.join(format!("{}-predictions.png", title.to_lowercase()))
}

/// Predict one batch from `loader`, render it and upload it to `tracker`.
///
/// Returns the path of the written image.
pub fn predict_and_log(
    model: &FrozenSegModel,
    loader: &BatchLoader,
    title: &str,
    tracker: &mut dyn Tracker,
    artifact_dir: &Path,
    step: u64,
) -> Result<PathBuf> {
    let batch = loader
        .iter()
        .next()
        .ok_or_else(|| TrainerError::EmptySplit {
            split: title.to_string(),
        })??;

    let preds = model.predict(&batch.images)?;
    let grid = render_grid(&batch.images, &batch.masks, &preds)?;

    fs::create_dir_all(artifact_dir)?;
    let path = predictions_path(artifact_dir, title);
    grid.save(&path)?;
    drop(grid);

    tracker.log_image(PREDICTIONS_KEY, &path, step)?;
    info!(title, samples = batch.len(), path = %path.display(), "predictions logged");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predictions_path_lowercases_title() {
        assert_eq!(
            predictions_path(Path::new("artifacts"), "Valid"),
            PathBuf::from("artifacts/valid-predictions.png")
        );
    }
}
