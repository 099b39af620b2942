use semseg_core::SemsegError;
use semseg_tracking::TrackingError;
use thiserror::Error;

/// Errors raised while orchestrating a run.
#[derive(Debug, Error)]
pub enum TrainerError {
    #[error(transparent)]
    Core(#[from] SemsegError),

    #[error("tracking error: {0}")]
    Tracking(#[from] TrackingError),

    /// A split that must yield at least one batch yielded none.
    #[error("split {split:?} has no samples")]
    EmptySplit { split: String },

    /// The optimizer failed to apply gradients.
    #[error("optimization step {step} failed: {source}")]
    OptimizerStep {
        step: u64,
        #[source]
        source: candle_core::Error,
    },

    /// A checkpoint could not be written or evicted.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for trainer operations.
pub type Result<T> = std::result::Result<T, TrainerError>;
