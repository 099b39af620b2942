use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while configuring data and models.
#[derive(Debug, Error)]
pub enum SemsegError {
    /// The configuration file could not be parsed or is missing keys.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A command-line override could not be applied.
    #[error("invalid override {override_arg:?}: {reason}")]
    Override {
        /// The raw `key=value` argument.
        override_arg: String,
        /// Why the override was rejected.
        reason: String,
    },

    /// The dataset directory is malformed.
    #[error("dataset error at {path}: {reason}")]
    Dataset {
        /// Offending path.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// Images and masks do not line up.
    #[error("length mismatch: {images} images vs {masks} masks")]
    LengthMismatch { images: usize, masks: usize },

    /// Split ratios cannot partition the dataset.
    #[error("invalid split ratios: valid={valid}, test={test}")]
    InvalidRatios { valid: f64, test: f64 },

    /// A batch provider was requested before `setup`.
    #[error("data module has not been set up")]
    NotSetUp,

    /// A split produced no batches where one was required.
    #[error("split {split:?} has no samples")]
    EmptySplit { split: String },

    /// Shapes disagree with the model definition.
    #[error("shape error: {0}")]
    Shape(String),

    /// The weight store could not be read.
    #[error("model weights unavailable: {0}")]
    Weights(String),

    /// The requested accelerator could not be opened.
    #[error("device error: {0}")]
    Device(String),

    /// Candle ML framework error.
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Image decode/encode failure.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The rayon worker pool could not be built.
    #[error("worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Result type alias for semseg-core operations.
pub type Result<T> = std::result::Result<T, SemsegError>;
