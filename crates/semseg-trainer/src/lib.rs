//! # SemSeg Trainer
//!
//! Orchestrates a segmentation run: fit with per-epoch validation, test,
//! and prediction artifacts. Callbacks mirror the usual trio of learning
//! rate monitoring, early stopping on `val_loss` and top-3 checkpointing.
pub mod artifact;
pub mod callbacks;
pub mod error;
pub mod pipeline;
pub mod trainer;
pub mod viz;

// Re-export primary API
pub use artifact::{PREDICTIONS_KEY, predict_and_log};
pub use callbacks::{EarlyStopping, LearningRateMonitor, ModelCheckpoint, Signal};
pub use error::{Result, TrainerError};
pub use pipeline::{CHECKPOINT_ARTIFACT, MODEL_ARTIFACT, RunReport, run};
pub use trainer::{EpochMetrics, FitSummary, Trainer, TrainerConfig};
