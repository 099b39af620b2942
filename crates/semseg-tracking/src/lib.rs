//! # SemSeg Tracking
//!
//! Experiment tracking for segmentation runs. Two sessions are opened per
//! run, one MLflow and one Weights & Biases, and driven together through a
//! [`TrackerFanout`]. With `tracking.offline = true` both sessions write to
//! the local filesystem instead.
pub mod error;
pub mod fanout;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod mlflow;
pub mod offline;
pub mod session;
pub mod tracker;
pub mod wandb;

// Re-export primary API
pub use error::{Result, TrackingError};
pub use fanout::TrackerFanout;
#[cfg(any(test, feature = "testing"))]
pub use memory::{Event, MemoryTracker};
pub use mlflow::MlflowTracker;
pub use offline::{OfflineTracker, RunMeta};
pub use session::open_sessions;
pub use tracker::{Metrics, Tracker};
pub use wandb::{WandbSettings, WandbTracker};
