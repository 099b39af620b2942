//! # SemSeg
//!
//! Umbrella crate for SEM segmentation training.
//!
//! - [`semseg_core`]: configuration, dataset loading, splitting, batching and models
//! - [`semseg_tracking`]: MLflow, Weights & Biases and offline run tracking
//! - [`semseg_trainer`]: the fit/test loop, callbacks and prediction artifacts
//!
//! ```no_run
//! use std::path::Path;
//!
//! use semseg::Config;
//! use semseg::semseg_tracking::{Tracker, open_sessions};
//!
//! let config = Config::load(Path::new("configs"), "config", &[])?;
//! let mut sessions = open_sessions(&config)?;
//! let report = semseg::run(&config, Path::new("."), &mut sessions)?;
//! sessions.finish()?;
//! println!("test iou {:.3}", report.test.iou);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub use semseg_core;
pub use semseg_tracking;
pub use semseg_trainer;

pub use semseg_core::{Config, SegModel, SemsegError};
pub use semseg_trainer::{RunReport, run};
