//! # SemSeg Core
//!
//! Building blocks for training semantic-segmentation models on scanning
//! electron microscope (SEM) images: run configuration, dataset loading and
//! splitting, batched data providers, UNet/LinkNet models with their losses,
//! and epoch metrics.
//!
//! ## Quick Start
//!
//! ```rust
//! use semseg_core::split::split_data;
//!
//! let images: Vec<u32> = (0..100).collect();
//! let masks: Vec<u32> = (0..100).collect();
//! let split = split_data(&images, &masks, 0.2, 0.1, 42).unwrap();
//!
//! assert_eq!(split.sizes(), (70, 20, 10));
//! ```
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod io;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod split;

// Re-export primary API
pub use config::{
    Accelerator, Architecture, Config, Devices, EncoderName, FailurePolicy, LossKind,
    TrackingConfig,
};
pub use data::{Batch, BatchLoader, DataModuleConfig, SemDataModule};
pub use device::resolve_device;
pub use error::{Result, SemsegError};
pub use io::{check_mask_classes, load_data};
pub use metrics::{ConfusionStats, StageMetrics};
pub use model::{Checkpointable, FrozenSegModel, ModelSpec, SegModel, Stage, StepOutput};
pub use scheduler::CosineAnnealing;
pub use split::{DatasetSplit, split_data};
