//! # Segmentation Model
//!
//! [`SegModel`] binds an architecture, encoder and loss to a trainable
//! weight store and exposes the per-stage step hooks the trainer drives.
//! [`FrozenSegModel`] is the inference-only twin used for prediction
//! rendering: its weights are detached copies and never receive gradients.

pub mod arch;
pub mod loss;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use tracing::debug;

use crate::config::{Architecture, Config, EncoderName, LossKind};
use crate::data::Batch;
use crate::error::{Result, SemsegError};
use crate::metrics::{ConfusionStats, RunningMean, StageMetrics};
use crate::scheduler::CosineAnnealing;

pub use arch::SegNet;

/// Grayscale SEM micrographs.
pub const IN_CHANNELS: usize = 1;

/// Everything needed to rebuild a model with identical parameter names.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSpec {
    pub architecture: Architecture,
    pub encoder: EncoderName,
    pub num_classes: usize,
    pub loss: LossKind,
    pub learning_rate: f64,
    pub use_scheduler: bool,
    pub num_epochs: usize,
}

impl ModelSpec {
    pub fn from_config(config: &Config) -> Self {
        Self {
            architecture: config.model.name,
            encoder: config.model.encoder,
            num_classes: config.model.num_classes,
            loss: config.loss.name,
            learning_rate: config.experiment.learning_rate,
            use_scheduler: config.experiment.use_scheduler,
            num_epochs: config.experiment.num_epochs,
        }
    }
}

/// Training, validation or test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Train,
    Validate,
    Test,
}

impl Stage {
    /// Metric-name prefix (`train_loss`, `val_iou`, ...).
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validate => "val",
            Self::Test => "test",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Train => 0,
            Self::Validate => 1,
            Self::Test => 2,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Result of one training step. `loss` still carries the autograd graph.
pub struct StepOutput {
    pub loss: Tensor,
    pub loss_value: f32,
}

#[derive(Debug, Clone)]
struct StageAccumulator {
    loss: RunningMean,
    confusion: ConfusionStats,
}

/// Anything whose weights can be written to a checkpoint file.
pub trait Checkpointable {
    fn save_checkpoint(&self, path: &Path) -> Result<()>;
}

/// Trainable segmentation model.
pub struct SegModel {
    spec: ModelSpec,
    varmap: VarMap,
    net: SegNet,
    device: Device,
    stages: [StageAccumulator; 3],
}

impl SegModel {
    pub fn new(spec: ModelSpec, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = SegNet::new(
            spec.architecture,
            spec.encoder,
            IN_CHANNELS,
            spec.num_classes,
            vb,
        )?;
        debug!(
            architecture = %spec.architecture,
            encoder = %spec.encoder,
            classes = spec.num_classes,
            params = varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            "model built"
        );
        let acc = StageAccumulator {
            loss: RunningMean::default(),
            confusion: ConfusionStats::new(spec.num_classes),
        };
        Ok(Self {
            spec,
            varmap,
            net,
            device: device.clone(),
            stages: [acc.clone(), acc.clone(), acc],
        })
    }

    /// Rebuild a model and load weights written by [`save`](Self::save).
    pub fn from_checkpoint(spec: ModelSpec, path: &Path, device: &Device) -> Result<Self> {
        let mut model = Self::new(spec, device)?;
        model.varmap.load(path)?;
        Ok(model)
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Per-pixel logits `[B, C, H, W]`.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        check_input(images, self.spec.encoder)?;
        Ok(self.net.forward(images)?)
    }

    /// Class map `[B, H, W]` (u32).
    pub fn predict(&self, images: &Tensor) -> Result<Tensor> {
        class_map(&self.forward(images)?)
    }

    pub fn training_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        let (loss, loss_value) = self.shared_step(batch, Stage::Train)?;
        Ok(StepOutput { loss, loss_value })
    }

    pub fn validation_step(&mut self, batch: &Batch) -> Result<f32> {
        Ok(self.shared_step(batch, Stage::Validate)?.1)
    }

    pub fn test_step(&mut self, batch: &Batch) -> Result<f32> {
        Ok(self.shared_step(batch, Stage::Test)?.1)
    }

    fn shared_step(&mut self, batch: &Batch, stage: Stage) -> Result<(Tensor, f32)> {
        let targets: Vec<u32> = batch.masks.flatten_all()?.to_vec1()?;
        let limit = self.spec.num_classes.max(2);
        if let Some(&class) = targets.iter().find(|&&t| t as usize >= limit) {
            return Err(SemsegError::Shape(format!(
                "mask class id {class} is out of range for {} class(es)",
                self.spec.num_classes
            )));
        }

        let logits = self.forward(&batch.images)?;
        let loss = loss::compute(self.spec.loss, &logits, &batch.masks)?;
        let loss_value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;

        let preds = class_map(&logits.detach())?;
        let preds: Vec<u32> = preds.flatten_all()?.to_vec1()?;

        let acc = &mut self.stages[stage.index()];
        acc.loss.push(loss_value as f64);
        acc.confusion.update(&preds, &targets);
        Ok((loss, loss_value))
    }

    /// Epoch summary for `stage`, or `None` when no step ran.
    pub fn epoch_metrics(&self, stage: Stage) -> Option<StageMetrics> {
        let acc = &self.stages[stage.index()];
        acc.loss.mean().map(|loss| StageMetrics {
            loss,
            iou: acc.confusion.iou(),
            accuracy: acc.confusion.accuracy(),
            batches: acc.loss.count(),
        })
    }

    pub fn reset_metrics(&mut self, stage: Stage) {
        let acc = &mut self.stages[stage.index()];
        acc.loss.reset();
        acc.confusion.reset();
    }

    /// AdamW over all weights, plus a cosine schedule when enabled.
    pub fn configure_optimizers(&self) -> Result<(AdamW, Option<CosineAnnealing>)> {
        let params = ParamsAdamW {
            lr: self.spec.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(self.varmap.all_vars(), params)?;
        let scheduler = self
            .spec
            .use_scheduler
            .then(|| CosineAnnealing::new(self.spec.learning_rate, self.spec.num_epochs));
        Ok((optimizer, scheduler))
    }

    /// Write all weights as safetensors.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Detached inference copy of the current weights.
    pub fn freeze(&self) -> Result<FrozenSegModel> {
        let tensors = {
            let data = self
                .varmap
                .data()
                .lock()
                .map_err(|e| SemsegError::Weights(e.to_string()))?;
            let mut tensors = HashMap::with_capacity(data.len());
            for (name, var) in data.iter() {
                tensors.insert(name.clone(), var.as_tensor().detach().copy()?);
            }
            tensors
        };
        FrozenSegModel::from_tensors(self.spec, tensors, &self.device)
    }
}

impl Checkpointable for SegModel {
    fn save_checkpoint(&self, path: &Path) -> Result<()> {
        self.save(path)
    }
}

/// Inference-only model with detached weights.
pub struct FrozenSegModel {
    spec: ModelSpec,
    net: SegNet,
}

impl FrozenSegModel {
    /// Load weights previously written by [`SegModel::save`].
    pub fn load(spec: ModelSpec, path: &Path, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)?;
        Self::from_tensors(spec, tensors, device)
    }

    fn from_tensors(
        spec: ModelSpec,
        tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let net = SegNet::new(
            spec.architecture,
            spec.encoder,
            IN_CHANNELS,
            spec.num_classes,
            vb,
        )?;
        Ok(Self { spec, net })
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        check_input(images, self.spec.encoder)?;
        Ok(self.net.forward(images)?)
    }

    pub fn predict(&self, images: &Tensor) -> Result<Tensor> {
        class_map(&self.forward(images)?)
    }
}

/// Argmax over classes, or `logit >= 0` for a single channel.
fn class_map(logits: &Tensor) -> Result<Tensor> {
    let preds = if logits.dim(1)? == 1 {
        logits
            .ge(&logits.zeros_like()?)?
            .squeeze(1)?
            .to_dtype(DType::U32)?
    } else {
        logits.argmax(1)?
    };
    Ok(preds)
}

fn check_input(images: &Tensor, encoder: EncoderName) -> Result<()> {
    let (_, c, h, w) = images.dims4()?;
    let factor = encoder.downsample_factor() as usize;
    if c != IN_CHANNELS {
        return Err(SemsegError::Shape(format!(
            "expected {IN_CHANNELS} input channel(s), got {c}"
        )));
    }
    if h % factor != 0 || w % factor != 0 {
        return Err(SemsegError::Shape(format!(
            "image size {h}x{w} is not divisible by {factor} for encoder {encoder}"
        )));
    }
    Ok(())
}
