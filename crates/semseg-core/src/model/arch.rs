//! Encoder-decoder networks.
//!
//! Both architectures share the same encoder: a stack of double-conv
//! stages separated by 2x max pooling. They differ in how the decoder
//! merges skip connections: UNet concatenates along channels, LinkNet adds.

use candle_core::{Module, Result, Tensor};
use candle_nn::{
    Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, VarBuilder, conv_transpose2d,
    conv2d,
};

use crate::config::{Architecture, EncoderName};

struct ConvBlock {
    first: Conv2d,
    second: Conv2d,
}

impl ConvBlock {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            first: conv2d(in_channels, out_channels, 3, cfg, vb.pp("conv1"))?,
            second: conv2d(out_channels, out_channels, 3, cfg, vb.pp("conv2"))?,
        })
    }
}

impl Module for ConvBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.first)?.relu()?.apply(&self.second)?.relu()
    }
}

struct DecoderStage {
    up: ConvTranspose2d,
    block: ConvBlock,
}

/// Segmentation network producing per-pixel logits `[B, C, H, W]`.
pub struct SegNet {
    architecture: Architecture,
    encoder: Vec<ConvBlock>,
    decoder: Vec<DecoderStage>,
    head: Conv2d,
}

impl SegNet {
    pub fn new(
        architecture: Architecture,
        encoder: EncoderName,
        in_channels: usize,
        num_classes: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let widths = encoder.widths();

        let mut stages = Vec::with_capacity(widths.len());
        let mut channels = in_channels;
        for (i, &width) in widths.iter().enumerate() {
            stages.push(ConvBlock::new(channels, width, vb.pp("encoder").pp(i))?);
            channels = width;
        }

        let up_cfg = ConvTranspose2dConfig {
            stride: 2,
            ..Default::default()
        };
        let mut decoder = Vec::with_capacity(widths.len() - 1);
        for (k, i) in (0..widths.len() - 1).rev().enumerate() {
            let vb = vb.pp("decoder").pp(k);
            let up = conv_transpose2d(widths[i + 1], widths[i], 2, up_cfg, vb.pp("up"))?;
            let merged = match architecture {
                Architecture::Unet => 2 * widths[i],
                Architecture::Linknet => widths[i],
            };
            decoder.push(DecoderStage {
                up,
                block: ConvBlock::new(merged, widths[i], vb.pp("block"))?,
            });
        }

        let head = conv2d(widths[0], num_classes, 1, Default::default(), vb.pp("head"))?;

        Ok(Self {
            architecture,
            encoder: stages,
            decoder,
            head,
        })
    }
}

impl Module for SegNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut skips = Vec::with_capacity(self.encoder.len());
        let mut x = xs.clone();
        for (i, stage) in self.encoder.iter().enumerate() {
            if i > 0 {
                x = x.max_pool2d(2)?;
            }
            x = stage.forward(&x)?;
            skips.push(x.clone());
        }

        for (stage, skip) in self.decoder.iter().zip(skips.iter().rev().skip(1)) {
            let up = stage.up.forward(&x)?;
            let merged = match self.architecture {
                Architecture::Unet => Tensor::cat(&[&up, skip], 1)?,
                Architecture::Linknet => up.add(skip)?,
            };
            x = stage.block.forward(&merged)?;
        }

        self.head.forward(&x)
    }
}
