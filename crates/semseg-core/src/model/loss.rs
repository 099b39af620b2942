//! Segmentation losses over logits `[B, C, H, W]` and masks `[B, H, W]`.
//!
//! A single output channel means binary segmentation: sigmoid activation,
//! mask values are the foreground probability. Otherwise softmax over `C`.

use candle_core::{DType, Result, Tensor, bail};

use crate::config::LossKind;

const EPS: f64 = 1e-7;

/// Scalar loss for a batch.
pub fn compute(kind: LossKind, logits: &Tensor, masks: &Tensor) -> Result<Tensor> {
    let num_classes = logits.dim(1)?;
    let binary = num_classes == 1;
    match kind {
        LossKind::CrossEntropy if binary => {
            bail!("cross_entropy needs at least two classes, use bce for binary masks")
        }
        LossKind::CrossEntropy => cross_entropy(logits, masks),
        LossKind::Bce if !binary => bail!("bce needs a single output channel"),
        LossKind::Bce => binary_cross_entropy(logits, &one_hot(masks, 1)?)?.mean_all(),
        LossKind::Dice => soft_overlap(logits, masks, false),
        LossKind::Jaccard => soft_overlap(logits, masks, true),
        LossKind::Focal => focal(logits, masks),
    }
}

/// Per-pixel class probabilities.
pub fn probabilities(logits: &Tensor) -> Result<Tensor> {
    if logits.dim(1)? == 1 {
        sigmoid(logits)
    } else {
        candle_nn::ops::softmax(logits, 1)
    }
}

fn sigmoid(xs: &Tensor) -> Result<Tensor> {
    xs.neg()?.exp()?.affine(1.0, 1.0)?.recip()
}

/// `[B, H, W]` class ids to `[B, C, H, W]` f32 indicators.
fn one_hot(masks: &Tensor, num_classes: usize) -> Result<Tensor> {
    if num_classes == 1 {
        return masks.to_dtype(DType::F32)?.unsqueeze(1);
    }
    let classes = Tensor::arange(0u32, num_classes as u32, masks.device())?
        .reshape((1, num_classes, 1, 1))?;
    masks
        .unsqueeze(1)?
        .broadcast_eq(&classes)?
        .to_dtype(DType::F32)
}

fn cross_entropy(logits: &Tensor, masks: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = logits.dims4()?;
    let flat = logits
        .permute((0, 2, 3, 1))?
        .contiguous()?
        .reshape((b * h * w, c))?;
    candle_nn::loss::cross_entropy(&flat, &masks.flatten_all()?)
}

/// Elementwise, numerically stable BCE on logits:
/// `max(x, 0) - x * t + ln(1 + exp(-|x|))`.
fn binary_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    logits.relu()?.sub(&logits.mul(targets)?)?.add(&softplus)
}

/// Soft Dice (`jaccard == false`) or soft IoU loss, averaged over classes.
fn soft_overlap(logits: &Tensor, masks: &Tensor, jaccard: bool) -> Result<Tensor> {
    let probs = probabilities(logits)?;
    let targets = one_hot(masks, logits.dim(1)?)?;

    let inter = probs.mul(&targets)?.sum((0, 2, 3))?;
    let total = probs.add(&targets)?.sum((0, 2, 3))?;
    let score = if jaccard {
        let union = total.sub(&inter)?;
        inter.affine(1.0, EPS)?.div(&union.affine(1.0, EPS)?)?
    } else {
        inter.affine(2.0, EPS)?.div(&total.affine(1.0, EPS)?)?
    };
    score.affine(-1.0, 1.0)?.mean_all()
}

/// Focal loss with gamma = 2.
fn focal(logits: &Tensor, masks: &Tensor) -> Result<Tensor> {
    let neg_log_pt = if logits.dim(1)? == 1 {
        binary_cross_entropy(logits, &one_hot(masks, 1)?)?
    } else {
        let log_probs = candle_nn::ops::log_softmax(logits, 1)?;
        let index = masks.unsqueeze(1)?.contiguous()?;
        log_probs.gather(&index, 1)?.neg()?
    };
    let pt = neg_log_pt.neg()?.exp()?;
    pt.affine(-1.0, 1.0)?.sqr()?.mul(&neg_log_pt)?.mean_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    /// Two classes, logits strongly favouring the mask.
    fn confident(correct: bool) -> (Tensor, Tensor) {
        let dev = Device::Cpu;
        let masks = Tensor::new(&[[[0u32, 1], [1, 0]]], &dev).unwrap();
        let s = if correct { 10.0f32 } else { -10.0 };
        let fg = [[-s, s], [s, -s]];
        let bg = [[s, -s], [-s, s]];
        let logits = Tensor::new(&[[bg, fg]], &dev).unwrap();
        (logits, masks)
    }

    #[test]
    fn test_losses_rank_good_below_bad() {
        for kind in [
            LossKind::CrossEntropy,
            LossKind::Dice,
            LossKind::Jaccard,
            LossKind::Focal,
        ] {
            let (good, masks) = confident(true);
            let (bad, _) = confident(false);
            let good = scalar(compute(kind, &good, &masks).unwrap());
            let bad = scalar(compute(kind, &bad, &masks).unwrap());
            assert!(good.is_finite() && bad.is_finite(), "{kind}");
            assert!(good < 0.01, "{kind}: {good}");
            assert!(bad > good, "{kind}");
        }
    }

    #[test]
    fn test_binary_losses() {
        let dev = Device::Cpu;
        let masks = Tensor::new(&[[[0u32, 1], [1, 1]]], &dev).unwrap();
        let logits = Tensor::new(&[[[[-8f32, 8.], [8., 8.]]]], &dev).unwrap();
        for kind in [LossKind::Bce, LossKind::Dice, LossKind::Jaccard, LossKind::Focal] {
            let loss = scalar(compute(kind, &logits, &masks).unwrap());
            assert!((0.0..0.01).contains(&loss), "{kind}: {loss}");
        }
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let (logits, masks) = confident(true);
        assert!(compute(LossKind::Bce, &logits, &masks).is_err());

        let binary = Tensor::zeros((1, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(compute(LossKind::CrossEntropy, &binary, &masks).is_err());
    }

    #[test]
    fn test_bce_matches_closed_form() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[[[0f32]]]], &dev).unwrap();
        let masks = Tensor::new(&[[[1u32]]], &dev).unwrap();
        let loss = scalar(compute(LossKind::Bce, &logits, &masks).unwrap());
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-5);
    }
}
