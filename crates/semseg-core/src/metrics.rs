//! Pixel-level segmentation metrics.

use serde::{Deserialize, Serialize};

/// Per-class confusion counts accumulated over an epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionStats {
    binary: bool,
    true_pos: Vec<u64>,
    false_pos: Vec<u64>,
    false_neg: Vec<u64>,
    correct: u64,
    total: u64,
}

impl ConfusionStats {
    /// `num_classes == 1` means binary masks (background implied).
    pub fn new(num_classes: usize) -> Self {
        let classes = num_classes.max(2);
        Self {
            binary: num_classes == 1,
            true_pos: vec![0; classes],
            false_pos: vec![0; classes],
            false_neg: vec![0; classes],
            correct: 0,
            total: 0,
        }
    }

    pub fn update(&mut self, preds: &[u32], targets: &[u32]) {
        let classes = self.true_pos.len();
        for (&p, &t) in preds.iter().zip(targets.iter()) {
            let (p, t) = (p as usize, t as usize);
            self.total += 1;
            if p == t {
                self.correct += 1;
                if p < classes {
                    self.true_pos[p] += 1;
                }
                continue;
            }
            if p < classes {
                self.false_pos[p] += 1;
            }
            if t < classes {
                self.false_neg[t] += 1;
            }
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64
    }

    /// Foreground IoU for binary masks, otherwise mean IoU over classes
    /// that appear in either predictions or targets.
    pub fn iou(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let class_iou = |c: usize| -> Option<f64> {
            let union = self.true_pos[c] + self.false_pos[c] + self.false_neg[c];
            (union > 0).then(|| self.true_pos[c] as f64 / union as f64)
        };

        if self.binary {
            return class_iou(1).unwrap_or(1.0);
        }

        let scores: Vec<f64> = (0..self.true_pos.len()).filter_map(class_iou).collect();
        if scores.is_empty() {
            1.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        }
    }

    pub fn reset(&mut self) {
        self.true_pos.fill(0);
        self.false_pos.fill(0);
        self.false_neg.fill(0);
        self.correct = 0;
        self.total = 0;
    }
}

/// Running mean of scalar losses.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    pub fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Epoch summary for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub loss: f64,
    pub iou: f64,
    pub accuracy: f64,
    pub batches: usize,
}
