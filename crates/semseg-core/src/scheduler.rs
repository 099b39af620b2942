//! Learning-rate schedules.

use std::f64::consts::PI;

/// Cosine annealing from `base_lr` down to `min_lr` over `total_epochs`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineAnnealing {
    pub base_lr: f64,
    pub min_lr: f64,
    pub total_epochs: usize,
}

impl CosineAnnealing {
    pub fn new(base_lr: f64, total_epochs: usize) -> Self {
        Self {
            base_lr,
            min_lr: 0.0,
            total_epochs,
        }
    }

    /// Learning rate in effect at the start of `epoch` (0-based).
    pub fn lr_at(&self, epoch: usize) -> f64 {
        if self.total_epochs == 0 {
            return self.base_lr;
        }
        let t = epoch.min(self.total_epochs) as f64 / self.total_epochs as f64;
        self.min_lr + (self.base_lr - self.min_lr) * (1.0 + (PI * t).cos()) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_and_midpoint() {
        let sched = CosineAnnealing::new(0.1, 10);
        assert!((sched.lr_at(0) - 0.1).abs() < 1e-12);
        assert!((sched.lr_at(5) - 0.05).abs() < 1e-12);
        assert!(sched.lr_at(10).abs() < 1e-12);
        assert!(sched.lr_at(25).abs() < 1e-12);
    }

    #[test]
    fn test_monotonic_decay() {
        let sched = CosineAnnealing::new(1e-3, 8);
        let lrs: Vec<f64> = (0..=8).map(|e| sched.lr_at(e)).collect();
        assert!(lrs.windows(2).all(|w| w[1] <= w[0]));
    }
}
