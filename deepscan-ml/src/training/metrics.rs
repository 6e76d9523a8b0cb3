//! Per-epoch training metrics.

use serde::{Deserialize, Serialize};

/// Loss and accuracy from one pass over a set of samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochFit {
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based epoch number.
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    /// Whether this epoch beat the best validation loss by at least `min_delta`.
    pub improved: bool,
    pub duration_ms: u64,
}

/// Everything recorded over a run, in epoch order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    pub total_training_time_ms: u64,
}

impl TrainingHistory {
    pub fn record_epoch(&mut self, metrics: EpochMetrics) {
        if metrics.improved {
            self.best_epoch = Some(metrics.epoch);
            self.best_val_loss = Some(metrics.val_loss);
        }
        self.total_training_time_ms += metrics.duration_ms;
        self.epochs.push(metrics);
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs.len()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    pub fn val_losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.val_loss).collect()
    }
}
