//! Epoch-end callbacks: early stopping on validation loss and a training-loss guard.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::MlError;

/// What the orchestrator should do after an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Validation loss improved: persist a new best checkpoint and keep going.
    Checkpoint,
    Continue,
    Stop,
}

/// Early stopping as an explicit state transition over validation losses.
///
/// A loss counts as an improvement only when it beats the best seen so far by
/// more than `min_delta`. Non-finite losses never improve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStopping {
    pub patience: usize,
    pub min_delta: f64,
    #[serde(skip)]
    stale_epochs: usize,
    #[serde(skip)]
    best_loss: Option<f64>,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            stale_epochs: 0,
            best_loss: None,
        }
    }

    /// Start from a reference loss, typically the untrained model's, that the
    /// first epoch must beat. Non-finite baselines are ignored.
    pub fn with_baseline(mut self, loss: f64) -> Self {
        if loss.is_finite() {
            self.best_loss = Some(loss);
        }
        self
    }

    /// Feed one validation loss. Returns `Checkpoint` on improvement, `Stop`
    /// once `patience` consecutive epochs have failed to improve.
    pub fn observe(&mut self, val_loss: f64) -> CallbackAction {
        let improved = val_loss.is_finite()
            && self
                .best_loss
                .is_none_or(|best| val_loss < best - self.min_delta);

        if improved {
            self.best_loss = Some(val_loss);
            self.stale_epochs = 0;
            return CallbackAction::Checkpoint;
        }

        self.stale_epochs += 1;
        if self.stale_epochs >= self.patience {
            CallbackAction::Stop
        } else {
            CallbackAction::Continue
        }
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    pub fn stale_epochs(&self) -> usize {
        self.stale_epochs
    }
}

/// Watches the training loss for divergence.
///
/// A non-finite loss is fatal for the run. A loss above `spike_factor` times
/// the recent mean is only reported.
#[derive(Debug, Clone)]
pub struct LossGuard {
    pub spike_factor: f64,
    window: Vec<f64>,
    window_size: usize,
}

impl Default for LossGuard {
    fn default() -> Self {
        Self::new(3.0, 5)
    }
}

impl LossGuard {
    pub fn new(spike_factor: f64, window_size: usize) -> Self {
        Self {
            spike_factor,
            window: Vec::new(),
            window_size: window_size.max(1),
        }
    }

    /// Returns `Ok(true)` when the loss spiked, `Err` when it is NaN or infinite.
    pub fn check(&mut self, epoch: usize, train_loss: f64) -> Result<bool, MlError> {
        if !train_loss.is_finite() {
            return Err(MlError::training(format!(
                "training loss became {train_loss} at epoch {epoch}"
            )));
        }

        let spiked = self.window.len() >= 3 && {
            let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
            train_loss > mean * self.spike_factor
        };
        if spiked {
            warn!(epoch, train_loss, "Training loss spiked above recent mean");
        }

        self.window.push(train_loss);
        if self.window.len() > self.window_size {
            self.window.remove(0);
        }
        Ok(spiked)
    }
}
