//! Hyperparameters, augmentation toggles and runtime options for a training run.

use serde::{Deserialize, Serialize};

use crate::error::MlError;

/// Augmentation applied to seed images before each epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    /// Mirror each image left-right with probability 0.5.
    #[serde(default = "default_true")]
    pub augment_horizontal_flip: bool,
    /// Rotate each image by a uniform angle in `[-d, d]` degrees. `0` disables rotation.
    #[serde(default = "default_rotation")]
    pub augment_rotation_degrees: f64,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            augment_horizontal_flip: true,
            augment_rotation_degrees: default_rotation(),
        }
    }
}

impl AugmentationConfig {
    pub fn disabled() -> Self {
        Self {
            augment_horizontal_flip: false,
            augment_rotation_degrees: 0.0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.augment_horizontal_flip || self.augment_rotation_degrees > 0.0
    }
}

fn default_true() -> bool {
    true
}

fn default_rotation() -> f64 {
    20.0
}

/// Process-level execution settings, passed in at orchestrator construction
/// rather than read from global state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Threads used for image decoding and feature extraction.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Maximum number of decoded images kept in memory between epochs.
    /// `0` disables the cache and decodes every epoch.
    #[serde(default = "default_feature_cache")]
    pub feature_cache_limit: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            feature_cache_limit: default_feature_cache(),
        }
    }
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_feature_cache() -> usize {
    200_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// L2 penalty on the classifier weights.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Consecutive non-improving epochs tolerated before stopping early.
    #[serde(default = "default_patience")]
    pub patience: usize,
    /// Minimum validation-loss decrease that counts as an improvement.
    #[serde(default)]
    pub min_delta: f64,
    /// Seed for shuffling and augmentation.
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub augmentation: AugmentationConfig,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            patience: default_patience(),
            min_delta: 0.0,
            seed: default_seed(),
            augmentation: AugmentationConfig::default(),
        }
    }
}

fn default_epochs() -> usize {
    20
}

fn default_batch_size() -> usize {
    64
}

fn default_learning_rate() -> f64 {
    0.05
}

fn default_weight_decay() -> f64 {
    1e-4
}

fn default_patience() -> usize {
    3
}

fn default_seed() -> u64 {
    42
}

impl Hyperparameters {
    pub fn validate(&self) -> Result<(), MlError> {
        if self.epochs == 0 {
            return Err(MlError::config("epochs must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(MlError::config("batch_size must be at least 1"));
        }
        if self.patience == 0 {
            return Err(MlError::config("patience must be at least 1"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(MlError::config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(MlError::config("weight_decay must be non-negative"));
        }
        if !(self.min_delta.is_finite() && self.min_delta >= 0.0) {
            return Err(MlError::config("min_delta must be non-negative"));
        }
        let rotation = self.augmentation.augment_rotation_degrees;
        if !(rotation.is_finite() && (0.0..=180.0).contains(&rotation)) {
            return Err(MlError::config(format!(
                "augment_rotation_degrees must be within [0, 180], got {rotation}"
            )));
        }
        Ok(())
    }
}
