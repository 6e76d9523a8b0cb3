//! Pipeline configuration and its layered loader.

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::data::balance::DEFAULT_IMBALANCE_THRESHOLD;
use crate::data::layout::default_image_extensions;
use crate::data::partition::PartitionRatios;
use crate::error::MlError;
use crate::training::classifier::DEFAULT_THRESHOLD;
use crate::training::hyperparams::{Hyperparameters, RuntimeOptions};

/// Workspace-local config file name.
pub const CONFIG_FILE: &str = "deepscan.toml";

/// Prefix for environment overrides, e.g. `DEEPSCAN_TRAINING__EPOCHS=5`.
pub const ENV_PREFIX: &str = "DEEPSCAN_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub partition: PartitionConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default)]
    pub training: Hyperparameters,
    #[serde(default)]
    pub runtime: RuntimeOptions,
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Source tree with one subdirectory per label.
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,
    /// Partitioned layout root.
    #[serde(default = "default_dataset_dir")]
    pub dataset_dir: PathBuf,
    /// Accepted image extensions, lowercase, without the dot.
    #[serde(default = "default_image_extensions")]
    pub extensions: Vec<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            raw_dir: default_raw_dir(),
            dataset_dir: default_dataset_dir(),
            extensions: default_image_extensions(),
        }
    }
}

fn default_raw_dir() -> PathBuf {
    PathBuf::from("data/raw")
}

fn default_dataset_dir() -> PathBuf {
    PathBuf::from("data/dataset")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    #[serde(default = "default_seed_ratio")]
    pub seed_ratio: f64,
    #[serde(default = "default_validation_ratio")]
    pub validation_ratio: f64,
    #[serde(default = "default_pool_ratio")]
    pub pool_ratio: f64,
    #[serde(default = "default_random_seed")]
    pub random_seed: u64,
    /// Contiguous filename-order blocks per label, each split on its own.
    #[serde(default = "default_strata")]
    pub strata: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            seed_ratio: default_seed_ratio(),
            validation_ratio: default_validation_ratio(),
            pool_ratio: default_pool_ratio(),
            random_seed: default_random_seed(),
            strata: default_strata(),
        }
    }
}

impl PartitionConfig {
    pub fn ratios(&self) -> PartitionRatios {
        PartitionRatios {
            seed: self.seed_ratio,
            validation: self.validation_ratio,
            pool: self.pool_ratio,
        }
    }
}

fn default_strata() -> usize {
    1
}

fn default_seed_ratio() -> f64 {
    PartitionRatios::default().seed
}

fn default_validation_ratio() -> f64 {
    PartitionRatios::default().validation
}

fn default_pool_ratio() -> f64 {
    PartitionRatios::default().pool
}

fn default_random_seed() -> u64 {
    42
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceConfig {
    /// Majority/minority ratio above which a partition is flagged.
    #[serde(default = "default_imbalance_threshold")]
    pub imbalance_threshold: f64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            imbalance_threshold: default_imbalance_threshold(),
        }
    }
}

fn default_imbalance_threshold() -> f64 {
    DEFAULT_IMBALANCE_THRESHOLD
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// FAKE when the predicted probability is strictly above this value.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            report_dir: default_report_dir(),
        }
    }
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("reports")
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), MlError> {
        self.partition.ratios().validate()?;
        if self.partition.strata == 0 {
            return Err(MlError::config("partition.strata must be at least 1"));
        }
        self.training.validate()?;
        if self.data.extensions.is_empty() {
            return Err(MlError::config("data.extensions must not be empty"));
        }
        let imbalance = self.balance.imbalance_threshold;
        if !(imbalance.is_finite() && imbalance >= 1.0) {
            return Err(MlError::config(format!(
                "balance.imbalance_threshold must be at least 1.0, got {imbalance}"
            )));
        }
        if self.runtime.worker_threads == 0 {
            return Err(MlError::config("runtime.worker_threads must be at least 1"));
        }
        let threshold = self.evaluation.threshold;
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(MlError::config(format!(
                "evaluation.threshold must be in (0, 1), got {threshold}"
            )));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, MlError> {
        toml::to_string_pretty(self).map_err(|e| MlError::config(e.to_string()))
    }
}

/// Load configuration from layered sources, then validate it.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`DEEPSCAN_SECTION__KEY`)
/// 2. An explicit config file, when given
/// 3. Workspace-local `deepscan.toml`
/// 4. User config (`~/.config/deepscan/config.toml` or platform equivalent)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<PipelineConfig, MlError> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(dirs) = user_dirs() {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(CONFIG_FILE);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(MlError::config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: PipelineConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

/// Platform directories for user config and logs.
pub fn user_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "deepscan", "deepscan")
}
