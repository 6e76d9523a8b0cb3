//! Serialized model snapshots: what checkpoints contain and what serving loads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::MlError;
use crate::persistence::{atomic_write_json, load_json};
use crate::training::baseline::LogisticModel;
use crate::training::classifier::Predictor;

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Weights of every model family the crate can train.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelWeights {
    Logistic(LogisticModel),
}

impl Predictor for ModelWeights {
    fn fake_probability(&self, path: &Path) -> Result<f64, MlError> {
        match self {
            ModelWeights::Logistic(model) => model.fake_probability(path),
        }
    }
}

/// A model snapshot plus the run and epoch it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub run_id: String,
    pub epoch: usize,
    pub validation_loss: f64,
    /// False when the run never improved on validation and this snapshot is
    /// only the last epoch's weights.
    pub validated_improvement: bool,
    pub created_at: DateTime<Utc>,
    pub model: ModelWeights,
}

impl ModelArtifact {
    pub fn new(
        run_id: impl Into<String>,
        epoch: usize,
        validation_loss: f64,
        validated_improvement: bool,
        model: ModelWeights,
    ) -> Self {
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            run_id: run_id.into(),
            epoch,
            validation_loss,
            validated_improvement,
            created_at: Utc::now(),
            model,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MlError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), MlError> {
        atomic_write_json(path, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, MlError> {
        let artifact: Self = load_json(path)
            .map_err(|e| MlError::checkpoint(format!("{}: {e}", path.display())))?
            .ok_or_else(|| MlError::not_found(format!("checkpoint {}", path.display())))?;
        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(MlError::checkpoint(format!(
                "{} has format version {}, expected {ARTIFACT_FORMAT_VERSION}",
                path.display(),
                artifact.format_version
            )));
        }
        Ok(artifact)
    }
}

impl Predictor for ModelArtifact {
    fn fake_probability(&self, path: &Path) -> Result<f64, MlError> {
        self.model.fake_probability(path)
    }
}
