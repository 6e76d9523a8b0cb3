//! Single-image inference over a persisted checkpoint.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::data::sample::Label;
use crate::error::MlError;
use crate::training::artifact::ModelArtifact;
use crate::training::checkpoint::resolve_latest;
use crate::training::classifier::{DEFAULT_THRESHOLD, Predictor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub label: Label,
    /// Probability of the predicted label.
    pub confidence: f64,
    pub fake_probability: f64,
    pub real_probability: f64,
}

impl InferenceResult {
    pub fn from_probability(fake_probability: f64, threshold: f64) -> Self {
        let label = Label::from_probability(fake_probability, threshold);
        let real_probability = 1.0 - fake_probability;
        Self {
            label,
            confidence: match label {
                Label::Fake => fake_probability,
                Label::Real => real_probability,
            },
            fake_probability,
            real_probability,
        }
    }
}

/// Holds one loaded model. Cheap to clone and safe to share across threads.
#[derive(Debug, Clone)]
pub struct InferenceService {
    artifact: Arc<ModelArtifact>,
    source: PathBuf,
    /// Checkpoint root when loaded through `latest.json`, used by [`Self::refresh`].
    root: Option<PathBuf>,
    threshold: f64,
}

impl InferenceService {
    pub fn from_checkpoint(path: &Path) -> Result<Self, MlError> {
        let artifact = ModelArtifact::load(path)?;
        info!(
            path = %path.display(),
            run_id = %artifact.run_id,
            epoch = artifact.epoch,
            "Loaded checkpoint for inference"
        );
        Ok(Self {
            artifact: Arc::new(artifact),
            source: path.to_path_buf(),
            root: None,
            threshold: DEFAULT_THRESHOLD,
        })
    }

    /// Load whatever `<root>/latest.json` points at.
    pub fn from_latest(root: &Path) -> Result<Self, MlError> {
        let pointer = resolve_latest(root)?;
        let artifact = pointer.load()?;
        if !artifact.validated_improvement {
            return Err(MlError::checkpoint(format!(
                "{} was never validated",
                pointer.checkpoint.display()
            )));
        }
        info!(
            path = %pointer.checkpoint.display(),
            run_id = %artifact.run_id,
            epoch = artifact.epoch,
            "Loaded latest published checkpoint"
        );
        Ok(Self {
            artifact: Arc::new(artifact),
            source: pointer.checkpoint,
            root: Some(root.to_path_buf()),
            threshold: DEFAULT_THRESHOLD,
        })
    }

    pub fn with_threshold(mut self, threshold: f64) -> Result<Self, MlError> {
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(MlError::config(format!(
                "decision threshold must be in (0, 1), got {threshold}"
            )));
        }
        self.threshold = threshold;
        Ok(self)
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn predict(&self, image: &Path) -> Result<InferenceResult, MlError> {
        if !image.is_file() {
            return Err(MlError::not_found(format!("image {}", image.display())));
        }
        let p = self.artifact.fake_probability(image)?;
        let result = InferenceResult::from_probability(p, self.threshold);
        debug!(image = %image.display(), label = %result.label, confidence = result.confidence, "Predicted");
        Ok(result)
    }

    pub fn predict_batch(&self, images: &[PathBuf]) -> Vec<(PathBuf, Result<InferenceResult, MlError>)> {
        images
            .iter()
            .map(|path| (path.clone(), self.predict(path)))
            .collect()
    }

    /// Re-read `latest.json` and swap in a newer checkpoint if one was
    /// published. Returns whether the model changed. Services built with
    /// [`Self::from_checkpoint`] never change.
    pub fn refresh(&mut self) -> Result<bool, MlError> {
        let Some(root) = self.root.clone() else {
            return Ok(false);
        };
        let pointer = resolve_latest(&root)?;
        if pointer.run_id == self.artifact.run_id && pointer.epoch == self.artifact.epoch {
            return Ok(false);
        }
        let threshold = self.threshold;
        *self = Self::from_latest(&root)?;
        self.threshold = threshold;
        Ok(true)
    }
}

impl Predictor for InferenceService {
    fn fake_probability(&self, path: &Path) -> Result<f64, MlError> {
        self.artifact.fake_probability(path)
    }
}
