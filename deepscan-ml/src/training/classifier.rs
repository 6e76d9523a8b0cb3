//! The seams between the orchestrator and a concrete model.

use std::path::Path;

use crate::data::sample::{Label, Sample};
use crate::error::MlError;
use crate::training::artifact::ModelWeights;
use crate::training::hyperparams::Hyperparameters;
use crate::training::metrics::EpochFit;

/// Probabilities are clamped to this distance from 0 and 1 before taking logs.
pub const PROBABILITY_EPSILON: f64 = 1e-7;

/// Decision threshold on the FAKE probability.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Anything that can score an image file.
pub trait Predictor: Send + Sync {
    /// Probability in `[0, 1]` that the image at `path` is FAKE.
    fn fake_probability(&self, path: &Path) -> Result<f64, MlError>;
}

/// Per-epoch inputs handed to [`Classifier::fit_epoch`].
#[derive(Debug, Clone, Copy)]
pub struct EpochContext<'a> {
    pub epoch: usize,
    /// RNG seed for this epoch's shuffle and augmentation.
    pub seed: u64,
    pub hyperparameters: &'a Hyperparameters,
}

/// A trainable binary REAL/FAKE classifier.
pub trait Classifier: Predictor {
    fn name(&self) -> &str;

    /// One full pass over `samples`. Returns the mean training loss and accuracy.
    fn fit_epoch(&mut self, samples: &[Sample], ctx: &EpochContext<'_>)
    -> Result<EpochFit, MlError>;

    /// Mean log loss and accuracy on held-out samples, without augmentation.
    fn evaluate(&mut self, samples: &[Sample]) -> Result<EpochFit, MlError> {
        if samples.is_empty() {
            return Err(MlError::insufficient("no samples to evaluate"));
        }
        let mut loss = 0.0;
        let mut correct = 0usize;
        for sample in samples {
            let p = self.fake_probability(&sample.source_path)?;
            loss += log_loss(p, sample.label);
            if Label::from_probability(p, DEFAULT_THRESHOLD) == sample.label {
                correct += 1;
            }
        }
        let n = samples.len() as f64;
        Ok(EpochFit {
            loss: loss / n,
            accuracy: correct as f64 / n,
        })
    }

    /// Serializable copy of the current weights.
    fn snapshot(&self) -> ModelWeights;
}

/// Binary cross-entropy of a FAKE probability against the true label.
pub fn log_loss(fake_probability: f64, label: Label) -> f64 {
    let p = fake_probability.clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON);
    match label {
        Label::Fake => -p.ln(),
        Label::Real => -(1.0 - p).ln(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_loss() {
        assert!((log_loss(0.5, Label::Fake) - std::f64::consts::LN_2).abs() < 1e-12);
        assert!(log_loss(0.99, Label::Fake) < log_loss(0.6, Label::Fake));
        assert!(log_loss(0.0, Label::Fake).is_finite());
        assert!(log_loss(1.0, Label::Real).is_finite());
    }
}
