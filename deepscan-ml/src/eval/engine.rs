//! Scores a model against a partition and builds an [`EvaluationReport`].

use tracing::info;

use crate::data::registry::{PartitionView, SampleRegistry};
use crate::data::sample::{Label, Partition};
use crate::error::MlError;
use crate::eval::report::{EvaluationReport, SamplePrediction};
use crate::training::classifier::{DEFAULT_THRESHOLD, Predictor, log_loss};

#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    threshold: f64,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl Evaluator {
    /// `threshold` must lie strictly inside (0, 1). A probability strictly
    /// above it is classified FAKE.
    pub fn new(threshold: f64) -> Result<Self, MlError> {
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(MlError::config(format!(
                "decision threshold must be in (0, 1), got {threshold}"
            )));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn evaluate<P: Predictor + ?Sized>(
        &self,
        model: &P,
        view: &PartitionView,
    ) -> Result<EvaluationReport, MlError> {
        if view.is_empty() {
            return Err(MlError::EmptyPartition(view.partition.to_string()));
        }

        let mut predictions = Vec::with_capacity(view.len());
        let mut total_loss = 0.0;
        for sample in view.iter() {
            let p = model.fake_probability(&sample.source_path)?;
            if !(0.0..=1.0).contains(&p) {
                return Err(MlError::training(format!(
                    "model returned probability {p} for {}",
                    sample.identifier
                )));
            }
            total_loss += log_loss(p, sample.label);
            predictions.push(SamplePrediction {
                identifier: sample.identifier.clone(),
                true_label: sample.label,
                predicted_probability: p,
                predicted: Label::from_probability(p, self.threshold),
            });
        }

        let report = EvaluationReport::from_predictions(
            view.partition,
            self.threshold,
            predictions,
            total_loss / view.len() as f64,
        );
        info!(
            partition = %report.partition,
            samples = report.samples,
            accuracy = report.accuracy,
            f1 = report.f1,
            log_loss = report.log_loss,
            "Evaluation complete"
        );
        Ok(report)
    }

    pub fn evaluate_partition<P: Predictor + ?Sized>(
        &self,
        model: &P,
        registry: &SampleRegistry,
        partition: Partition,
    ) -> Result<EvaluationReport, MlError> {
        self.evaluate(model, &registry.view(partition, None))
    }
}

/// Evaluate with the default 0.5 threshold.
pub fn evaluate<P: Predictor + ?Sized>(
    model: &P,
    view: &PartitionView,
) -> Result<EvaluationReport, MlError> {
    Evaluator::default().evaluate(model, view)
}
