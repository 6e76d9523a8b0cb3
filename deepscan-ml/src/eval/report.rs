//! Evaluation reports: confusion matrix, derived metrics, per-sample predictions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::data::sample::{Label, Partition};
use crate::error::MlError;
use crate::persistence::{atomic_write_json, load_json};

/// Binary confusion counts with FAKE as the positive class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_negative: usize,
    pub false_positive: usize,
    pub false_negative: usize,
    pub true_positive: usize,
}

impl ConfusionMatrix {
    pub fn record(&mut self, actual: Label, predicted: Label) {
        match (actual, predicted) {
            (Label::Real, Label::Real) => self.true_negative += 1,
            (Label::Real, Label::Fake) => self.false_positive += 1,
            (Label::Fake, Label::Real) => self.false_negative += 1,
            (Label::Fake, Label::Fake) => self.true_positive += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.true_negative + self.false_positive + self.false_negative + self.true_positive
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_negative + self.true_positive, self.total())
    }

    /// Precision, recall and F1 treating `label` as the positive class.
    pub fn class_metrics(&self, label: Label) -> ClassMetrics {
        let (tp, fp, fn_) = match label {
            Label::Fake => (self.true_positive, self.false_positive, self.false_negative),
            Label::Real => (self.true_negative, self.false_negative, self.false_positive),
        };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        ClassMetrics {
            precision,
            recall,
            f1: f1(precision, recall),
            support: tp + fn_,
        }
    }
}

/// A ratio with an empty denominator is reported as 0.
fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Samples whose true label is this class.
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplePrediction {
    pub identifier: String,
    pub true_label: Label,
    /// Probability of FAKE.
    pub predicted_probability: f64,
    pub predicted: Label,
}

impl SamplePrediction {
    pub fn is_correct(&self) -> bool {
        self.true_label == self.predicted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub partition: Partition,
    pub threshold: f64,
    pub samples: usize,
    pub accuracy: f64,
    /// Precision, recall and F1 for the FAKE class.
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub log_loss: f64,
    pub confusion: ConfusionMatrix,
    pub per_class: BTreeMap<Label, ClassMetrics>,
    pub predictions: Vec<SamplePrediction>,
    /// Free-form description of the model that was scored, e.g. its checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationReport {
    pub fn from_predictions(
        partition: Partition,
        threshold: f64,
        predictions: Vec<SamplePrediction>,
        log_loss: f64,
    ) -> Self {
        let mut confusion = ConfusionMatrix::default();
        for p in &predictions {
            confusion.record(p.true_label, p.predicted);
        }
        let fake = confusion.class_metrics(Label::Fake);
        let per_class = Label::ALL
            .into_iter()
            .map(|label| (label, confusion.class_metrics(label)))
            .collect();
        Self {
            partition,
            threshold,
            samples: predictions.len(),
            accuracy: confusion.accuracy(),
            precision: fake.precision,
            recall: fake.recall,
            f1: fake.f1,
            log_loss,
            confusion,
            per_class,
            predictions,
            model: None,
            evaluated_at: Utc::now(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Misclassified samples, most confidently wrong first.
    pub fn errors(&self) -> Vec<&SamplePrediction> {
        let mut wrong: Vec<_> = self.predictions.iter().filter(|p| !p.is_correct()).collect();
        wrong.sort_by(|a, b| {
            let ca = (a.predicted_probability - self.threshold).abs();
            let cb = (b.predicted_probability - self.threshold).abs();
            cb.total_cmp(&ca).then_with(|| a.identifier.cmp(&b.identifier))
        });
        wrong
    }

    pub fn summary(&self) -> String {
        let c = &self.confusion;
        format!(
            "{} samples on {}\n  Accuracy:  {:.4}\n  Precision: {:.4}\n  Recall:    {:.4}\n  F1:        {:.4}\n  Log loss:  {:.4}\n  Confusion: TN={} FP={} FN={} TP={}",
            self.samples,
            self.partition,
            self.accuracy,
            self.precision,
            self.recall,
            self.f1,
            self.log_loss,
            c.true_negative,
            c.false_positive,
            c.false_negative,
            c.true_positive,
        )
    }

    pub fn write(&self, path: &Path) -> Result<(), MlError> {
        atomic_write_json(path, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, MlError> {
        load_json(path)?
            .ok_or_else(|| MlError::not_found(format!("report {}", path.display())))
    }
}
