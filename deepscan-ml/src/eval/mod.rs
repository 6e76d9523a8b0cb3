//! Scoring trained models against a partition.

pub mod engine;
pub mod report;

pub use engine::{Evaluator, evaluate};
pub use report::{ClassMetrics, ConfusionMatrix, EvaluationReport, SamplePrediction};
