//! # deepscan-ml: dataset partitioning, training and evaluation
//!
//! Builds the data side of a REAL vs FAKE face-image classifier and runs it
//! end to end:
//!
//! - [`data`]: the sample registry, stratified partitioning into SEED,
//!   VALIDATION and POOL, integrity and balance checks, and the on-disk layout.
//! - [`training`]: hyperparameters, the classifier seam, a logistic baseline,
//!   checkpointing and the run orchestrator with early stopping.
//! - [`eval`]: confusion matrix and metric reports for a partition.
//! - [`inference`]: single-image prediction from a persisted checkpoint.
//! - [`selector`]: the active-learning selection interface over POOL.
//!
//! Data flows one way: raw files → registry → partitions → training →
//! checkpoint → evaluation and serving.

pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod inference;
pub mod persistence;
pub mod selector;
pub mod training;

pub use config::{PipelineConfig, load_config};
pub use data::{
    BalanceAnalyzer, BalanceReport, DatasetLayout, IntegrityReport, Label, Partition,
    PartitionRatios, PartitionView, Partitioner, RawSample, Sample, SampleRegistry,
    SharedRegistry, Violation, ViolationKind,
};
pub use error::{ErrorKind, MlError};
pub use eval::{EvaluationReport, Evaluator};
pub use inference::{InferenceResult, InferenceService};
pub use selector::{ActiveLearningSelector, IdentifierOrderSelector, select_from_registry};
pub use training::{
    Classifier, Hyperparameters, LogisticClassifier, ModelArtifact, Predictor, RunState,
    RuntimeOptions, TrainingOrchestrator, TrainingOutcome, TrainingRun, spawn_training,
};
