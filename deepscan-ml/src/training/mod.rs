//! Training: hyperparameters, the classifier seam, the logistic baseline,
//! checkpoints and the run orchestrator.

pub mod artifact;
pub mod baseline;
pub mod callbacks;
pub mod checkpoint;
pub mod classifier;
pub mod features;
pub mod hyperparams;
pub mod metrics;
pub mod orchestrator;
pub mod run;

pub use artifact::{ModelArtifact, ModelWeights};
pub use baseline::{LogisticClassifier, LogisticModel};
pub use callbacks::{CallbackAction, EarlyStopping, LossGuard};
pub use checkpoint::{CheckpointRecord, CheckpointStore, LatestPointer, resolve_latest};
pub use classifier::{Classifier, DEFAULT_THRESHOLD, EpochContext, Predictor};
pub use hyperparams::{AugmentationConfig, Hyperparameters, RuntimeOptions};
pub use metrics::{EpochFit, EpochMetrics, TrainingHistory};
pub use orchestrator::{TrainingOrchestrator, TrainingOutcome, spawn_training};
pub use run::{RunSignal, RunState, TrainingRun};
