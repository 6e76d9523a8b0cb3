//! The record of one training run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::training::checkpoint::CheckpointRecord;
use crate::training::hyperparams::{Hyperparameters, RuntimeOptions};
use crate::training::metrics::TrainingHistory;

/// Lifecycle of a run. `StoppedEarly`, `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Initializing,
    Running,
    StoppedEarly,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::StoppedEarly | RunState::Completed | RunState::Failed
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Initializing, RunState::Running)
                | (RunState::Initializing, RunState::Failed)
                | (RunState::Running, RunState::StoppedEarly)
                | (RunState::Running, RunState::Completed)
                | (RunState::Running, RunState::Failed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Initializing => "INITIALIZING",
            RunState::Running => "RUNNING",
            RunState::StoppedEarly => "STOPPED_EARLY",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
        })
    }
}

/// Non-fatal conditions surfaced on the run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum RunSignal {
    /// A training partition exceeds the imbalance threshold.
    Imbalance {
        partition: String,
        ratio: f64,
        threshold: f64,
    },
    /// No epoch beat the untrained baseline; the best slot holds the last epoch.
    NoValidatedImprovement,
    /// Training loss jumped well above its recent mean.
    LossSpike { epoch: usize, train_loss: f64 },
}

/// Where and with what the run executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub crate_version: String,
    pub platform: String,
    pub arch: String,
    pub worker_threads: usize,
}

impl EnvironmentSnapshot {
    pub fn capture(runtime: &RuntimeOptions) -> Self {
        Self {
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            worker_threads: runtime.worker_threads,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRun {
    pub run_id: String,
    pub classifier: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub hyperparameters: Hyperparameters,
    pub environment: EnvironmentSnapshot,
    pub seed_samples: usize,
    pub validation_samples: usize,
    /// Validation loss of the model before the first epoch.
    pub baseline_val_loss: Option<f64>,
    pub history: TrainingHistory,
    pub best_checkpoint: Option<CheckpointRecord>,
    pub final_checkpoint: Option<CheckpointRecord>,
    pub signals: Vec<RunSignal>,
    pub failure: Option<String>,
}

impl TrainingRun {
    pub fn new(
        classifier: impl Into<String>,
        hyperparameters: Hyperparameters,
        runtime: &RuntimeOptions,
    ) -> Self {
        Self {
            run_id: format!(
                "{}-{}",
                Utc::now().format("%Y%m%dT%H%M%S"),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            classifier: classifier.into(),
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Initializing,
            hyperparameters,
            environment: EnvironmentSnapshot::capture(runtime),
            seed_samples: 0,
            validation_samples: 0,
            baseline_val_loss: None,
            history: TrainingHistory::default(),
            best_checkpoint: None,
            final_checkpoint: None,
            signals: Vec::new(),
            failure: None,
        }
    }

    /// Move to `next`, stamping `finished_at` on terminal states. Illegal
    /// transitions are ignored and reported as `false`.
    pub fn transition(&mut self, next: RunState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let mut run = TrainingRun::new("logistic", Hyperparameters::default(), &RuntimeOptions::default());
        assert_eq!(run.state, RunState::Initializing);
        assert!(!run.transition(RunState::Completed));
        assert!(run.transition(RunState::Running));
        assert!(run.finished_at.is_none());
        assert!(run.transition(RunState::StoppedEarly));
        assert!(run.finished_at.is_some());
        assert!(!run.transition(RunState::Running));
        assert_eq!(run.state, RunState::StoppedEarly);
    }

    #[test]
    fn test_state_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&RunState::StoppedEarly).unwrap(),
            "\"STOPPED_EARLY\""
        );
        assert_eq!(RunState::StoppedEarly.to_string(), "STOPPED_EARLY");
    }

    #[test]
    fn test_run_ids_are_unique() {
        let hp = Hyperparameters::default();
        let rt = RuntimeOptions::default();
        assert_ne!(
            TrainingRun::new("x", hp.clone(), &rt).run_id,
            TrainingRun::new("x", hp, &rt).run_id
        );
    }
}
