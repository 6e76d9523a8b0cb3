//! Checkpoint storage for training runs.
//!
//! Layout under the checkpoint root:
//!
//! ```text
//! <root>/latest.json                     pointer to the newest validated best checkpoint
//! <root>/<run_id>/best-epoch-<NNNN>.json  one immutable file per best model
//! <root>/<run_id>/final.json              last epoch's model
//! <root>/<run_id>/checkpoints.json        history of committed best files
//! <root>/<run_id>/run.json                run record
//! ```
//!
//! `checkpoints.json` is the commit point: a best file that is not listed in
//! it does not exist as far as readers are concerned, and a listed file is
//! never rewritten. A crash between writing the artifact and the history
//! leaves the previous best as the current one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::MlError;
use crate::persistence::{atomic_write, atomic_write_json, load_json, sha256_hex};
use crate::training::artifact::ModelArtifact;

pub const BEST_PREFIX: &str = "best-epoch-";
pub const FINAL_FILE: &str = "final.json";
pub const HISTORY_FILE: &str = "checkpoints.json";
pub const RUN_FILE: &str = "run.json";
pub const LATEST_FILE: &str = "latest.json";

/// One persisted checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub run_id: String,
    pub epoch: usize,
    pub validation_loss: f64,
    pub validated_improvement: bool,
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Where serving should load from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub run_id: String,
    pub checkpoint: PathBuf,
    pub epoch: usize,
    pub validation_loss: f64,
    pub sha256: String,
    pub published_at: DateTime<Utc>,
}

impl LatestPointer {
    /// Load the pointed-at artifact, checking it still hashes to the published digest.
    pub fn load(&self) -> Result<ModelArtifact, MlError> {
        let bytes = std::fs::read(&self.checkpoint)?;
        if sha256_hex(&bytes) != self.sha256 {
            return Err(MlError::checkpoint(format!(
                "{} changed since it was published",
                self.checkpoint.display()
            )));
        }
        ModelArtifact::load(&self.checkpoint)
    }
}

/// Checkpoint files of a single run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    run_id: String,
    run_dir: PathBuf,
}

impl CheckpointStore {
    pub fn for_run(root: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        let root = root.into();
        let run_id = run_id.into();
        let run_dir = root.join(&run_id);
        Self {
            root,
            run_id,
            run_dir,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// File of the current best checkpoint, resolved through the history.
    pub fn best_path(&self) -> Result<Option<PathBuf>, MlError> {
        Ok(self.best()?.map(|record| record.path))
    }

    fn best_file_for(&self, epoch: usize) -> PathBuf {
        self.run_dir.join(format!("{BEST_PREFIX}{epoch:04}.json"))
    }

    pub fn final_path(&self) -> PathBuf {
        self.run_dir.join(FINAL_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.run_dir.join(HISTORY_FILE)
    }

    pub fn run_path(&self) -> PathBuf {
        self.run_dir.join(RUN_FILE)
    }

    /// Every best checkpoint written by this run, oldest first.
    pub fn history(&self) -> Result<Vec<CheckpointRecord>, MlError> {
        Ok(load_json(&self.history_path())?.unwrap_or_default())
    }

    /// The record describing the current best checkpoint, if any.
    pub fn best(&self) -> Result<Option<CheckpointRecord>, MlError> {
        Ok(self.history()?.pop())
    }

    /// Write `artifact` as the new best checkpoint.
    ///
    /// The artifact goes to its own file first; appending it to the history
    /// is what makes it the best. A failure anywhere leaves the previous best
    /// loadable.
    ///
    /// A validated best is only ever replaced by a strictly lower validation
    /// loss. An unvalidated artifact is only accepted into an empty slot.
    pub fn persist_best(&self, artifact: &ModelArtifact) -> Result<CheckpointRecord, MlError> {
        if artifact.run_id != self.run_id {
            return Err(MlError::checkpoint(format!(
                "artifact of run {} offered to run {}",
                artifact.run_id, self.run_id
            )));
        }
        let mut history = self.history()?;
        if let Some(current) = history.last() {
            if !artifact.validated_improvement {
                return Err(MlError::checkpoint(
                    "unvalidated snapshot cannot replace an existing best checkpoint",
                ));
            }
            if !(artifact.validation_loss < current.validation_loss) {
                return Err(MlError::checkpoint(format!(
                    "validation loss {} does not improve on best {} (epoch {})",
                    artifact.validation_loss, current.validation_loss, current.epoch
                )));
            }
        }

        let path = self.best_file_for(artifact.epoch);
        if history.iter().any(|r| r.path == path) {
            return Err(MlError::checkpoint(format!(
                "{} is already committed",
                path.display()
            )));
        }
        let record = self.write_artifact(artifact, &path)?;
        history.push(record.clone());
        atomic_write_json(&self.history_path(), &history)?;
        info!(
            run_id = %self.run_id,
            epoch = record.epoch,
            validation_loss = record.validation_loss,
            "Saved best checkpoint"
        );
        Ok(record)
    }

    /// Write the last epoch's model to `final.json`. Not part of the best history.
    pub fn persist_final(&self, artifact: &ModelArtifact) -> Result<CheckpointRecord, MlError> {
        self.write_artifact(artifact, &self.final_path())
    }

    /// Load the current best, refusing a file whose digest disagrees with the history.
    pub fn load_best(&self) -> Result<ModelArtifact, MlError> {
        let record = self.best()?.ok_or_else(|| {
            MlError::not_found(format!("run {} has no best checkpoint", self.run_id))
        })?;
        if !Self::matches_record(&record)? {
            return Err(MlError::checkpoint(format!(
                "{} does not match {HISTORY_FILE}",
                record.path.display()
            )));
        }
        ModelArtifact::load(&record.path)
    }

    /// Check that the current best file hashes to the digest recorded in the history.
    pub fn verify_best(&self) -> Result<bool, MlError> {
        let Some(record) = self.best()? else {
            return Ok(false);
        };
        let ok = Self::matches_record(&record)?;
        if !ok {
            warn!(
                run_id = %self.run_id,
                path = %record.path.display(),
                "Best checkpoint does not match its recorded digest"
            );
        }
        Ok(ok)
    }

    fn matches_record(record: &CheckpointRecord) -> Result<bool, MlError> {
        let bytes = std::fs::read(&record.path)?;
        Ok(sha256_hex(&bytes) == record.sha256)
    }

    pub fn write_run<T: Serialize>(&self, run: &T) -> Result<(), MlError> {
        atomic_write_json(&self.run_path(), run)?;
        Ok(())
    }

    /// Point `<root>/latest.json` at this run's best checkpoint.
    pub fn publish_latest(&self, record: &CheckpointRecord) -> Result<LatestPointer, MlError> {
        if !record.validated_improvement {
            return Err(MlError::checkpoint(
                "refusing to publish a checkpoint that never improved on validation",
            ));
        }
        let pointer = LatestPointer {
            run_id: record.run_id.clone(),
            checkpoint: record.path.clone(),
            epoch: record.epoch,
            validation_loss: record.validation_loss,
            sha256: record.sha256.clone(),
            published_at: Utc::now(),
        };
        atomic_write_json(&self.root.join(LATEST_FILE), &pointer)?;
        Ok(pointer)
    }

    fn write_artifact(
        &self,
        artifact: &ModelArtifact,
        path: &Path,
    ) -> Result<CheckpointRecord, MlError> {
        let bytes = artifact.to_bytes()?;
        atomic_write(path, &bytes)?;
        Ok(CheckpointRecord {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: artifact.run_id.clone(),
            epoch: artifact.epoch,
            validation_loss: artifact.validation_loss,
            validated_improvement: artifact.validated_improvement,
            path: path.to_path_buf(),
            sha256: sha256_hex(&bytes),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        })
    }
}

/// Read `<root>/latest.json`.
pub fn resolve_latest(root: &Path) -> Result<LatestPointer, MlError> {
    load_json(&root.join(LATEST_FILE))?.ok_or_else(|| {
        MlError::not_found(format!(
            "no published checkpoint under {}",
            root.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::artifact::ModelWeights;
    use crate::training::baseline::LogisticModel;
    use crate::training::features::FeatureSpec;
    use tempfile::TempDir;

    fn artifact(epoch: usize, loss: f64, validated: bool) -> ModelArtifact {
        let mut model = LogisticModel::zeros(FeatureSpec::default());
        model.bias = epoch as f64;
        ModelArtifact::new("run-a", epoch, loss, validated, ModelWeights::Logistic(model))
    }

    #[test]
    fn test_best_only_moves_downhill() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::for_run(dir.path(), "run-a");

        store.persist_best(&artifact(1, 0.7, true)).unwrap();
        store.persist_best(&artifact(2, 0.5, true)).unwrap();
        assert!(matches!(
            store.persist_best(&artifact(3, 0.6, true)),
            Err(MlError::Checkpoint(_))
        ));
        assert!(store.persist_best(&artifact(4, 0.5, true)).is_err());

        let losses: Vec<f64> = store
            .history()
            .unwrap()
            .iter()
            .map(|r| r.validation_loss)
            .collect();
        assert_eq!(losses, vec![0.7, 0.5]);
        assert_eq!(store.load_best().unwrap().epoch, 2);
        assert!(store.verify_best().unwrap());
    }

    #[test]
    fn test_unvalidated_only_fills_empty_slot() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::for_run(dir.path(), "run-a");
        let record = store.persist_best(&artifact(5, 0.9, false)).unwrap();
        assert!(!record.validated_improvement);
        assert!(store.persist_best(&artifact(6, 0.1, false)).is_err());
        assert!(store.publish_latest(&record).is_err());
    }

    #[test]
    fn test_publish_and_resolve_latest() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            resolve_latest(dir.path()),
            Err(MlError::NotFound(_))
        ));

        let store = CheckpointStore::for_run(dir.path(), "run-a");
        let record = store.persist_best(&artifact(3, 0.4, true)).unwrap();
        store.publish_latest(&record).unwrap();

        let latest = resolve_latest(dir.path()).unwrap();
        assert_eq!(latest.run_id, "run-a");
        assert_eq!(Some(latest.checkpoint.clone()), store.best_path().unwrap());
        assert_eq!(latest.load().unwrap().epoch, 3);
    }

    #[test]
    fn test_tampered_best_fails_verification() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::for_run(dir.path(), "run-a");
        store.persist_best(&artifact(1, 0.7, true)).unwrap();
        std::fs::write(store.best_path().unwrap().unwrap(), b"{}").unwrap();
        assert!(!store.verify_best().unwrap());
        assert!(matches!(store.load_best(), Err(MlError::Checkpoint(_))));
    }

    #[test]
    fn test_failed_history_write_keeps_previous_best() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::for_run(dir.path(), "run-a");
        store.persist_best(&artifact(1, 0.7, true)).unwrap();
        let first = store.best_path().unwrap().unwrap();

        // A directory on the history's temp name makes the commit fail.
        let squatter = store
            .run_dir()
            .join(format!(".{HISTORY_FILE}.{}.tmp", std::process::id()));
        std::fs::create_dir(&squatter).unwrap();
        assert!(matches!(
            store.persist_best(&artifact(2, 0.5, true)),
            Err(MlError::Io(_))
        ));

        assert_eq!(store.best_path().unwrap(), Some(first));
        assert!(store.verify_best().unwrap());
        assert_eq!(store.load_best().unwrap().epoch, 1);
        assert_eq!(store.history().unwrap().len(), 1);

        // The orphaned epoch-2 file is simply rewritten on retry.
        std::fs::remove_dir(&squatter).unwrap();
        store.persist_best(&artifact(2, 0.5, true)).unwrap();
        assert_eq!(store.load_best().unwrap().epoch, 2);
    }

    #[test]
    fn test_committed_best_files_are_never_rewritten() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::for_run(dir.path(), "run-a");
        let first = store.persist_best(&artifact(1, 0.7, true)).unwrap();
        let second = store.persist_best(&artifact(2, 0.5, true)).unwrap();
        assert_ne!(first.path, second.path);
        assert_eq!(
            sha256_hex(&std::fs::read(&first.path).unwrap()),
            first.sha256
        );
        assert!(store.persist_best(&artifact(2, 0.1, true)).is_err());
    }

    #[test]
    fn test_load_best_without_history_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::for_run(dir.path(), "run-a");
        assert_eq!(store.best_path().unwrap(), None);
        assert!(matches!(store.load_best(), Err(MlError::NotFound(_))));
    }

    #[test]
    fn test_rejects_foreign_run() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::for_run(dir.path(), "run-b");
        assert!(store.persist_best(&artifact(1, 0.7, true)).is_err());
    }
}
