//! Drives a classifier through a training run.
//!
//! The orchestrator owns the run lifecycle: it validates the SEED and
//! VALIDATION partitions, fits one epoch at a time, evaluates on VALIDATION,
//! persists a new best checkpoint whenever validation loss improves, and stops
//! once patience runs out or the epoch budget is spent. Any failure during an
//! epoch ends the run as FAILED without touching the existing best checkpoint.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::data::balance::{BalanceAnalyzer, DEFAULT_IMBALANCE_THRESHOLD};
use crate::data::integrity;
use crate::data::registry::{PartitionView, SampleRegistry};
use crate::data::sample::{Label, Partition};
use crate::error::{ErrorKind, MlError};
use crate::training::artifact::ModelArtifact;
use crate::training::callbacks::{CallbackAction, EarlyStopping, LossGuard};
use crate::training::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::training::classifier::{Classifier, EpochContext};
use crate::training::hyperparams::{Hyperparameters, RuntimeOptions};
use crate::training::metrics::EpochMetrics;
use crate::training::run::{RunSignal, RunState, TrainingRun};

/// A finished run and the checkpoint it left behind.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub run: TrainingRun,
    pub best: CheckpointRecord,
    /// Whether `latest.json` now points at this run.
    pub published: bool,
}

#[derive(Debug, Clone)]
pub struct TrainingOrchestrator {
    hyperparameters: Hyperparameters,
    runtime: RuntimeOptions,
    checkpoint_root: PathBuf,
    imbalance_threshold: f64,
}

impl TrainingOrchestrator {
    pub fn new(
        hyperparameters: Hyperparameters,
        runtime: RuntimeOptions,
        checkpoint_root: impl Into<PathBuf>,
    ) -> Result<Self, MlError> {
        hyperparameters.validate()?;
        if runtime.worker_threads == 0 {
            return Err(MlError::config("worker_threads must be at least 1"));
        }
        Ok(Self {
            hyperparameters,
            runtime,
            checkpoint_root: checkpoint_root.into(),
            imbalance_threshold: DEFAULT_IMBALANCE_THRESHOLD,
        })
    }

    pub fn with_imbalance_threshold(mut self, threshold: f64) -> Self {
        self.imbalance_threshold = threshold;
        self
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyperparameters
    }

    pub fn runtime(&self) -> &RuntimeOptions {
        &self.runtime
    }

    pub fn checkpoint_root(&self) -> &Path {
        &self.checkpoint_root
    }

    /// Train `classifier` on the registry's SEED partition, validating on VALIDATION.
    pub fn run<C: Classifier + ?Sized>(
        &self,
        classifier: &mut C,
        registry: &SampleRegistry,
    ) -> Result<TrainingOutcome, MlError> {
        let mut run = TrainingRun::new(
            classifier.name(),
            self.hyperparameters.clone(),
            &self.runtime,
        );
        let store = CheckpointStore::for_run(&self.checkpoint_root, &run.run_id);
        info!(run_id = %run.run_id, classifier = %run.classifier, "Initializing training run");

        let (seed, validation) = match self.initialize(&mut run, registry) {
            Ok(views) => views,
            Err(err) => return Err(self.fail(run, &store, err)),
        };
        run.transition(RunState::Running);

        let stopped_early = match self.train(&mut run, &store, classifier, &seed, &validation) {
            Ok(stopped) => stopped,
            Err(err) => return Err(self.fail(run, &store, err)),
        };
        self.finish(run, &store, stopped_early)
    }

    fn initialize(
        &self,
        run: &mut TrainingRun,
        registry: &SampleRegistry,
    ) -> Result<(PartitionView, PartitionView), MlError> {
        let seed = registry.view(Partition::Seed, None);
        let validation = registry.view(Partition::Validation, None);
        for view in [&seed, &validation] {
            if view.is_empty() {
                return Err(MlError::insufficient(format!("{} is empty", view.partition)));
            }
            for label in Label::ALL {
                if view.count_label(label) == 0 {
                    return Err(MlError::insufficient(format!(
                        "{} has no {label} samples",
                        view.partition
                    )));
                }
            }
        }
        integrity::check(registry).into_result()?;
        run.seed_samples = seed.len();
        run.validation_samples = validation.len();

        let balance = BalanceAnalyzer::new(self.imbalance_threshold).analyze(registry);
        for partition in [Partition::Seed, Partition::Validation] {
            if let Some(pb) = balance.get(partition)
                && pb.imbalanced
            {
                run.signals.push(RunSignal::Imbalance {
                    partition: partition.to_string(),
                    ratio: pb.imbalance_ratio,
                    threshold: self.imbalance_threshold,
                });
            }
        }
        Ok((seed, validation))
    }

    /// Epoch loop. Returns whether early stopping fired.
    fn train<C: Classifier + ?Sized>(
        &self,
        run: &mut TrainingRun,
        store: &CheckpointStore,
        classifier: &mut C,
        seed: &PartitionView,
        validation: &PartitionView,
    ) -> Result<bool, MlError> {
        let hp = &self.hyperparameters;
        let baseline = classifier
            .evaluate(validation.samples())
            .map_err(|err| epoch_failure(0, err))?;
        run.baseline_val_loss = Some(baseline.loss);
        info!(run_id = %run.run_id, val_loss = baseline.loss, "Baseline validation loss");

        let mut early = EarlyStopping::new(hp.patience, hp.min_delta).with_baseline(baseline.loss);
        let mut guard = LossGuard::default();
        let mut last: Option<(usize, f64, bool)> = None;
        let mut stopped_early = false;

        for epoch in 1..=hp.epochs {
            let started = Instant::now();
            let ctx = EpochContext {
                epoch,
                seed: epoch_seed(hp.seed, epoch),
                hyperparameters: hp,
            };
            let at_epoch = |err: MlError| epoch_failure(epoch, err);

            let fit = classifier.fit_epoch(seed.samples(), &ctx).map_err(at_epoch)?;
            if guard.check(epoch, fit.loss)? {
                run.signals.push(RunSignal::LossSpike {
                    epoch,
                    train_loss: fit.loss,
                });
            }
            let val = classifier
                .evaluate(validation.samples())
                .map_err(at_epoch)?;
            if !val.loss.is_finite() {
                return Err(MlError::training(format!(
                    "validation loss became {} at epoch {epoch}",
                    val.loss
                )));
            }

            let action = early.observe(val.loss);
            let improved = action == CallbackAction::Checkpoint;
            run.history.record_epoch(EpochMetrics {
                epoch,
                train_loss: fit.loss,
                train_accuracy: fit.accuracy,
                val_loss: val.loss,
                val_accuracy: val.accuracy,
                improved,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            info!(
                run_id = %run.run_id,
                epoch,
                train_loss = fit.loss,
                val_loss = val.loss,
                val_accuracy = val.accuracy,
                improved,
                "Epoch complete"
            );

            if improved {
                let artifact =
                    ModelArtifact::new(&run.run_id, epoch, val.loss, true, classifier.snapshot());
                run.best_checkpoint = Some(store.persist_best(&artifact)?);
            }
            last = Some((epoch, val.loss, improved));

            if action == CallbackAction::Stop {
                info!(
                    run_id = %run.run_id,
                    epoch,
                    patience = hp.patience,
                    "Validation loss stopped improving, stopping early"
                );
                stopped_early = true;
                break;
            }
        }

        let (epoch, val_loss, improved) =
            last.ok_or_else(|| MlError::training("no epoch was run"))?;
        let final_artifact =
            ModelArtifact::new(&run.run_id, epoch, val_loss, improved, classifier.snapshot());
        run.final_checkpoint = Some(store.persist_final(&final_artifact)?);

        if run.best_checkpoint.is_none() {
            warn!(run_id = %run.run_id, "No epoch improved on validation, keeping last epoch as unvalidated best");
            let fallback = ModelArtifact {
                validated_improvement: false,
                ..final_artifact
            };
            run.best_checkpoint = Some(store.persist_best(&fallback)?);
            run.signals.push(RunSignal::NoValidatedImprovement);
        }
        Ok(stopped_early)
    }

    fn finish(
        &self,
        mut run: TrainingRun,
        store: &CheckpointStore,
        stopped_early: bool,
    ) -> Result<TrainingOutcome, MlError> {
        run.transition(if stopped_early {
            RunState::StoppedEarly
        } else {
            RunState::Completed
        });
        let best = run
            .best_checkpoint
            .clone()
            .ok_or_else(|| MlError::checkpoint("run finished without a best checkpoint"))?;

        let published = if best.validated_improvement {
            store.publish_latest(&best)?;
            true
        } else {
            false
        };
        store.write_run(&run)?;
        info!(
            run_id = %run.run_id,
            state = %run.state,
            epochs = run.history.epochs_completed(),
            best_epoch = best.epoch,
            best_val_loss = best.validation_loss,
            published,
            "Training run finished"
        );
        Ok(TrainingOutcome {
            run,
            best,
            published,
        })
    }

    fn fail(&self, mut run: TrainingRun, store: &CheckpointStore, err: MlError) -> MlError {
        run.transition(RunState::Failed);
        run.failure = Some(err.to_string());
        error!(run_id = %run.run_id, error = %err, "Training run failed");
        if let Err(write_err) = store.write_run(&run) {
            warn!(run_id = %run.run_id, error = %write_err, "Could not record failed run");
        }
        err
    }
}

/// Run training on a dedicated thread so callers are not blocked.
pub fn spawn_training<C>(
    orchestrator: TrainingOrchestrator,
    mut classifier: C,
    registry: SampleRegistry,
) -> Result<JoinHandle<Result<TrainingOutcome, MlError>>, MlError>
where
    C: Classifier + 'static,
{
    let handle = std::thread::Builder::new()
        .name("deepscan-train".into())
        .spawn(move || orchestrator.run(&mut classifier, &registry))?;
    Ok(handle)
}

fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Errors raised mid-epoch are training-runtime failures whatever their origin.
fn epoch_failure(epoch: usize, err: MlError) -> MlError {
    if err.kind() == Some(ErrorKind::TrainingRuntime) {
        err
    } else {
        MlError::training(format!("epoch {epoch}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::integrity::ViolationKind;
    use crate::data::sample::Sample;
    use crate::persistence::load_json;
    use crate::training::artifact::ModelWeights;
    use crate::training::baseline::LogisticModel;
    use crate::training::checkpoint::resolve_latest;
    use crate::training::classifier::Predictor;
    use crate::training::features::FeatureSpec;
    use crate::training::metrics::EpochFit;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    /// Replays a fixed validation-loss sequence. The snapshot's bias encodes
    /// the epoch it was taken at.
    struct ScriptedClassifier {
        val_losses: Vec<f64>,
        train_loss: f64,
        fail_at: Option<usize>,
        epoch: usize,
    }

    impl ScriptedClassifier {
        fn new(val_losses: &[f64]) -> Self {
            Self {
                val_losses: val_losses.to_vec(),
                train_loss: 0.4,
                fail_at: None,
                epoch: 0,
            }
        }
    }

    impl Predictor for ScriptedClassifier {
        fn fake_probability(&self, _path: &Path) -> Result<f64, MlError> {
            Ok(0.5)
        }
    }

    impl Classifier for ScriptedClassifier {
        fn name(&self) -> &str {
            "scripted"
        }

        fn fit_epoch(
            &mut self,
            _samples: &[Sample],
            ctx: &EpochContext<'_>,
        ) -> Result<EpochFit, MlError> {
            self.epoch = ctx.epoch;
            if self.fail_at == Some(ctx.epoch) {
                return Err(MlError::Io(std::io::Error::other("device lost")));
            }
            Ok(EpochFit {
                loss: self.train_loss,
                accuracy: 0.5,
            })
        }

        fn evaluate(&mut self, _samples: &[Sample]) -> Result<EpochFit, MlError> {
            // Epoch 0 is the untrained baseline.
            let loss = self
                .epoch
                .checked_sub(1)
                .and_then(|i| self.val_losses.get(i))
                .copied()
                .unwrap_or(1.0);
            Ok(EpochFit {
                loss,
                accuracy: 0.5,
            })
        }

        fn snapshot(&self) -> ModelWeights {
            let mut model = LogisticModel::zeros(FeatureSpec::default());
            model.bias = self.epoch as f64;
            ModelWeights::Logistic(model)
        }
    }

    fn registry(dir: &TempDir, seed_real: usize, seed_fake: usize) -> SampleRegistry {
        let mut reg = SampleRegistry::new();
        let mut add = |label: Label, partition: Partition, i: usize| {
            let id = format!("{}/{}_{i}.png", label.dir_name(), partition.dir_name());
            let path = dir.path().join(id.replace('/', "_"));
            std::fs::write(&path, b"img").unwrap();
            reg.register(Sample::new(id, label, path).with_partition(partition))
                .unwrap();
        };
        for i in 0..seed_real {
            add(Label::Real, Partition::Seed, i);
        }
        for i in 0..seed_fake {
            add(Label::Fake, Partition::Seed, i);
        }
        for i in 0..2 {
            add(Label::Real, Partition::Validation, i);
            add(Label::Fake, Partition::Validation, i);
        }
        reg
    }

    fn orchestrator(root: &Path, epochs: usize) -> TrainingOrchestrator {
        let hp = Hyperparameters {
            epochs,
            patience: 3,
            ..Default::default()
        };
        TrainingOrchestrator::new(hp, RuntimeOptions::default(), root).unwrap()
    }

    fn bias_of(artifact: &ModelArtifact) -> f64 {
        let ModelWeights::Logistic(model) = &artifact.model;
        model.bias
    }

    #[test]
    fn test_stops_early_after_patience_with_best_from_epoch_two() {
        let data = TempDir::new().unwrap();
        let ckpt = TempDir::new().unwrap();
        let mut clf = ScriptedClassifier::new(&[0.7, 0.5, 0.55, 0.6, 0.52, 0.1, 0.1]);

        let outcome = orchestrator(ckpt.path(), 20)
            .run(&mut clf, &registry(&data, 4, 4))
            .unwrap();

        assert_eq!(outcome.run.state, RunState::StoppedEarly);
        assert_eq!(outcome.run.history.epochs_completed(), 5);
        assert_eq!(outcome.run.history.best_epoch, Some(2));
        assert_eq!(outcome.best.epoch, 2);
        assert!(outcome.published);

        let store = CheckpointStore::for_run(ckpt.path(), &outcome.run.run_id);
        let best = store.load_best().unwrap();
        assert_eq!(best.epoch, 2);
        assert_eq!(bias_of(&best), 2.0);
        assert!(store.verify_best().unwrap());

        let recorded: Vec<f64> = store
            .history()
            .unwrap()
            .iter()
            .map(|r| r.validation_loss)
            .collect();
        assert_eq!(recorded, vec![0.7, 0.5]);

        let finalized = ModelArtifact::load(&store.final_path()).unwrap();
        assert_eq!(finalized.epoch, 5);
        assert!(!finalized.validated_improvement);

        let latest = resolve_latest(ckpt.path()).unwrap();
        assert_eq!(latest.run_id, outcome.run.run_id);
        assert_eq!(latest.epoch, 2);
    }

    #[test]
    fn test_completes_when_epochs_run_out() {
        let data = TempDir::new().unwrap();
        let ckpt = TempDir::new().unwrap();
        let mut clf = ScriptedClassifier::new(&[0.6, 0.5, 0.4]);

        let outcome = orchestrator(ckpt.path(), 3)
            .run(&mut clf, &registry(&data, 4, 4))
            .unwrap();
        assert_eq!(outcome.run.state, RunState::Completed);
        assert_eq!(outcome.best.epoch, 3);
        assert!(outcome.run.finished_at.is_some());
    }

    #[test]
    fn test_failure_mid_run_keeps_previous_best() {
        let data = TempDir::new().unwrap();
        let ckpt = TempDir::new().unwrap();
        let mut clf = ScriptedClassifier::new(&[0.7, 0.5, 0.3]);
        clf.fail_at = Some(3);

        let err = orchestrator(ckpt.path(), 10)
            .run(&mut clf, &registry(&data, 4, 4))
            .unwrap_err();
        assert!(matches!(err, MlError::TrainingRuntime(ref msg) if msg.contains("epoch 3")));

        let run_dir = std::fs::read_dir(ckpt.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.is_dir())
            .unwrap();
        let run_id = run_dir.file_name().unwrap().to_string_lossy().into_owned();
        let store = CheckpointStore::for_run(ckpt.path(), run_id);

        let best = store.load_best().unwrap();
        assert_eq!(best.epoch, 2);
        assert!(store.verify_best().unwrap());

        let run: TrainingRun = load_json(&store.run_path()).unwrap().unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert!(run.failure.unwrap().contains("device lost"));
        // Failed runs are never published.
        assert!(resolve_latest(ckpt.path()).is_err());
    }

    #[test]
    fn test_non_finite_training_loss_fails_run() {
        let data = TempDir::new().unwrap();
        let ckpt = TempDir::new().unwrap();
        let mut clf = ScriptedClassifier::new(&[0.7]);
        clf.train_loss = f64::NAN;

        let err = orchestrator(ckpt.path(), 5)
            .run(&mut clf, &registry(&data, 4, 4))
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::TrainingRuntime));
    }

    #[test]
    fn test_never_improving_run_keeps_flagged_fallback() {
        let data = TempDir::new().unwrap();
        let ckpt = TempDir::new().unwrap();
        let mut clf = ScriptedClassifier::new(&[1.2, 1.1, 1.3, 0.2]);

        let outcome = orchestrator(ckpt.path(), 10)
            .run(&mut clf, &registry(&data, 4, 4))
            .unwrap();
        assert_eq!(outcome.run.state, RunState::StoppedEarly);
        assert_eq!(outcome.run.history.epochs_completed(), 3);
        assert!(!outcome.best.validated_improvement);
        assert!(!outcome.published);
        assert!(
            outcome
                .run
                .signals
                .contains(&RunSignal::NoValidatedImprovement)
        );
        assert!(resolve_latest(ckpt.path()).is_err());
    }

    #[test]
    fn test_nan_validation_loss_fails_run() {
        let data = TempDir::new().unwrap();
        let ckpt = TempDir::new().unwrap();
        let mut clf = ScriptedClassifier::new(&[0.7, f64::NAN]);

        let err = orchestrator(ckpt.path(), 5)
            .run(&mut clf, &registry(&data, 4, 4))
            .unwrap_err();
        assert!(matches!(err, MlError::TrainingRuntime(ref msg) if msg.contains("epoch 2")));
    }

    #[test]
    fn test_missing_label_is_insufficient_data() {
        let data = TempDir::new().unwrap();
        let ckpt = TempDir::new().unwrap();
        let mut clf = ScriptedClassifier::new(&[0.5]);

        let err = orchestrator(ckpt.path(), 5)
            .run(&mut clf, &registry(&data, 0, 4))
            .unwrap_err();
        assert!(matches!(err, MlError::InsufficientData(_)));
        assert_eq!(clf.epoch, 0);
    }

    #[test]
    fn test_empty_seed_is_insufficient_data() {
        let data = TempDir::new().unwrap();
        let ckpt = TempDir::new().unwrap();
        let err = orchestrator(ckpt.path(), 5)
            .run(&mut ScriptedClassifier::new(&[0.5]), &registry(&data, 0, 0))
            .unwrap_err();
        assert!(matches!(err, MlError::InsufficientData(ref msg) if msg.contains("SEED")));
    }

    #[test]
    fn test_missing_file_fails_before_running() {
        let data = TempDir::new().unwrap();
        let ckpt = TempDir::new().unwrap();
        let reg = registry(&data, 2, 2);
        let victim = reg.view(Partition::Seed, Some(Label::Fake)).samples()[0]
            .source_path
            .clone();
        std::fs::remove_file(victim).unwrap();

        let mut clf = ScriptedClassifier::new(&[0.5]);
        let err = orchestrator(ckpt.path(), 5).run(&mut clf, &reg).unwrap_err();
        assert!(matches!(
            err,
            MlError::DataIntegrity {
                kind: ViolationKind::MissingFile,
                ..
            }
        ));
        assert_eq!(clf.epoch, 0);
    }

    #[test]
    fn test_imbalanced_seed_is_signalled_not_fatal() {
        let data = TempDir::new().unwrap();
        let ckpt = TempDir::new().unwrap();
        let mut clf = ScriptedClassifier::new(&[0.5, 0.4]);

        let outcome = orchestrator(ckpt.path(), 2)
            .run(&mut clf, &registry(&data, 1, 5))
            .unwrap();
        assert!(outcome.run.signals.iter().any(|s| matches!(
            s,
            RunSignal::Imbalance { partition, .. } if partition == "SEED"
        )));
    }

    #[test]
    fn test_rejects_invalid_hyperparameters() {
        let hp = Hyperparameters {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            TrainingOrchestrator::new(hp, RuntimeOptions::default(), "/tmp/unused"),
            Err(MlError::Configuration(_))
        ));
    }

    #[test]
    fn test_spawned_training_joins_with_outcome() {
        let data = TempDir::new().unwrap();
        let ckpt = TempDir::new().unwrap();
        let handle = spawn_training(
            orchestrator(ckpt.path(), 2),
            ScriptedClassifier::new(&[0.5, 0.4]),
            registry(&data, 3, 3),
        )
        .unwrap();
        let outcome = handle.join().unwrap().unwrap();
        assert_eq!(outcome.run.state, RunState::Completed);
        assert_eq!(outcome.best.epoch, 2);
    }
}
