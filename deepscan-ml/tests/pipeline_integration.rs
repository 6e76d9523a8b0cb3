//! End-to-end: raw images → partitions → layout → training → evaluation → inference.

use image::{GrayImage, Luma};
use pretty_assertions::assert_eq;
use std::path::Path;
use tempfile::TempDir;

use deepscan_ml::data::integrity::check;
use deepscan_ml::data::layout::{SplitMetadata, default_image_extensions, scan_raw};
use deepscan_ml::data::partition::PartitionRatios;
use deepscan_ml::training::checkpoint::resolve_latest;
use deepscan_ml::{
    DatasetLayout, Evaluator, Hyperparameters, IdentifierOrderSelector, InferenceService, Label,
    LogisticClassifier, MlError, Partition, Partitioner, RunState, RuntimeOptions,
    TrainingOrchestrator, ViolationKind, select_from_registry, spawn_training,
};

/// Dark REAL images, bright FAKE images, with a little texture per file.
fn write_raw_tree(root: &Path, per_class: u32) {
    for (label, base) in [("real", 35u8), ("fake", 195u8)] {
        let dir = root.join(label);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..per_class {
            let img = GrayImage::from_fn(20, 20, |x, y| Luma([base + ((x * 3 + y + i) % 20) as u8]));
            img.save(dir.join(format!("{label}_{i:03}.png"))).unwrap();
        }
    }
    std::fs::write(root.join("real").join("notes.txt"), "not an image").unwrap();
}

fn runtime() -> RuntimeOptions {
    RuntimeOptions {
        worker_threads: 2,
        ..RuntimeOptions::default()
    }
}

fn hyperparameters() -> Hyperparameters {
    Hyperparameters {
        epochs: 4,
        batch_size: 8,
        learning_rate: 0.5,
        ..Hyperparameters::default()
    }
}

#[test]
fn split_materialize_and_reload() {
    let dir = TempDir::new().unwrap();
    let raw_dir = dir.path().join("raw");
    write_raw_tree(&raw_dir, 20);

    let raw = scan_raw(&raw_dir, &default_image_extensions()).unwrap();
    assert_eq!(raw.len(), 40);
    assert!(raw.iter().all(|s| s.identifier.starts_with(s.label.dir_name())));

    let ratios = PartitionRatios::default();
    let registry = Partitioner::new(ratios, 42).unwrap().partition(&raw).unwrap();
    assert!(check(&registry).is_clean());

    let layout = DatasetLayout::new(dir.path().join("dataset"));
    let summary = layout.materialize(&registry).unwrap();
    assert_eq!(summary.copied, 40);
    layout
        .write_metadata(&SplitMetadata::new(
            &registry,
            ratios,
            42,
            &raw_dir,
            layout.root(),
        ))
        .unwrap();

    let reloaded = layout.load().unwrap();
    for partition in Partition::ASSIGNED {
        for label in Label::ALL {
            assert_eq!(
                reloaded.count(partition, label),
                registry.count(partition, label)
            );
        }
    }
    assert!(layout.verify_manifest().unwrap().is_clean());

    let meta = layout.read_metadata().unwrap().unwrap();
    assert_eq!(meta.random_seed, 42);
    assert_eq!(meta.input.get(&Label::Fake), Some(&20));
    assert_eq!(meta.output[&Partition::Validation][&Label::Real], 4);

    // Deleting one referenced file yields exactly one MISSING_FILE violation.
    let victim = reloaded
        .view(Partition::Pool, Some(Label::Real))
        .samples()[0]
        .source_path
        .clone();
    std::fs::remove_file(&victim).unwrap();
    let report = check(&reloaded);
    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.count(ViolationKind::MissingFile), 1);
    assert!(matches!(
        report.into_result(),
        Err(MlError::DataIntegrity { .. })
    ));
}

#[test]
fn train_evaluate_and_serve() {
    let dir = TempDir::new().unwrap();
    let raw_dir = dir.path().join("raw");
    write_raw_tree(&raw_dir, 20);
    let raw = scan_raw(&raw_dir, &default_image_extensions()).unwrap();
    let registry = Partitioner::new(PartitionRatios::default(), 42)
        .unwrap()
        .partition(&raw)
        .unwrap();
    let layout = DatasetLayout::new(dir.path().join("dataset"));
    layout.materialize(&registry).unwrap();
    let registry = layout.load().unwrap();

    let checkpoints = dir.path().join("checkpoints");
    let orchestrator =
        TrainingOrchestrator::new(hyperparameters(), runtime(), &checkpoints).unwrap();
    let handle = spawn_training(
        orchestrator,
        LogisticClassifier::new(runtime()),
        registry.clone(),
    )
    .unwrap();
    let outcome = handle.join().unwrap().unwrap();

    let run = &outcome.run;
    assert!(matches!(
        run.state,
        RunState::Completed | RunState::StoppedEarly
    ));
    assert_eq!(run.seed_samples, 28);
    assert_eq!(run.validation_samples, 8);
    assert!(outcome.published);
    assert!(outcome.best.validated_improvement);

    let best_losses: Vec<f64> = run
        .history
        .epochs
        .iter()
        .filter(|e| e.improved)
        .map(|e| e.val_loss)
        .collect();
    assert!(best_losses.windows(2).all(|w| w[1] <= w[0]));
    assert!(outcome.best.validation_loss < run.baseline_val_loss.unwrap());

    let latest = resolve_latest(&checkpoints).unwrap();
    assert_eq!(latest.run_id, run.run_id);

    let service = InferenceService::from_latest(&checkpoints).unwrap();
    let report = Evaluator::default()
        .evaluate_partition(&service, &registry, Partition::Validation)
        .unwrap();
    assert_eq!(report.samples, 8);
    assert_eq!(report.confusion.total(), 8);
    assert!(report.accuracy >= 0.75, "accuracy {}", report.accuracy);

    let report_path = dir.path().join("reports").join("validation.json");
    report.write(&report_path).unwrap();
    assert!(report_path.is_file());

    let fake = registry.view(Partition::Pool, Some(Label::Fake)).samples()[0]
        .source_path
        .clone();
    let result = service.predict(&fake).unwrap();
    assert_eq!(result.label, Label::Fake);
    assert!(result.confidence >= 0.5);
    assert!((result.fake_probability + result.real_probability - 1.0).abs() < 1e-9);

    let chosen = select_from_registry(&IdentifierOrderSelector, &service, &registry, 3).unwrap();
    assert_eq!(chosen.len(), 3);
    assert!(
        chosen
            .iter()
            .all(|id| registry.get(id).unwrap().partition == Partition::Pool)
    );
}

#[test]
fn empty_validation_is_rejected_before_training() {
    let dir = TempDir::new().unwrap();
    let raw_dir = dir.path().join("raw");
    write_raw_tree(&raw_dir, 6);
    let raw = scan_raw(&raw_dir, &default_image_extensions()).unwrap();
    let registry = Partitioner::new(PartitionRatios::new(1.0, 0.0, 0.0).unwrap(), 1)
        .unwrap()
        .partition(&raw)
        .unwrap();

    assert!(matches!(
        Evaluator::default().evaluate_partition(
            &LogisticClassifier::new(runtime()),
            &registry,
            Partition::Validation
        ),
        Err(MlError::EmptyPartition(_))
    ));

    let orchestrator =
        TrainingOrchestrator::new(hyperparameters(), runtime(), dir.path().join("ckpt")).unwrap();
    let err = orchestrator
        .run(&mut LogisticClassifier::new(runtime()), &registry)
        .unwrap_err();
    assert!(matches!(err, MlError::InsufficientData(_)));
    assert!(resolve_latest(&dir.path().join("ckpt")).is_err());
}
