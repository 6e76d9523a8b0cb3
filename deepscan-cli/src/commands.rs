//! CLI subcommand handlers.

use crate::{Commands, ConfigAction};
use anyhow::{Context, bail};
use deepscan_ml::config::CONFIG_FILE;
use deepscan_ml::data::integrity::check_records;
use deepscan_ml::data::layout::{SplitMetadata, scan_raw};
use deepscan_ml::{
    BalanceAnalyzer, DatasetLayout, Evaluator, InferenceResult, InferenceService, Label,
    LogisticClassifier, Partition, Partitioner, PipelineConfig, TrainingOrchestrator,
    load_config, spawn_training,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    if let Commands::Config {
        action: ConfigAction::Init,
    } = command
    {
        return init_config(workspace);
    }

    let config = load_config(Some(workspace), config_path)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    match command {
        Commands::Split { raw, output, seed } => handle_split(&config, workspace, raw, output, seed),
        Commands::Check => handle_check(&config, workspace),
        Commands::Balance => handle_balance(&config, workspace),
        Commands::Inspect => handle_inspect(&config, workspace),
        Commands::Train { epochs } => handle_train(config, workspace, epochs).await,
        Commands::Evaluate {
            partition,
            checkpoint,
        } => handle_evaluate(&config, workspace, &partition, checkpoint),
        Commands::Predict { images, checkpoint } => {
            handle_predict(&config, workspace, &images, checkpoint)
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", config.to_toml()?);
                Ok(())
            }
            ConfigAction::Init => init_config(workspace),
        },
    }
}

fn init_config(workspace: &Path) -> anyhow::Result<()> {
    let config_path = workspace.join(CONFIG_FILE);
    if config_path.exists() {
        println!(
            "Configuration file already exists at: {}",
            config_path.display()
        );
        return Ok(());
    }
    std::fs::create_dir_all(workspace)?;
    std::fs::write(&config_path, PipelineConfig::default().to_toml()?)?;
    println!(
        "Created default configuration at: {}",
        config_path.display()
    );
    Ok(())
}

/// Relative configuration paths are taken from the workspace.
fn resolve(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

fn layout(config: &PipelineConfig, workspace: &Path) -> DatasetLayout {
    DatasetLayout::new(resolve(workspace, &config.data.dataset_dir))
        .with_extensions(config.data.extensions.clone())
}

fn handle_split(
    config: &PipelineConfig,
    workspace: &Path,
    raw: Option<PathBuf>,
    output: Option<PathBuf>,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    let raw_dir = resolve(workspace, raw.as_deref().unwrap_or(&config.data.raw_dir));
    let out_dir = resolve(workspace, output.as_deref().unwrap_or(&config.data.dataset_dir));
    let seed = seed.unwrap_or(config.partition.random_seed);
    let ratios = config.partition.ratios();

    let raw_samples = scan_raw(&raw_dir, &config.data.extensions)?;
    let strata = config.partition.strata;
    let registry = Partitioner::new(ratios, seed)?
        .with_strata(strata)?
        .partition(&raw_samples)?;

    let layout = DatasetLayout::new(&out_dir).with_extensions(config.data.extensions.clone());
    let summary = layout.materialize(&registry)?;
    let metadata = SplitMetadata::new(&registry, ratios, seed, &raw_dir, &out_dir)
        .with_strata(&registry, strata);
    layout.write_metadata(&metadata)?;

    println!("Split {} images (seed {seed}) into {}", summary.copied, out_dir.display());
    for partition in Partition::ASSIGNED {
        let counts = summary.counts.get(&partition);
        let count = |label: Label| counts.and_then(|c| c.get(&label)).copied().unwrap_or(0);
        println!(
            "  {:<10} real {:>6}  fake {:>6}",
            partition.to_string(),
            count(Label::Real),
            count(Label::Fake)
        );
    }
    if strata > 1 {
        println!("  SEED share per stratum:");
        for stratum in &metadata.strata {
            println!(
                "    {} #{}  {:>6} of {:>6}",
                stratum.label,
                stratum.index + 1,
                stratum.seed,
                stratum.total
            );
        }
    }
    println!("All {} images accounted for.", raw_samples.len());

    let report = BalanceAnalyzer::new(config.balance.imbalance_threshold).analyze(&registry);
    for flagged in report.flagged() {
        warn!(
            partition = %flagged.partition,
            ratio = flagged.imbalance_ratio,
            "Partition is imbalanced"
        );
    }
    Ok(())
}

fn handle_check(config: &PipelineConfig, workspace: &Path) -> anyhow::Result<()> {
    let layout = layout(config, workspace);
    let scan = layout.scan()?;
    for path in &scan.unexpected {
        println!("  unexpected entry: {}", path.display());
    }

    let mut violations = check_records(&scan.records).violations;
    if layout.manifest_path().exists() {
        violations.extend(layout.verify_manifest()?.violations);
    } else {
        info!(root = %layout.root().display(), "No manifest, checked directory layout only");
    }

    if violations.is_empty() {
        println!(
            "{}: {} samples, no violations",
            layout.root().display(),
            scan.records.len()
        );
        return Ok(());
    }
    for v in &violations {
        println!("  [{}] {}: {}", v.kind, v.identifier, v.detail);
    }
    bail!(
        "{} integrity violations in {}",
        violations.len(),
        layout.root().display()
    )
}

fn handle_balance(config: &PipelineConfig, workspace: &Path) -> anyhow::Result<()> {
    let registry = layout(config, workspace).load()?;
    let report = BalanceAnalyzer::new(config.balance.imbalance_threshold).analyze(&registry);

    println!("Balance (threshold {:.2}):", report.threshold);
    for p in &report.partitions {
        println!(
            "  {:<10} real {:>6}  fake {:>6}  ratio {:>6.2}{}",
            p.partition.to_string(),
            p.count(Label::Real),
            p.count(Label::Fake),
            p.imbalance_ratio,
            if p.imbalanced { "  IMBALANCED" } else { "" }
        );
    }
    Ok(())
}

fn handle_inspect(config: &PipelineConfig, workspace: &Path) -> anyhow::Result<()> {
    let layout = layout(config, workspace);
    let registry = layout.load()?;

    println!("Label indices:");
    for label in Label::ALL {
        println!("  {label} = {}", label.target() as u8);
    }
    println!("Samples ({} total):", registry.len());
    for partition in Partition::ASSIGNED {
        println!(
            "  {:<10} real {:>6}  fake {:>6}",
            partition.to_string(),
            registry.count(partition, Label::Real),
            registry.count(partition, Label::Fake)
        );
    }
    if let Some(meta) = layout.read_metadata()? {
        println!(
            "Split at {} with seed {} from {}",
            meta.timestamp.format("%Y-%m-%d %H:%M:%S"),
            meta.random_seed,
            meta.raw_dir.display()
        );
    }
    Ok(())
}

async fn handle_train(
    mut config: PipelineConfig,
    workspace: &Path,
    epochs: Option<usize>,
) -> anyhow::Result<()> {
    if let Some(epochs) = epochs {
        config.training.epochs = epochs;
    }
    let registry = layout(&config, workspace).load()?;
    let checkpoint_root = resolve(workspace, &config.checkpoints.dir);

    let orchestrator = TrainingOrchestrator::new(
        config.training.clone(),
        config.runtime.clone(),
        &checkpoint_root,
    )?
    .with_imbalance_threshold(config.balance.imbalance_threshold);
    let classifier = LogisticClassifier::new(config.runtime.clone());

    let handle = spawn_training(orchestrator, classifier, registry)?;
    let joined = tokio::task::spawn_blocking(move || handle.join());

    let outcome = tokio::select! {
        joined = joined => joined
            .context("training task failed")?
            .map_err(|_| anyhow::anyhow!("training thread panicked"))??,
        _ = tokio::signal::ctrl_c() => {
            bail!("interrupted; the last persisted best checkpoint under {} is intact", checkpoint_root.display());
        }
    };

    let run = &outcome.run;
    println!("Run {} finished: {}", run.run_id, run.state);
    println!(
        "  epochs {}  baseline val loss {}",
        run.history.epochs_completed(),
        run.baseline_val_loss
            .map(|l| format!("{l:.4}"))
            .unwrap_or_else(|| "-".into())
    );
    println!(
        "  best epoch {}  val loss {:.4}  checkpoint {}",
        outcome.best.epoch,
        outcome.best.validation_loss,
        outcome.best.path.display()
    );
    if outcome.published {
        println!("  published as latest");
    } else {
        println!("  not published: no epoch improved on the untrained model");
    }
    for signal in &run.signals {
        println!("  signal: {}", serde_json::to_string(signal)?);
    }
    Ok(())
}

fn load_service(
    config: &PipelineConfig,
    workspace: &Path,
    checkpoint: Option<PathBuf>,
) -> anyhow::Result<InferenceService> {
    let service = match checkpoint {
        Some(path) => InferenceService::from_checkpoint(&resolve(workspace, &path))?,
        None => InferenceService::from_latest(&resolve(workspace, &config.checkpoints.dir))?,
    };
    Ok(service.with_threshold(config.evaluation.threshold)?)
}

fn handle_evaluate(
    config: &PipelineConfig,
    workspace: &Path,
    partition: &str,
    checkpoint: Option<PathBuf>,
) -> anyhow::Result<()> {
    let partition: Partition = partition.parse()?;
    let service = load_service(config, workspace, checkpoint)?;
    let registry = layout(config, workspace).load()?;

    let report = Evaluator::new(config.evaluation.threshold)?
        .evaluate_partition(&service, &registry, partition)?
        .with_model(service.source().display().to_string());

    let report_path = resolve(workspace, &config.evaluation.report_dir).join(format!(
        "{}-{}.json",
        partition.dir_name(),
        report.evaluated_at.format("%Y%m%dT%H%M%S")
    ));
    report.write(&report_path)?;

    println!("{}", report.summary());
    let c = &report.confusion;
    println!("Confusion matrix (rows actual, columns predicted):");
    println!("               REAL    FAKE");
    println!("  REAL   {:>8} {:>7}", c.true_negative, c.false_positive);
    println!("  FAKE   {:>8} {:>7}", c.false_negative, c.true_positive);
    println!("  {:<6} {:>9} {:>9} {:>9} {:>9}", "", "precision", "recall", "f1", "support");
    for (label, m) in &report.per_class {
        println!(
            "  {:<6} {:>9.4} {:>9.4} {:>9.4} {:>9}",
            label.to_string(),
            m.precision,
            m.recall,
            m.f1,
            m.support
        );
    }
    println!("Report written to {}", report_path.display());
    Ok(())
}

#[derive(Serialize)]
struct PredictionLine<'a> {
    image: &'a Path,
    #[serde(flatten)]
    result: InferenceResult,
}

fn handle_predict(
    config: &PipelineConfig,
    workspace: &Path,
    images: &[PathBuf],
    checkpoint: Option<PathBuf>,
) -> anyhow::Result<()> {
    let service = load_service(config, workspace, checkpoint)?;
    let mut failed = 0usize;
    for (image, result) in service.predict_batch(images) {
        match result {
            Ok(result) => {
                let line = PredictionLine {
                    image: &image,
                    result,
                };
                println!("{}", serde_json::to_string(&line)?);
            }
            Err(e) => {
                failed += 1;
                eprintln!("{}: {e}", image.display());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} images could not be classified", images.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepscan_ml::EvaluationReport;
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    /// Dark images are REAL, bright ones FAKE, so a few epochs separate them.
    fn write_raw_tree(root: &Path, per_class: u32) {
        for (label, base) in [("real", 40u8), ("fake", 200u8)] {
            let dir = root.join("data/raw").join(label);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let img = GrayImage::from_fn(24, 24, |x, y| {
                    Luma([base.wrapping_add(((x + y + i) % 16) as u8)])
                });
                img.save(dir.join(format!("{label}_{i:03}.png"))).unwrap();
            }
        }
    }

    fn small_config(workspace: &Path) {
        std::fs::write(
            workspace.join(CONFIG_FILE),
            "[training]\nepochs = 3\nbatch_size = 8\nlearning_rate = 0.5\n\n[runtime]\nworker_threads = 2\n",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, dir.path(), None).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        let parsed: PipelineConfig = toml_parse(&content);
        assert_eq!(parsed, PipelineConfig::default());
    }

    fn toml_parse(content: &str) -> PipelineConfig {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("parsed.toml");
        std::fs::write(&path, content).unwrap();
        load_config(None, Some(&path)).unwrap()
    }

    #[tokio::test]
    async fn test_config_init_idempotent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[training]\nepochs = 4\n").unwrap();
        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, dir.path(), None).await.unwrap();
        let content = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(content, "[training]\nepochs = 4\n");
    }

    #[tokio::test]
    async fn test_config_show_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[training]\nepochs = 0\n").unwrap();
        let command = Commands::Config {
            action: ConfigAction::Show,
        };
        assert!(handle_command(command, dir.path(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_split_check_train_evaluate_predict() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path();
        write_raw_tree(ws, 20);
        small_config(ws);

        handle_command(
            Commands::Split {
                raw: None,
                output: None,
                seed: None,
            },
            ws,
            None,
        )
        .await
        .unwrap();
        assert!(ws.join("data/dataset/split_metadata.json").is_file());
        assert_eq!(
            std::fs::read_dir(ws.join("data/dataset/seed/real"))
                .unwrap()
                .count(),
            14
        );

        handle_command(Commands::Check, ws, None).await.unwrap();
        handle_command(Commands::Balance, ws, None).await.unwrap();
        handle_command(Commands::Inspect, ws, None).await.unwrap();

        handle_command(Commands::Train { epochs: None }, ws, None)
            .await
            .unwrap();
        assert!(ws.join("checkpoints/latest.json").is_file());

        handle_command(
            Commands::Evaluate {
                partition: "validation".into(),
                checkpoint: None,
            },
            ws,
            None,
        )
        .await
        .unwrap();
        let report_path = std::fs::read_dir(ws.join("reports"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let report = EvaluationReport::load(&report_path).unwrap();
        assert_eq!(report.samples, 8);
        assert_eq!(report.confusion.total(), 8);

        let probe = ws.join("data/dataset/pool/fake");
        let image = std::fs::read_dir(&probe).unwrap().next().unwrap().unwrap().path();
        handle_command(
            Commands::Predict {
                images: vec![image],
                checkpoint: None,
            },
            ws,
            None,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stratified_split_records_strata() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path();
        write_raw_tree(ws, 20);
        std::fs::write(ws.join(CONFIG_FILE), "[partition]\nstrata = 4\n").unwrap();
        handle_command(
            Commands::Split {
                raw: None,
                output: None,
                seed: Some(3),
            },
            ws,
            None,
        )
        .await
        .unwrap();

        let metadata = DatasetLayout::new(ws.join("data/dataset"))
            .read_metadata()
            .unwrap()
            .unwrap();
        assert_eq!(metadata.strata.len(), 8);
        for stratum in &metadata.strata {
            assert_eq!(stratum.total, 5);
            assert_eq!(stratum.seed, 4);
        }
        handle_command(Commands::Check, ws, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_check_fails_after_file_removed() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path();
        write_raw_tree(ws, 10);
        handle_command(
            Commands::Split {
                raw: None,
                output: None,
                seed: Some(7),
            },
            ws,
            None,
        )
        .await
        .unwrap();

        let victim = std::fs::read_dir(ws.join("data/dataset/validation/fake"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        std::fs::remove_file(victim).unwrap();
        assert!(handle_command(Commands::Check, ws, None).await.is_err());
    }

    #[tokio::test]
    async fn test_predict_without_published_checkpoint_fails() {
        let dir = TempDir::new().unwrap();
        let result = handle_command(
            Commands::Predict {
                images: vec![dir.path().join("x.png")],
                checkpoint: None,
            },
            dir.path(),
            None,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_evaluate_rejects_unknown_partition() {
        let dir = TempDir::new().unwrap();
        let result = handle_command(
            Commands::Evaluate {
                partition: "holdout".into(),
                checkpoint: None,
            },
            dir.path(),
            None,
        )
        .await;
        assert!(result.is_err());
    }
}
