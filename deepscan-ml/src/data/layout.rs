//! On-disk dataset layout: raw input scanning, the partitioned directory tree,
//! its manifest and split metadata.
//!
//! ```text
//! <raw>/real/*.jpg        <root>/seed/{real,fake}/*
//! <raw>/fake/*.jpg        <root>/validation/{real,fake}/*
//!                         <root>/pool/{real,fake}/*
//!                         <root>/manifest.json
//!                         <root>/split_metadata.json
//! ```
//!
//! Directory membership is the assignment. The manifest is the index written
//! next to it; both are checked through [`check_records`] before a registry is
//! built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::data::integrity::{
    IntegrityReport, PartitionRecord, Violation, ViolationKind, check_records,
};
use crate::data::partition::{PartitionRatios, StratumStats, stratum_stats};
use crate::data::registry::SampleRegistry;
use crate::data::sample::{Label, Partition, RawSample, Sample};
use crate::error::MlError;
use crate::persistence::{atomic_write_json, load_json};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SPLIT_METADATA_FILE: &str = "split_metadata.json";
pub const MANIFEST_VERSION: u32 = 1;

pub fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "bmp", "gif", "webp"]
        .iter()
        .map(|e| e.to_string())
        .collect()
}

fn has_image_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Identifier scheme shared by raw scans and layout scans.
pub fn identifier_for(label: &str, path: &Path) -> String {
    format!("{label}/{}", file_name(path))
}

/// Image files directly inside `dir`, sorted by file name.
fn list_images(dir: &Path, extensions: &[String]) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut images = Vec::new();
    let mut other = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path().to_path_buf();
        if entry.file_type().is_file() && has_image_extension(&path, extensions) {
            images.push(path);
        } else {
            other.push(path);
        }
    }
    images.sort_by_key(|p| file_name(p));
    other.sort();
    (images, other)
}

/// Collect labeled raw samples from `<raw>/real` and `<raw>/fake`.
pub fn scan_raw(raw_root: &Path, extensions: &[String]) -> Result<Vec<RawSample>, MlError> {
    let mut raw = Vec::new();
    for label in Label::ALL {
        let dir = raw_root.join(label.dir_name());
        if !dir.is_dir() {
            return Err(MlError::not_found(format!(
                "raw class directory {}",
                dir.display()
            )));
        }
        let (images, other) = list_images(&dir, extensions);
        if !other.is_empty() {
            warn!(dir = %dir.display(), skipped = other.len(), "Skipping non-image entries");
        }
        if images.is_empty() {
            return Err(MlError::insufficient(format!(
                "no {label} images found in {}",
                dir.display()
            )));
        }
        info!(label = %label, count = images.len(), "Scanned raw class directory");
        raw.extend(
            images
                .into_iter()
                .map(|path| RawSample::new(identifier_for(label.dir_name(), &path), label, path)),
        );
    }
    Ok(raw)
}

/// One manifest row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub label: String,
    pub partition: Partition,
    /// Location inside the layout root.
    pub path: PathBuf,
    /// Where the bytes were copied from.
    pub origin: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub entries: BTreeMap<String, ManifestEntry>,
}

/// Split configuration and outcome, written next to the layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitMetadata {
    pub timestamp: DateTime<Utc>,
    pub random_seed: u64,
    pub ratios: PartitionRatios,
    pub input: BTreeMap<Label, usize>,
    pub output: BTreeMap<Partition, BTreeMap<Label, usize>>,
    pub raw_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Per-stratum counts, one entry per label and stratum.
    #[serde(default)]
    pub strata: Vec<StratumStats>,
}

impl SplitMetadata {
    pub fn new(
        registry: &SampleRegistry,
        ratios: PartitionRatios,
        random_seed: u64,
        raw_dir: &Path,
        output_dir: &Path,
    ) -> Self {
        let mut input = BTreeMap::new();
        for sample in registry.iter() {
            *input.entry(sample.label).or_insert(0) += 1;
        }
        let output = Partition::ASSIGNED
            .iter()
            .map(|p| {
                let counts = Label::ALL
                    .iter()
                    .map(|l| (*l, registry.count(*p, *l)))
                    .collect();
                (*p, counts)
            })
            .collect();
        Self {
            timestamp: Utc::now(),
            random_seed,
            ratios,
            input,
            output,
            raw_dir: raw_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            strata: Vec::new(),
        }
    }

    /// Record where each of `strata` identifier-ordered blocks ended up.
    pub fn with_strata(mut self, registry: &SampleRegistry, strata: usize) -> Self {
        self.strata = stratum_stats(registry, strata);
        self
    }
}

/// Result of walking a partitioned layout.
#[derive(Debug, Clone, Default)]
pub struct LayoutScan {
    pub records: Vec<PartitionRecord>,
    /// Entries that are neither partition/label directories nor image files.
    pub unexpected: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeSummary {
    pub copied: usize,
    pub skipped_unassigned: usize,
    pub counts: BTreeMap<Partition, BTreeMap<Label, usize>>,
}

/// A partitioned dataset rooted at one directory.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    root: PathBuf,
    extensions: Vec<String>,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: default_image_extensions(),
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(SPLIT_METADATA_FILE)
    }

    pub fn class_dir(&self, partition: Partition, label: Label) -> PathBuf {
        self.root.join(partition.dir_name()).join(label.dir_name())
    }

    /// Walk the tree. Any subdirectory of a partition directory is treated as
    /// a label directory so that stray classes surface as `UNKNOWN_LABEL`.
    pub fn scan(&self) -> Result<LayoutScan, MlError> {
        if !self.root.is_dir() {
            return Err(MlError::not_found(format!(
                "layout root {}",
                self.root.display()
            )));
        }
        let mut scan = LayoutScan::default();
        let known: BTreeSet<&str> = Partition::ASSIGNED.iter().map(|p| p.dir_name()).collect();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type()?.is_dir();
            if is_dir && known.contains(name.as_str()) {
                continue;
            }
            if !is_dir && (name == MANIFEST_FILE || name == SPLIT_METADATA_FILE) {
                continue;
            }
            scan.unexpected.push(path);
        }

        for partition in Partition::ASSIGNED {
            let partition_dir = self.root.join(partition.dir_name());
            if !partition_dir.is_dir() {
                continue;
            }
            let mut label_dirs = Vec::new();
            for entry in fs::read_dir(&partition_dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    label_dirs.push(entry.path());
                } else {
                    scan.unexpected.push(entry.path());
                }
            }
            label_dirs.sort();
            for label_dir in label_dirs {
                let label = file_name(&label_dir);
                let (images, other) = list_images(&label_dir, &self.extensions);
                scan.unexpected.extend(other);
                scan.records.extend(images.into_iter().map(|path| PartitionRecord {
                    identifier: identifier_for(&label, &path),
                    label: label.clone(),
                    source_path: path,
                    partition,
                }));
            }
        }
        scan.unexpected.sort();
        Ok(scan)
    }

    /// Build a registry from directory membership, failing on any violation.
    pub fn load(&self) -> Result<SampleRegistry, MlError> {
        let scan = self.scan()?;
        for path in &scan.unexpected {
            warn!(path = %path.display(), "Ignoring unexpected entry in layout");
        }
        registry_from_records(&scan.records)
    }

    /// Build a registry from the manifest index, failing on any violation.
    pub fn load_manifest(&self) -> Result<SampleRegistry, MlError> {
        let manifest = self.read_manifest()?;
        registry_from_records(&self.manifest_records(&manifest))
    }

    pub fn read_manifest(&self) -> Result<Manifest, MlError> {
        load_json(&self.manifest_path())?
            .ok_or_else(|| MlError::not_found(format!("{}", self.manifest_path().display())))
    }

    fn manifest_records(&self, manifest: &Manifest) -> Vec<PartitionRecord> {
        manifest
            .entries
            .iter()
            .map(|(id, entry)| PartitionRecord {
                identifier: id.clone(),
                label: entry.label.clone(),
                source_path: self.root.join(&entry.path),
                partition: entry.partition,
            })
            .collect()
    }

    /// Check the directory tree against the manifest written with it.
    pub fn verify_manifest(&self) -> Result<IntegrityReport, MlError> {
        let manifest = self.read_manifest()?;
        let mut report = check_records(&self.manifest_records(&manifest));

        let scan = self.scan()?;
        let on_disk: BTreeMap<&str, &PartitionRecord> = scan
            .records
            .iter()
            .map(|r| (r.identifier.as_str(), r))
            .collect();

        for (id, entry) in &manifest.entries {
            if let Some(found) = on_disk.get(id.as_str())
                && (found.partition != entry.partition || found.label != entry.label)
            {
                report.violations.push(Violation {
                    kind: ViolationKind::ManifestMismatch,
                    identifier: id.clone(),
                    detail: format!(
                        "manifest says {}/{}, layout has {}/{}",
                        entry.partition, entry.label, found.partition, found.label
                    ),
                });
            }
        }
        for record in &scan.records {
            if !manifest.entries.contains_key(&record.identifier) {
                report.violations.push(Violation {
                    kind: ViolationKind::ManifestMismatch,
                    identifier: record.identifier.clone(),
                    detail: format!("{} is not listed in the manifest", record.source_path.display()),
                });
            }
        }
        report.checked = report.checked.max(scan.records.len());
        Ok(report)
    }

    /// Copy every assigned sample into the layout and write the manifest.
    ///
    /// Refuses to write into a root that already has content. The tree is
    /// built in a hidden sibling directory and renamed into place only once
    /// the manifest is written and every copy is accounted for, so a failed
    /// run leaves no partial layout behind.
    pub fn materialize(&self, registry: &SampleRegistry) -> Result<MaterializeSummary, MlError> {
        if self.root.exists() && fs::read_dir(&self.root)?.next().is_some() {
            return Err(MlError::config(format!(
                "layout root {} is not empty",
                self.root.display()
            )));
        }
        let staging = DatasetLayout {
            root: staging_sibling(&self.root),
            extensions: self.extensions.clone(),
        };
        if staging.root.exists() {
            fs::remove_dir_all(&staging.root)?;
        }

        let summary = match staging.copy_from(registry) {
            Ok(summary) => summary,
            Err(err) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging.root) {
                    warn!(
                        staging = %staging.root.display(),
                        error = %cleanup,
                        "Failed to remove staging directory"
                    );
                }
                return Err(err);
            }
        };

        if self.root.exists() {
            fs::remove_dir(&self.root)?;
        }
        fs::rename(&staging.root, &self.root)?;
        info!(
            root = %self.root.display(),
            copied = summary.copied,
            "Materialized partition layout"
        );
        Ok(summary)
    }

    fn copy_from(&self, registry: &SampleRegistry) -> Result<MaterializeSummary, MlError> {
        for partition in Partition::ASSIGNED {
            for label in Label::ALL {
                fs::create_dir_all(self.class_dir(partition, label))?;
            }
        }

        let mut summary = MaterializeSummary::default();
        let mut entries = BTreeMap::new();
        for sample in registry.iter() {
            if sample.partition == Partition::Unassigned {
                summary.skipped_unassigned += 1;
                continue;
            }
            let name = file_name(&sample.source_path);
            let relative = PathBuf::from(sample.partition.dir_name())
                .join(sample.label.dir_name())
                .join(&name);
            let dest = self.root.join(&relative);
            if dest.exists() {
                return Err(MlError::DuplicateIdentifier(format!(
                    "{} collides with an already copied file",
                    relative.display()
                )));
            }
            fs::copy(&sample.source_path, &dest)?;
            summary.copied += 1;
            *summary
                .counts
                .entry(sample.partition)
                .or_default()
                .entry(sample.label)
                .or_insert(0) += 1;
            entries.insert(
                identifier_for(sample.label.dir_name(), &dest),
                ManifestEntry {
                    label: sample.label.dir_name().to_string(),
                    partition: sample.partition,
                    path: relative,
                    origin: sample.source_path.clone(),
                },
            );
        }

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            created_at: Utc::now(),
            entries,
        };
        atomic_write_json(&self.manifest_path(), &manifest)?;

        let written = self.scan()?.records.len();
        if written != summary.copied {
            return Err(MlError::integrity(
                ViolationKind::MissingFile,
                self.root.display().to_string(),
                format!("copied {} files but found {written} in layout", summary.copied),
            ));
        }
        Ok(summary)
    }

    pub fn write_metadata(&self, metadata: &SplitMetadata) -> Result<(), MlError> {
        atomic_write_json(&self.metadata_path(), metadata)?;
        Ok(())
    }

    pub fn read_metadata(&self) -> Result<Option<SplitMetadata>, MlError> {
        Ok(load_json(&self.metadata_path())?)
    }
}

fn staging_sibling(root: &Path) -> PathBuf {
    root.with_file_name(format!(
        ".{}.staging-{}",
        file_name(root),
        std::process::id()
    ))
}

fn registry_from_records(records: &[PartitionRecord]) -> Result<SampleRegistry, MlError> {
    check_records(records).into_result()?;
    let mut registry = SampleRegistry::new();
    for record in records {
        let label: Label = record.label.parse()?;
        registry.register(
            Sample::new(record.identifier.clone(), label, record.source_path.clone())
                .with_partition(record.partition),
        )?;
    }
    Ok(registry)
}
