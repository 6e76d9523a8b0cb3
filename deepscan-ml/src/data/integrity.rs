//! Structural integrity checks over a registry or raw partition records.
//!
//! The checker never mutates anything and never decides what is fatal: it
//! returns every violation it finds and leaves the decision to the caller.
//! Duplicates and unknown labels cannot exist inside a [`SampleRegistry`], so
//! those kinds mostly surface through [`check_records`], which is what the
//! on-disk layout and manifest loaders run before building a registry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use crate::data::registry::SampleRegistry;
use crate::data::sample::{Label, Partition};
use crate::error::MlError;

/// Partitions that must hold at least one sample for training to make sense.
pub const REQUIRED_PARTITIONS: [Partition; 2] = [Partition::Seed, Partition::Validation];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    MissingFile,
    DuplicateIdentifier,
    UnknownLabel,
    CrossPartitionLeak,
    EmptyPartition,
    /// The layout and its manifest disagree about a file.
    ManifestMismatch,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ViolationKind::MissingFile => "MISSING_FILE",
            ViolationKind::DuplicateIdentifier => "DUPLICATE_IDENTIFIER",
            ViolationKind::UnknownLabel => "UNKNOWN_LABEL",
            ViolationKind::CrossPartitionLeak => "CROSS_PARTITION_LEAK",
            ViolationKind::EmptyPartition => "EMPTY_PARTITION",
            ViolationKind::ManifestMismatch => "MANIFEST_MISMATCH",
        })
    }
}

/// A single integrity problem. `identifier` names the sample, or the partition
/// for [`ViolationKind::EmptyPartition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub identifier: String,
    pub detail: String,
}

impl Violation {
    fn new(kind: ViolationKind, identifier: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            detail: detail.into(),
        }
    }
}

/// An unvalidated (identifier, label, path, partition) record, as read from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub identifier: String,
    pub label: String,
    pub source_path: PathBuf,
    pub partition: Partition,
}

/// Outcome of an integrity pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub violations: Vec<Violation>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn count(&self, kind: ViolationKind) -> usize {
        self.violations.iter().filter(|v| v.kind == kind).count()
    }

    pub fn counts_by_kind(&self) -> BTreeMap<ViolationKind, usize> {
        let mut counts = BTreeMap::new();
        for v in &self.violations {
            *counts.entry(v.kind).or_insert(0) += 1;
        }
        counts
    }

    /// Turn a dirty report into a `DataIntegrity` error naming the first violation.
    pub fn into_result(self) -> Result<usize, MlError> {
        let remaining = self.violations.len().saturating_sub(1);
        match self.violations.into_iter().next() {
            None => Ok(self.checked),
            Some(first) => {
                let detail = if remaining > 0 {
                    format!("{} (and {remaining} more violations)", first.detail)
                } else {
                    first.detail
                };
                Err(MlError::integrity(first.kind, first.identifier, detail))
            }
        }
    }
}

/// Check a registry. Equivalent to [`check_records`] over its samples.
pub fn check(registry: &SampleRegistry) -> IntegrityReport {
    let records: Vec<PartitionRecord> = registry
        .iter()
        .map(|s| PartitionRecord {
            identifier: s.identifier.clone(),
            label: s.label.dir_name().to_string(),
            source_path: s.source_path.clone(),
            partition: s.partition,
        })
        .collect();
    check_records(&records)
}

/// Check raw records that have not been through the registry API.
pub fn check_records(records: &[PartitionRecord]) -> IntegrityReport {
    let mut violations = Vec::new();
    let mut partitions_by_id: BTreeMap<&str, Vec<Partition>> = BTreeMap::new();
    let mut partitions_by_path: BTreeMap<&PathBuf, BTreeSet<Partition>> = BTreeMap::new();
    let mut populated: BTreeSet<Partition> = BTreeSet::new();

    for record in records {
        partitions_by_id
            .entry(record.identifier.as_str())
            .or_default()
            .push(record.partition);
        partitions_by_path
            .entry(&record.source_path)
            .or_default()
            .insert(record.partition);
        populated.insert(record.partition);

        if record.label.parse::<Label>().is_err() {
            violations.push(Violation::new(
                ViolationKind::UnknownLabel,
                &record.identifier,
                format!("label '{}' is neither real nor fake", record.label),
            ));
        }
        if !record.source_path.is_file() {
            violations.push(Violation::new(
                ViolationKind::MissingFile,
                &record.identifier,
                format!("{} does not exist", record.source_path.display()),
            ));
        }
    }

    for (identifier, partitions) in &partitions_by_id {
        if partitions.len() < 2 {
            continue;
        }
        let distinct: BTreeSet<_> = partitions.iter().collect();
        if distinct.len() > 1 {
            let names: Vec<String> = distinct.iter().map(|p| p.to_string()).collect();
            violations.push(Violation::new(
                ViolationKind::CrossPartitionLeak,
                *identifier,
                format!("identifier appears in {}", names.join(", ")),
            ));
        } else {
            violations.push(Violation::new(
                ViolationKind::DuplicateIdentifier,
                *identifier,
                format!("identifier registered {} times", partitions.len()),
            ));
        }
    }

    for (path, partitions) in &partitions_by_path {
        if partitions.len() > 1 {
            let names: Vec<String> = partitions.iter().map(|p| p.to_string()).collect();
            violations.push(Violation::new(
                ViolationKind::CrossPartitionLeak,
                path.display().to_string(),
                format!("same source file feeds {}", names.join(", ")),
            ));
        }
    }

    for partition in REQUIRED_PARTITIONS {
        if !populated.contains(&partition) {
            violations.push(Violation::new(
                ViolationKind::EmptyPartition,
                partition.dir_name(),
                format!("{partition} holds no samples"),
            ));
        }
    }

    IntegrityReport {
        checked: records.len(),
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sample::Sample;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, b"img").unwrap();
        path
    }

    fn record(id: &str, label: &str, path: PathBuf, partition: Partition) -> PartitionRecord {
        PartitionRecord {
            identifier: id.into(),
            label: label.into(),
            source_path: path,
            partition,
        }
    }

    fn clean_registry(dir: &TempDir) -> SampleRegistry {
        let mut reg = SampleRegistry::new();
        for (id, label, partition) in [
            ("real/a.jpg", Label::Real, Partition::Seed),
            ("fake/a.jpg", Label::Fake, Partition::Seed),
            ("real/b.jpg", Label::Real, Partition::Validation),
            ("fake/b.jpg", Label::Fake, Partition::Validation),
            ("fake/c.jpg", Label::Fake, Partition::Pool),
        ] {
            let path = touch(dir, &id.replace('/', "_"));
            reg.register(Sample::new(id, label, path).with_partition(partition))
                .unwrap();
        }
        reg
    }

    #[test]
    fn test_clean_registry_has_no_violations() {
        let dir = TempDir::new().unwrap();
        let report = check(&clean_registry(&dir));
        assert!(report.is_clean(), "{:?}", report.violations);
        assert_eq!(report.checked, 5);
    }

    #[test]
    fn test_deleted_file_yields_exactly_one_missing_file() {
        let dir = TempDir::new().unwrap();
        let reg = clean_registry(&dir);
        fs::remove_file(&reg.get("fake/b.jpg").unwrap().source_path).unwrap();

        let report = check(&reg);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::MissingFile);
        assert_eq!(report.violations[0].identifier, "fake/b.jpg");
    }

    #[test]
    fn test_empty_required_partition_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut reg = clean_registry(&dir);
        reg.reassign_partition("real/b.jpg", Partition::Pool).unwrap();
        reg.reassign_partition("fake/b.jpg", Partition::Pool).unwrap();

        let report = check(&reg);
        assert_eq!(report.count(ViolationKind::EmptyPartition), 1);
        assert_eq!(report.violations[0].identifier, "validation");
    }

    #[test]
    fn test_records_detect_leak_duplicate_and_unknown_label() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.jpg");
        let b = touch(&dir, "b.jpg");
        let c = touch(&dir, "c.jpg");
        let records = vec![
            record("real/a.jpg", "real", a.clone(), Partition::Seed),
            record("real/a.jpg", "real", a, Partition::Validation),
            record("fake/b.jpg", "fake", b.clone(), Partition::Seed),
            record("fake/b.jpg", "fake", b, Partition::Seed),
            record("misc/c.jpg", "cartoon", c, Partition::Validation),
        ];

        let report = check_records(&records);
        let counts = report.counts_by_kind();
        // real/a.jpg leaks by identifier and by shared file.
        assert_eq!(counts.get(&ViolationKind::CrossPartitionLeak), Some(&2));
        assert_eq!(counts.get(&ViolationKind::DuplicateIdentifier), Some(&1));
        assert_eq!(counts.get(&ViolationKind::UnknownLabel), Some(&1));
        assert_eq!(counts.get(&ViolationKind::MissingFile), None);
    }

    #[test]
    fn test_into_result_carries_kind_and_identifier() {
        let dir = TempDir::new().unwrap();
        let reg = clean_registry(&dir);
        fs::remove_file(&reg.get("real/a.jpg").unwrap().source_path).unwrap();

        match check(&reg).into_result() {
            Err(MlError::DataIntegrity {
                kind, identifier, ..
            }) => {
                assert_eq!(kind, ViolationKind::MissingFile);
                assert_eq!(identifier, "real/a.jpg");
            }
            other => panic!("expected integrity error, got {other:?}"),
        }
    }
}
