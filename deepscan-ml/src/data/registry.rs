//! The sample registry: authoritative identifier -> sample index.
//!
//! Partition assignment lives only here. Views are recomputed from the map on
//! every call, so a view can never drift from the registry that produced it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::sample::{Label, Partition, Sample};
use crate::error::MlError;

/// Registry of every known sample, keyed by identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleRegistry {
    samples: BTreeMap<String, Sample>,
}

impl SampleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sample. Fails if the identifier is already registered.
    pub fn register(&mut self, sample: Sample) -> Result<(), MlError> {
        if self.samples.contains_key(&sample.identifier) {
            return Err(MlError::DuplicateIdentifier(sample.identifier));
        }
        self.samples.insert(sample.identifier.clone(), sample);
        Ok(())
    }

    pub fn get(&self, identifier: &str) -> Result<&Sample, MlError> {
        self.samples
            .get(identifier)
            .ok_or_else(|| MlError::not_found(format!("sample '{identifier}'")))
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.samples.contains_key(identifier)
    }

    /// Move a sample to another partition, returning the partition it left.
    pub fn reassign_partition(
        &mut self,
        identifier: &str,
        partition: Partition,
    ) -> Result<Partition, MlError> {
        let sample = self
            .samples
            .get_mut(identifier)
            .ok_or_else(|| MlError::not_found(format!("sample '{identifier}'")))?;
        let previous = sample.partition;
        sample.partition = partition;
        debug!(identifier, from = %previous, to = %partition, "Reassigned sample");
        Ok(previous)
    }

    /// Promote pool samples to the seed partition.
    ///
    /// All identifiers are checked before anything moves; a single missing or
    /// non-pool identifier leaves the registry untouched.
    pub fn promote_to_seed(&mut self, identifiers: &[String]) -> Result<usize, MlError> {
        for id in identifiers {
            let sample = self.get(id)?;
            if sample.partition != Partition::Pool {
                return Err(MlError::config(format!(
                    "cannot promote '{id}': it is in {}, not POOL",
                    sample.partition
                )));
            }
        }
        for id in identifiers {
            self.reassign_partition(id, Partition::Seed)?;
        }
        Ok(identifiers.len())
    }

    /// Samples in `partition`, optionally restricted to one label, ordered by identifier.
    pub fn view(&self, partition: Partition, label: Option<Label>) -> PartitionView {
        let samples = self
            .samples
            .values()
            .filter(|s| s.partition == partition && label.is_none_or(|l| s.label == l))
            .cloned()
            .collect();
        PartitionView {
            partition,
            label,
            samples,
        }
    }

    pub fn count(&self, partition: Partition, label: Label) -> usize {
        self.samples
            .values()
            .filter(|s| s.partition == partition && s.label == label)
            .count()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.values()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.samples.keys().map(String::as_str)
    }
}

/// Read-only snapshot of one partition (and optionally one label).
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionView {
    pub partition: Partition,
    pub label: Option<Label>,
    samples: Vec<Sample>,
}

impl PartitionView {
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn identifiers(&self) -> Vec<&str> {
        self.samples.iter().map(|s| s.identifier.as_str()).collect()
    }

    pub fn count_label(&self, label: Label) -> usize {
        self.samples.iter().filter(|s| s.label == label).count()
    }
}

/// Registry handle shared between a single writer and any number of readers.
///
/// Reads take the shared lock, so a reader sees a reassignment either fully
/// applied or not at all. A partitioning pass holds the write guard for its
/// whole duration.
#[derive(Debug, Clone, Default)]
pub struct SharedRegistry {
    inner: Arc<RwLock<SampleRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: SampleRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(registry)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SampleRegistry> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SampleRegistry> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn view(&self, partition: Partition, label: Option<Label>) -> PartitionView {
        self.read().view(partition, label)
    }

    pub fn reassign_partition(
        &self,
        identifier: &str,
        partition: Partition,
    ) -> Result<Partition, MlError> {
        self.write().reassign_partition(identifier, partition)
    }

    /// Swap in a freshly partitioned registry in one step.
    pub fn replace(&self, registry: SampleRegistry) -> SampleRegistry {
        std::mem::replace(&mut *self.write(), registry)
    }

    pub fn snapshot(&self) -> SampleRegistry {
        self.read().clone()
    }
}
