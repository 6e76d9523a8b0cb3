//! Per-partition class balance analysis.
//!
//! Imbalance is a signal, not an error: the analyzer flags partitions whose
//! majority/minority ratio exceeds the threshold and the caller decides
//! whether to resample, abort or carry on.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

use crate::data::registry::SampleRegistry;
use crate::data::sample::{Label, Partition};

pub const DEFAULT_IMBALANCE_THRESHOLD: f64 = 1.5;

/// Class counts for one partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionBalance {
    pub partition: Partition,
    pub counts: BTreeMap<Label, usize>,
    pub total: usize,
    /// `max / min` over the two labels. Infinite when exactly one label is
    /// absent, `1.0` for an empty partition.
    pub imbalance_ratio: f64,
    pub imbalanced: bool,
}

impl PartitionBalance {
    pub fn count(&self, label: Label) -> usize {
        self.counts.get(&label).copied().unwrap_or(0)
    }

    /// Share of the partition that is fake, in `[0, 1]`.
    pub fn fake_fraction(&self) -> Option<f64> {
        (self.total > 0).then(|| self.count(Label::Fake) as f64 / self.total as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceReport {
    pub threshold: f64,
    pub partitions: Vec<PartitionBalance>,
    pub unassigned: usize,
}

impl BalanceReport {
    pub fn get(&self, partition: Partition) -> Option<&PartitionBalance> {
        self.partitions.iter().find(|p| p.partition == partition)
    }

    pub fn flagged(&self) -> impl Iterator<Item = &PartitionBalance> {
        self.partitions.iter().filter(|p| p.imbalanced)
    }

    pub fn is_balanced(&self) -> bool {
        self.flagged().next().is_none()
    }
}

#[derive(Debug, Clone)]
pub struct BalanceAnalyzer {
    threshold: f64,
}

impl Default for BalanceAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_IMBALANCE_THRESHOLD)
    }
}

impl BalanceAnalyzer {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn analyze(&self, registry: &SampleRegistry) -> BalanceReport {
        let mut counts: BTreeMap<Partition, BTreeMap<Label, usize>> = BTreeMap::new();
        for p in Partition::ASSIGNED {
            counts.insert(p, Label::ALL.iter().map(|l| (*l, 0)).collect());
        }
        let mut unassigned = 0;
        for sample in registry.iter() {
            match counts.get_mut(&sample.partition) {
                Some(by_label) => *by_label.entry(sample.label).or_insert(0) += 1,
                None => unassigned += 1,
            }
        }

        let partitions = counts
            .into_iter()
            .map(|(partition, by_label)| {
                let total = by_label.values().sum();
                let imbalance_ratio = imbalance_ratio(&by_label);
                let imbalanced = imbalance_ratio > self.threshold;
                if imbalanced {
                    warn!(
                        partition = %partition,
                        ratio = imbalance_ratio,
                        threshold = self.threshold,
                        "Partition class imbalance exceeds threshold"
                    );
                }
                PartitionBalance {
                    partition,
                    counts: by_label,
                    total,
                    imbalance_ratio,
                    imbalanced,
                }
            })
            .collect();

        BalanceReport {
            threshold: self.threshold,
            partitions,
            unassigned,
        }
    }
}

fn imbalance_ratio(by_label: &BTreeMap<Label, usize>) -> f64 {
    let max = by_label.values().copied().max().unwrap_or(0);
    let min = by_label.values().copied().min().unwrap_or(0);
    match (max, min) {
        (0, _) => 1.0,
        (_, 0) => f64::INFINITY,
        (max, min) => max as f64 / min as f64,
    }
}
