//! Stratified, reproducible seed/validation/pool partitioning.
//!
//! Each label is split on its own: its samples are sorted by identifier,
//! optionally cut into contiguous strata of that order, shuffled with an RNG
//! derived from the random seed, the label and the stratum, then cut at
//! cumulative boundaries. Pool ends at `floor(n * pool)` and validation at
//! `floor(n * (pool + validation))`; seed takes the rest, so rounding
//! remainders always land in SEED and every partition stays within one sample
//! of its exact share.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use tracing::{debug, info};

use crate::data::registry::SampleRegistry;
use crate::data::sample::{Label, Partition, RawSample, Sample};
use crate::error::MlError;

pub const RATIO_TOLERANCE: f64 = 1e-6;

/// Slack added before flooring so that e.g. `100 * 0.7` never rounds to 69.
const FLOOR_EPSILON: f64 = 1e-9;

/// Seed/validation/pool fractions. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartitionRatios {
    pub seed: f64,
    pub validation: f64,
    pub pool: f64,
}

impl Default for PartitionRatios {
    fn default() -> Self {
        Self {
            seed: 0.7,
            validation: 0.2,
            pool: 0.1,
        }
    }
}

impl PartitionRatios {
    pub fn new(seed: f64, validation: f64, pool: f64) -> Result<Self, MlError> {
        let ratios = Self {
            seed,
            validation,
            pool,
        };
        ratios.validate()?;
        Ok(ratios)
    }

    pub fn validate(&self) -> Result<(), MlError> {
        for (name, value) in [
            ("seed", self.seed),
            ("validation", self.validation),
            ("pool", self.pool),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(MlError::invalid_ratio(format!(
                    "{name} ratio {value} is outside [0, 1]"
                )));
            }
        }
        let sum = self.seed + self.validation + self.pool;
        if (sum - 1.0).abs() > RATIO_TOLERANCE {
            return Err(MlError::invalid_ratio(format!(
                "ratios sum to {sum}, expected 1.0"
            )));
        }
        Ok(())
    }

    /// Per-partition sizes for a class of `n` samples.
    pub fn class_sizes(&self, n: usize) -> ClassSplit {
        let pool = floor_share(n, self.pool).min(n);
        let held_out = floor_share(n, self.pool + self.validation).clamp(pool, n);
        ClassSplit {
            seed: n - held_out,
            validation: held_out - pool,
            pool,
        }
    }
}

fn floor_share(n: usize, ratio: f64) -> usize {
    (n as f64 * ratio + FLOOR_EPSILON).floor() as usize
}

/// Sizes one label contributes to each partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSplit {
    pub seed: usize,
    pub validation: usize,
    pub pool: usize,
}

/// Contiguous index ranges of `k` strata over `n` ordered samples.
/// Every stratum gets `n / k` samples and the last one also takes the remainder.
pub fn stratum_bounds(n: usize, k: usize) -> Vec<Range<usize>> {
    let k = k.max(1);
    let size = n / k;
    (0..k)
        .map(|i| {
            let start = i * size;
            let end = if i + 1 == k { n } else { start + size };
            start..end
        })
        .collect()
}

/// Where one stratum of one label ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratumStats {
    pub label: Label,
    pub index: usize,
    pub first: Option<String>,
    pub last: Option<String>,
    pub total: usize,
    pub seed: usize,
    pub validation: usize,
    pub pool: usize,
}

/// Per-stratum partition counts of `registry`, recomputed from identifier order.
pub fn stratum_stats(registry: &SampleRegistry, strata: usize) -> Vec<StratumStats> {
    let mut stats = Vec::new();
    for label in Label::ALL {
        let samples: Vec<&Sample> = registry.iter().filter(|s| s.label == label).collect();
        for (index, range) in stratum_bounds(samples.len(), strata).into_iter().enumerate() {
            let slice = &samples[range];
            let count = |p: Partition| slice.iter().filter(|s| s.partition == p).count();
            stats.push(StratumStats {
                label,
                index,
                first: slice.first().map(|s| s.identifier.clone()),
                last: slice.last().map(|s| s.identifier.clone()),
                total: slice.len(),
                seed: count(Partition::Seed),
                validation: count(Partition::Validation),
                pool: count(Partition::Pool),
            });
        }
    }
    stats
}

/// Splits raw labeled samples into a fully assigned registry.
#[derive(Debug, Clone)]
pub struct Partitioner {
    ratios: PartitionRatios,
    random_seed: u64,
    strata: usize,
}

impl Partitioner {
    pub fn new(ratios: PartitionRatios, random_seed: u64) -> Result<Self, MlError> {
        ratios.validate()?;
        Ok(Self {
            ratios,
            random_seed,
            strata: 1,
        })
    }

    /// Split each label's identifier-ordered list into `strata` contiguous
    /// blocks and cut every block by the ratios on its own.
    pub fn with_strata(mut self, strata: usize) -> Result<Self, MlError> {
        if strata == 0 {
            return Err(MlError::config("strata must be at least 1"));
        }
        self.strata = strata;
        Ok(self)
    }

    pub fn strata(&self) -> usize {
        self.strata
    }

    pub fn ratios(&self) -> PartitionRatios {
        self.ratios
    }

    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    pub fn partition(&self, raw: &[RawSample]) -> Result<SampleRegistry, MlError> {
        let mut seen = HashSet::with_capacity(raw.len());
        let mut by_label: BTreeMap<Label, Vec<&RawSample>> = BTreeMap::new();
        for sample in raw {
            if !seen.insert(sample.identifier.as_str()) {
                return Err(MlError::DuplicateIdentifier(sample.identifier.clone()));
            }
            by_label.entry(sample.label).or_default().push(sample);
        }

        let mut registry = SampleRegistry::new();
        for (label, mut samples) in by_label {
            samples.sort_by(|a, b| a.identifier.cmp(&b.identifier));
            for (index, range) in stratum_bounds(samples.len(), self.strata)
                .into_iter()
                .enumerate()
            {
                let stratum = &mut samples[range];
                let mut rng = StdRng::seed_from_u64(
                    class_seed(self.random_seed, label).wrapping_add(index as u64),
                );
                stratum.shuffle(&mut rng);

                let split = self.ratios.class_sizes(stratum.len());
                debug!(
                    label = %label,
                    stratum = index,
                    seed = split.seed,
                    validation = split.validation,
                    pool = split.pool,
                    "Stratified class split"
                );

                for (idx, raw_sample) in stratum.iter().enumerate() {
                    let partition = if idx < split.seed {
                        Partition::Seed
                    } else if idx < split.seed + split.validation {
                        Partition::Validation
                    } else {
                        Partition::Pool
                    };
                    registry.register(
                        Sample::new(
                            raw_sample.identifier.clone(),
                            raw_sample.label,
                            raw_sample.source_path.clone(),
                        )
                        .with_partition(partition),
                    )?;
                }
            }
        }

        info!(
            samples = registry.len(),
            random_seed = self.random_seed,
            strata = self.strata,
            "Partitioned raw samples"
        );
        Ok(registry)
    }
}

/// Convenience wrapper over [`Partitioner`].
pub fn partition(
    raw: &[RawSample],
    seed_ratio: f64,
    validation_ratio: f64,
    pool_ratio: f64,
    random_seed: u64,
) -> Result<SampleRegistry, MlError> {
    let ratios = PartitionRatios::new(seed_ratio, validation_ratio, pool_ratio)?;
    Partitioner::new(ratios, random_seed)?.partition(raw)
}

fn class_seed(random_seed: u64, label: Label) -> u64 {
    let salt: u64 = match label {
        Label::Real => 0x5245_414c,
        Label::Fake => 0x4641_4b45,
    };
    random_seed ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
