//! Core sample types: labels, partitions and the sample record itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::MlError;

/// Ground-truth class of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Real,
    Fake,
}

impl Label {
    pub const ALL: [Label; 2] = [Label::Real, Label::Fake];

    /// Directory name used by the on-disk layout.
    pub fn dir_name(self) -> &'static str {
        match self {
            Label::Real => "real",
            Label::Fake => "fake",
        }
    }

    /// Binary target: fake is the positive class.
    pub fn target(self) -> f64 {
        match self {
            Label::Real => 0.0,
            Label::Fake => 1.0,
        }
    }

    /// Label predicted for a probability of fake at the given threshold.
    pub fn from_probability(probability_fake: f64, threshold: f64) -> Self {
        if probability_fake > threshold {
            Label::Fake
        } else {
            Label::Real
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Label::Real => "REAL",
            Label::Fake => "FAKE",
        })
    }
}

impl FromStr for Label {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "real" => Ok(Label::Real),
            "fake" => Ok(Label::Fake),
            other => Err(MlError::config(format!("unknown label '{other}'"))),
        }
    }
}

/// Partition a sample is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Seed,
    Validation,
    Pool,
    Unassigned,
}

impl Partition {
    /// Partitions that exist on disk, in layout order.
    pub const ASSIGNED: [Partition; 3] = [Partition::Seed, Partition::Validation, Partition::Pool];

    pub fn dir_name(self) -> &'static str {
        match self {
            Partition::Seed => "seed",
            Partition::Validation => "validation",
            Partition::Pool => "pool",
            Partition::Unassigned => "unassigned",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name().to_ascii_uppercase())
    }
}

impl FromStr for Partition {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "seed" => Ok(Partition::Seed),
            "validation" => Ok(Partition::Validation),
            "pool" => Ok(Partition::Pool),
            "unassigned" => Ok(Partition::Unassigned),
            other => Err(MlError::config(format!("unknown partition '{other}'"))),
        }
    }
}

/// One image record. The registry references `source_path`; it never copies bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub identifier: String,
    pub label: Label,
    pub source_path: PathBuf,
    pub partition: Partition,
}

impl Sample {
    pub fn new(identifier: impl Into<String>, label: Label, source_path: impl Into<PathBuf>) -> Self {
        Self {
            identifier: identifier.into(),
            label,
            source_path: source_path.into(),
            partition: Partition::Unassigned,
        }
    }

    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partition = partition;
        self
    }
}

/// Labeled input to the partitioner, before any partition is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSample {
    pub identifier: String,
    pub label: Label,
    pub source_path: PathBuf,
}

impl RawSample {
    pub fn new(identifier: impl Into<String>, label: Label, source_path: impl Into<PathBuf>) -> Self {
        Self {
            identifier: identifier.into(),
            label,
            source_path: source_path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_parse_is_case_insensitive() {
        assert_eq!("REAL".parse::<Label>().unwrap(), Label::Real);
        assert_eq!("fake".parse::<Label>().unwrap(), Label::Fake);
        assert!("synthetic".parse::<Label>().is_err());
    }

    #[test]
    fn test_threshold_is_strict() {
        assert_eq!(Label::from_probability(0.5, 0.5), Label::Real);
        assert_eq!(Label::from_probability(0.51, 0.5), Label::Fake);
    }

    #[test]
    fn test_partition_round_trips_through_dir_name() {
        for p in Partition::ASSIGNED {
            assert_eq!(p.dir_name().parse::<Partition>().unwrap(), p);
        }
    }

    #[test]
    fn test_new_sample_is_unassigned() {
        let s = Sample::new("real/a.jpg", Label::Real, "/data/raw/real/a.jpg");
        assert_eq!(s.partition, Partition::Unassigned);
        assert_eq!(s.with_partition(Partition::Pool).partition, Partition::Pool);
    }
}
