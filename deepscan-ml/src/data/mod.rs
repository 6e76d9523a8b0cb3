//! Dataset side of the pipeline: samples, the registry, integrity and balance
//! checks, the partitioner and the on-disk layout.

pub mod balance;
pub mod integrity;
pub mod layout;
pub mod partition;
pub mod registry;
pub mod sample;

pub use balance::{BalanceAnalyzer, BalanceReport, PartitionBalance};
pub use integrity::{IntegrityReport, PartitionRecord, Violation, ViolationKind, check, check_records};
pub use layout::{DatasetLayout, Manifest, SplitMetadata, scan_raw};
pub use partition::{PartitionRatios, Partitioner, partition};
pub use registry::{PartitionView, SampleRegistry, SharedRegistry};
pub use sample::{Label, Partition, RawSample, Sample};
