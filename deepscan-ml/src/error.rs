//! Error types for the deepscan-ml crate.

use crate::data::integrity::ViolationKind;
use thiserror::Error;

/// Top-level error type for dataset, training and evaluation operations.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid partition ratios: {0}")]
    InvalidRatio(String),

    #[error("Data integrity error ({kind}) for '{identifier}': {detail}")]
    DataIntegrity {
        kind: ViolationKind,
        identifier: String,
        detail: String,
    },

    #[error("Duplicate identifier: {0}")]
    DuplicateIdentifier(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Empty partition: {0}")]
    EmptyPartition(String),

    #[error("Training runtime error: {0}")]
    TrainingRuntime(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Config load error: {0}")]
    Figment(#[from] Box<figment::Error>),
}

/// The four error families the pipeline distinguishes when deciding what to abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    DataIntegrity,
    InsufficientData,
    TrainingRuntime,
}

impl MlError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_ratio(msg: impl Into<String>) -> Self {
        Self::InvalidRatio(msg.into())
    }

    pub fn integrity(
        kind: ViolationKind,
        identifier: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::DataIntegrity {
            kind,
            identifier: identifier.into(),
            detail: detail.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn insufficient(msg: impl Into<String>) -> Self {
        Self::InsufficientData(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::TrainingRuntime(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Classify the error into its handling family. Plain I/O and decoding
    /// failures carry no family of their own.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Configuration(_) | Self::InvalidRatio(_) | Self::Figment(_) => {
                Some(ErrorKind::Configuration)
            }
            Self::DataIntegrity { .. } | Self::DuplicateIdentifier(_) | Self::NotFound(_) => {
                Some(ErrorKind::DataIntegrity)
            }
            Self::InsufficientData(_) | Self::EmptyPartition(_) => {
                Some(ErrorKind::InsufficientData)
            }
            Self::TrainingRuntime(_) | Self::Checkpoint(_) => Some(ErrorKind::TrainingRuntime),
            Self::Io(_) | Self::Serde(_) | Self::Image(_) => None,
        }
    }
}
