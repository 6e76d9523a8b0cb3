//! Serving trained checkpoints.

pub mod service;

pub use service::{InferenceResult, InferenceService};
