//! Active-learning selection over the POOL partition.
//!
//! Only the interface and its contract are defined here. Strategies rank pool
//! samples by informativeness; promotion of the chosen samples is a separate,
//! explicit registry call ([`SampleRegistry::promote_to_seed`]).

use std::collections::HashSet;
use tracing::debug;

use crate::data::registry::{PartitionView, SampleRegistry};
use crate::data::sample::Partition;
use crate::error::MlError;
use crate::training::classifier::Predictor;

pub trait ActiveLearningSelector {
    fn name(&self) -> &str;

    /// Up to `k` identifiers from `pool`, most informative first. Must be
    /// deterministic for the same model and pool, and must not mutate anything.
    fn select(
        &self,
        model: &dyn Predictor,
        pool: &PartitionView,
        k: usize,
    ) -> Result<Vec<String>, MlError>;
}

/// Picks pool samples in identifier order. Carries no notion of
/// informativeness; it exists to exercise the selector contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifierOrderSelector;

impl ActiveLearningSelector for IdentifierOrderSelector {
    fn name(&self) -> &str {
        "identifier-order"
    }

    fn select(
        &self,
        _model: &dyn Predictor,
        pool: &PartitionView,
        k: usize,
    ) -> Result<Vec<String>, MlError> {
        Ok(pool
            .identifiers()
            .into_iter()
            .take(k)
            .map(str::to_string)
            .collect())
    }
}

/// Run `selector` against the registry's POOL and check its answer: at most
/// `min(k, pool size)` distinct identifiers, all currently in POOL.
pub fn select_from_registry<S: ActiveLearningSelector + ?Sized>(
    selector: &S,
    model: &dyn Predictor,
    registry: &SampleRegistry,
    k: usize,
) -> Result<Vec<String>, MlError> {
    let pool = registry.view(Partition::Pool, None);
    let chosen = selector.select(model, &pool, k)?;

    let limit = k.min(pool.len());
    if chosen.len() > limit {
        return Err(MlError::config(format!(
            "selector {} returned {} samples, limit is {limit}",
            selector.name(),
            chosen.len()
        )));
    }
    let members: HashSet<&str> = pool.identifiers().into_iter().collect();
    let mut seen = HashSet::with_capacity(chosen.len());
    for id in &chosen {
        if !members.contains(id.as_str()) {
            return Err(MlError::config(format!(
                "selector {} picked {id}, which is not in POOL",
                selector.name()
            )));
        }
        if !seen.insert(id.as_str()) {
            return Err(MlError::config(format!(
                "selector {} picked {id} twice",
                selector.name()
            )));
        }
    }
    debug!(selector = selector.name(), k, selected = chosen.len(), "Selected pool samples");
    Ok(chosen)
}
