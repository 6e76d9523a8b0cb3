//! Logistic-regression baseline over grid and histogram features.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::data::sample::{Label, Sample};
use crate::error::MlError;
use crate::training::artifact::ModelWeights;
use crate::training::classifier::{
    Classifier, DEFAULT_THRESHOLD, EpochContext, Predictor, log_loss,
};
use crate::training::features::{FeatureSpec, Grid};
use crate::training::hyperparams::RuntimeOptions;
use crate::training::metrics::EpochFit;

/// Trained weights. Self-contained: scoring needs nothing but this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub features: FeatureSpec,
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LogisticModel {
    pub fn zeros(features: FeatureSpec) -> Self {
        Self {
            weights: vec![0.0; features.dimension()],
            features,
            bias: 0.0,
        }
    }

    pub fn probability(&self, x: &[f32]) -> f64 {
        let z = self.bias
            + self
                .weights
                .iter()
                .zip(x)
                .map(|(w, v)| w * f64::from(*v))
                .sum::<f64>();
        sigmoid(z)
    }
}

impl Predictor for LogisticModel {
    fn fake_probability(&self, path: &Path) -> Result<f64, MlError> {
        let x = self.features.extract(path)?;
        if x.len() != self.weights.len() {
            return Err(MlError::checkpoint(format!(
                "model expects {} features, image produced {}",
                self.weights.len(),
                x.len()
            )));
        }
        Ok(self.probability(&x))
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Mini-batch SGD trainer around a [`LogisticModel`].
///
/// Decoded grids are cached between epochs up to
/// [`RuntimeOptions::feature_cache_limit`] entries.
pub struct LogisticClassifier {
    model: LogisticModel,
    runtime: RuntimeOptions,
    cache: HashMap<PathBuf, Arc<Grid>>,
}

impl LogisticClassifier {
    pub fn new(runtime: RuntimeOptions) -> Self {
        Self::from_model(LogisticModel::zeros(FeatureSpec::default()), runtime)
    }

    pub fn from_model(model: LogisticModel, runtime: RuntimeOptions) -> Self {
        Self {
            model,
            runtime,
            cache: HashMap::new(),
        }
    }

    pub fn model(&self) -> &LogisticModel {
        &self.model
    }

    fn grids(&mut self, samples: &[Sample]) -> Result<Vec<Arc<Grid>>, MlError> {
        let missing: Vec<&Path> = samples
            .iter()
            .map(|s| s.source_path.as_path())
            .filter(|p| !self.cache.contains_key(*p))
            .collect();
        let loaded = load_grids(self.model.features, &missing, self.runtime.worker_threads)?;

        let mut fresh: HashMap<&Path, Arc<Grid>> = HashMap::with_capacity(loaded.len());
        for (path, grid) in missing.iter().copied().zip(loaded) {
            let grid = Arc::new(grid);
            if self.cache.len() < self.runtime.feature_cache_limit {
                self.cache.insert(path.to_path_buf(), Arc::clone(&grid));
            }
            fresh.insert(path, grid);
        }

        samples
            .iter()
            .map(|s| {
                let path = s.source_path.as_path();
                self.cache
                    .get(path)
                    .or_else(|| fresh.get(path))
                    .cloned()
                    .ok_or_else(|| MlError::not_found(path.display().to_string()))
            })
            .collect()
    }
}

impl Predictor for LogisticClassifier {
    fn fake_probability(&self, path: &Path) -> Result<f64, MlError> {
        match self.cache.get(path) {
            Some(grid) => Ok(self.model.probability(&self.model.features.features(grid))),
            None => self.model.fake_probability(path),
        }
    }
}

impl Classifier for LogisticClassifier {
    fn name(&self) -> &str {
        "logistic"
    }

    fn fit_epoch(
        &mut self,
        samples: &[Sample],
        ctx: &EpochContext<'_>,
    ) -> Result<EpochFit, MlError> {
        if samples.is_empty() {
            return Err(MlError::insufficient("no seed samples to fit"));
        }
        let grids = self.grids(samples)?;
        let hp = ctx.hyperparameters;
        let mut rng = StdRng::seed_from_u64(ctx.seed);
        let mut order: Vec<usize> = (0..samples.len()).collect();
        order.shuffle(&mut rng);

        let spec = self.model.features;
        let dim = self.model.weights.len();
        let mut total_loss = 0.0;
        let mut correct = 0usize;

        for batch in order.chunks(hp.batch_size) {
            let mut grad_w = vec![0.0f64; dim];
            let mut grad_b = 0.0f64;
            for &idx in batch {
                let grid = grids[idx].augmented(&hp.augmentation, &mut rng);
                let x = spec.features(&grid);
                let label = samples[idx].label;
                let p = self.model.probability(&x);

                total_loss += log_loss(p, label);
                if Label::from_probability(p, DEFAULT_THRESHOLD) == label {
                    correct += 1;
                }

                let err = p - label.target();
                for (g, v) in grad_w.iter_mut().zip(&x) {
                    *g += err * f64::from(*v);
                }
                grad_b += err;
            }

            let scale = hp.learning_rate / batch.len() as f64;
            for (w, g) in self.model.weights.iter_mut().zip(&grad_w) {
                *w -= scale * g + hp.learning_rate * hp.weight_decay * *w;
            }
            self.model.bias -= scale * grad_b;
        }

        let n = samples.len() as f64;
        let fit = EpochFit {
            loss: total_loss / n,
            accuracy: correct as f64 / n,
        };
        debug!(epoch = ctx.epoch, loss = fit.loss, accuracy = fit.accuracy, "Fitted epoch");
        Ok(fit)
    }

    fn evaluate(&mut self, samples: &[Sample]) -> Result<EpochFit, MlError> {
        if samples.is_empty() {
            return Err(MlError::insufficient("no samples to evaluate"));
        }
        let grids = self.grids(samples)?;
        let spec = self.model.features;
        let mut loss = 0.0;
        let mut correct = 0usize;
        for (sample, grid) in samples.iter().zip(&grids) {
            let p = self.model.probability(&spec.features(grid));
            loss += log_loss(p, sample.label);
            if Label::from_probability(p, DEFAULT_THRESHOLD) == sample.label {
                correct += 1;
            }
        }
        let n = samples.len() as f64;
        Ok(EpochFit {
            loss: loss / n,
            accuracy: correct as f64 / n,
        })
    }

    fn snapshot(&self) -> ModelWeights {
        ModelWeights::Logistic(self.model.clone())
    }
}

/// Decode grids on up to `threads` scoped worker threads, preserving order.
fn load_grids(spec: FeatureSpec, paths: &[&Path], threads: usize) -> Result<Vec<Grid>, MlError> {
    if paths.is_empty() {
        return Ok(Vec::new());
    }
    let threads = threads.clamp(1, paths.len());
    let chunk = paths.len().div_ceil(threads);

    std::thread::scope(|scope| {
        let handles: Vec<_> = paths
            .chunks(chunk)
            .map(|part| {
                scope.spawn(move || {
                    part.iter()
                        .map(|p| spec.load_grid(p))
                        .collect::<Result<Vec<_>, _>>()
                })
            })
            .collect();

        let mut grids = Vec::with_capacity(paths.len());
        for handle in handles {
            let part = handle
                .join()
                .map_err(|_| MlError::training("feature extraction worker panicked"))??;
            grids.extend(part);
        }
        Ok(grids)
    })
}
