//! Image decoding, augmentation and feature extraction for the baseline model.
//!
//! An image becomes a small grayscale grid. The feature vector is the centered
//! grid intensities followed by a normalized intensity histogram. Augmentation
//! operates on the grid, before the histogram is taken.

use image::imageops::{self, FilterType};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::MlError;
use crate::training::hyperparams::AugmentationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub grid_side: u32,
    pub histogram_bins: usize,
}

impl Default for FeatureSpec {
    fn default() -> Self {
        Self {
            grid_side: 16,
            histogram_bins: 16,
        }
    }
}

impl FeatureSpec {
    pub fn dimension(&self) -> usize {
        (self.grid_side * self.grid_side) as usize + self.histogram_bins
    }

    /// Decode `path` and downsample it to a grayscale grid.
    pub fn load_grid(&self, path: &Path) -> Result<Grid, MlError> {
        let gray = image::open(path)?.to_luma8();
        let small = imageops::resize(&gray, self.grid_side, self.grid_side, FilterType::Triangle);
        Ok(Grid {
            side: self.grid_side as usize,
            pixels: small
                .into_raw()
                .into_iter()
                .map(|v| f32::from(v) / 255.0)
                .collect(),
        })
    }

    pub fn features(&self, grid: &Grid) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimension());
        out.extend(grid.pixels.iter().map(|v| v - 0.5));

        let bins = self.histogram_bins.max(1);
        let mut histogram = vec![0f32; bins];
        for &v in &grid.pixels {
            let idx = ((v * bins as f32) as usize).min(bins - 1);
            histogram[idx] += 1.0;
        }
        let total = grid.pixels.len().max(1) as f32;
        out.extend(histogram.into_iter().map(|c| c / total));
        out
    }

    pub fn extract(&self, path: &Path) -> Result<Vec<f32>, MlError> {
        Ok(self.features(&self.load_grid(path)?))
    }
}

/// Square grayscale intensities in `[0, 1]`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    side: usize,
    pixels: Vec<f32>,
}

impl Grid {
    pub fn from_pixels(side: usize, pixels: Vec<f32>) -> Result<Self, MlError> {
        if pixels.len() != side * side {
            return Err(MlError::config(format!(
                "grid of side {side} needs {} pixels, got {}",
                side * side,
                pixels.len()
            )));
        }
        Ok(Self { side, pixels })
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    pub fn flipped_horizontal(&self) -> Grid {
        let mut pixels = Vec::with_capacity(self.pixels.len());
        for row in self.pixels.chunks(self.side) {
            pixels.extend(row.iter().rev());
        }
        Grid {
            side: self.side,
            pixels,
        }
    }

    /// Rotate about the center by `degrees`, sampling the nearest source pixel
    /// and clamping at the border.
    pub fn rotated(&self, degrees: f64) -> Grid {
        if degrees == 0.0 || self.side == 0 {
            return self.clone();
        }
        let (sin, cos) = degrees.to_radians().sin_cos();
        let center = (self.side as f64 - 1.0) / 2.0;
        let max = self.side as f64 - 1.0;
        let mut pixels = Vec::with_capacity(self.pixels.len());
        for y in 0..self.side {
            for x in 0..self.side {
                let dx = x as f64 - center;
                let dy = y as f64 - center;
                let sx = (cos * dx + sin * dy + center).round().clamp(0.0, max) as usize;
                let sy = (-sin * dx + cos * dy + center).round().clamp(0.0, max) as usize;
                pixels.push(self.pixels[sy * self.side + sx]);
            }
        }
        Grid {
            side: self.side,
            pixels,
        }
    }

    /// Apply a random flip and rotation according to `config`.
    pub fn augmented<R: Rng>(&self, config: &AugmentationConfig, rng: &mut R) -> Grid {
        let mut grid = if config.augment_horizontal_flip && rng.gen_bool(0.5) {
            self.flipped_horizontal()
        } else {
            self.clone()
        };
        let max = config.augment_rotation_degrees;
        if max > 0.0 {
            grid = grid.rotated(rng.gen_range(-max..=max));
        }
        grid
    }
}
