//! Density → count reduction.
//!
//! Sums are accumulated in `f64`; rounding is left to post-processing.

use crate::{ModelError, Result};
use ndarray::{ArrayView3, ArrayView4};

/// Integral of one tile's density map.
pub fn tile_total(density: ArrayView3<f32>) -> f64 {
    density.iter().map(|&v| v as f64).sum()
}

/// Integral of every tile in a `(T, 1, H, W)` batch.
pub fn tile_totals(density: ArrayView4<f32>) -> Vec<f64> {
    density.outer_iter().map(tile_total).collect()
}

/// Groups consecutive runs of `tiles_per_image` tile totals into
/// whole-image counts.
pub fn image_totals(tile_totals: &[f64], tiles_per_image: usize) -> Result<Vec<f64>> {
    if tiles_per_image == 0 || tile_totals.len() % tiles_per_image != 0 {
        return Err(ModelError::shape(format!(
            "{} tile totals cannot be split into images of {tiles_per_image} tiles",
            tile_totals.len()
        )));
    }
    Ok(tile_totals
        .chunks(tiles_per_image)
        .map(|tiles| tiles.iter().sum())
        .collect())
}
