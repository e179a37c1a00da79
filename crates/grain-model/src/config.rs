//! Network and post-processing configuration.

use crate::category::CountCategory;
use crate::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Immutable description of the tiled network and its output contract.
///
/// Serialized as JSON; every field has a default so partial files work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Tile grid rows.
    pub grid_rows: usize,
    /// Tile grid columns.
    pub grid_cols: usize,
    /// Square edge each tile is resized to before the backbone.
    pub tile_size: u32,
    /// Width of the meta embedding.
    pub meta_dim: usize,
    /// Channels after each 1x1 reduction in a count decoder.
    pub decoder_channels: usize,
    /// Widths of the two 3x3 backend convolutions.
    pub backend_channels: [usize; 2],
    /// Hidden width of the measurement head.
    pub measure_hidden: usize,
    /// Dropout between the measurement layers; identity at inference.
    pub measure_dropout: f32,
    /// Training-time multiplier on count targets.
    pub count_scale: f32,
    /// Added to the measurement std during denormalization.
    pub norm_eps: f32,
    pub layer_norm_eps: f32,
    /// Categories forced to zero for paddy samples.
    pub paddy_zero: Vec<CountCategory>,
    /// Categories forced to zero for brown samples.
    pub brown_zero: Vec<CountCategory>,
    pub model_version: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            grid_rows: 6,
            grid_cols: 8,
            tile_size: 512,
            meta_dim: 32,
            decoder_channels: 128,
            backend_channels: [128, 64],
            measure_hidden: 256,
            measure_dropout: 0.2,
            count_scale: 100.0,
            norm_eps: 1e-8,
            layer_norm_eps: 1e-5,
            paddy_zero: vec![
                CountCategory::Chalky,
                CountCategory::Medium,
                CountCategory::Yellow,
                CountCategory::Green,
            ],
            brown_zero: vec![CountCategory::Green],
            model_version: "tiled_multitask_v1.0".to_string(),
        }
    }
}

impl ModelConfig {
    /// Mobile/export preset: 224px tiles, same grid.
    pub fn mobile() -> Self {
        Self {
            tile_size: 224,
            model_version: "tiled_multitask_v1.0_onnx_int8".to_string(),
            ..Self::default()
        }
    }

    pub fn tile_count(&self) -> usize {
        self.grid_rows * self.grid_cols
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.grid_rows == 0 || self.grid_cols == 0 {
            return Err(ModelError::Config(format!(
                "grid must be non-empty, got {}x{}",
                self.grid_rows, self.grid_cols
            )));
        }
        if self.tile_size == 0 {
            return Err(ModelError::Config("tile_size must be positive".into()));
        }
        if self.count_scale <= 0.0 || !self.count_scale.is_finite() {
            return Err(ModelError::Config(format!("bad count_scale {}", self.count_scale)));
        }
        if !(0.0..1.0).contains(&self.measure_dropout) {
            return Err(ModelError::Config(format!("bad dropout {}", self.measure_dropout)));
        }
        Ok(())
    }
}
