//! Raw outputs → reportable numbers.
//!
//! Order matters: unscale counts, denormalize measurements, force the
//! structural zeros for the grain type, then clamp and round counts.
//! Measurements are never rounded.

use crate::{InferError, RawOutput, Result};
use grain_model::{CountCategory, GrainType, MeasureKind, ModelConfig, NormStats};
use grain_source::ResultRow;
use serde::Serialize;

/// Final per-image result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub counts: [u32; CountCategory::COUNT],
    pub measures: [f32; MeasureKind::COUNT],
}

impl Prediction {
    pub fn count(&self, category: CountCategory) -> u32 {
        self.counts[category.index()]
    }

    pub fn measure(&self, kind: MeasureKind) -> f32 {
        self.measures[kind.index()]
    }

    pub fn to_row(&self, id: impl Into<String>) -> ResultRow {
        ResultRow { id: id.into(), counts: self.counts.to_vec(), measures: self.measures.to_vec() }
    }
}

#[derive(Debug, Clone)]
pub struct PostProcessor {
    count_scale: f32,
    norm_eps: f32,
    norm: NormStats,
    paddy_zero: Vec<CountCategory>,
    brown_zero: Vec<CountCategory>,
}

impl PostProcessor {
    pub fn new(config: &ModelConfig, norm: NormStats) -> Self {
        Self {
            count_scale: config.count_scale,
            norm_eps: config.norm_eps,
            norm,
            paddy_zero: config.paddy_zero.clone(),
            brown_zero: config.brown_zero.clone(),
        }
    }

    /// Categories that cannot occur for `grain`.
    pub fn structural_zeros(&self, grain: GrainType) -> &[CountCategory] {
        match grain {
            GrainType::Paddy => &self.paddy_zero,
            GrainType::Brown => &self.brown_zero,
            GrainType::White => &[],
        }
    }

    pub fn apply(&self, raw: &RawOutput, grain: GrainType) -> Result<Prediction> {
        check_finite(&raw.counts, "count")?;
        check_finite(&raw.measures, "measure")?;

        let mut counts = raw.counts.map(|v| v / self.count_scale);
        let measures = self.norm.denormalize(&raw.measures, self.norm_eps);
        for category in self.structural_zeros(grain) {
            counts[category.index()] = 0.0;
        }
        check_finite(&measures, "measure")?;

        Ok(Prediction { counts: counts.map(|v| v.max(0.0).round() as u32), measures })
    }
}

fn check_finite(values: &[f32], what: &'static str) -> Result<()> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(InferError::NonFinite { what, index, value: values[index] }),
        None => Ok(()),
    }
}
