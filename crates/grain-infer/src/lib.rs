// grain-infer/src/lib.rs
// ============================================================
// grain-infer  –  Whole-image grain estimation
// Turns a decoded photograph into nine integer counts and six
// measurements, either through the native Rust heads or an
// exported ONNX graph.
// ------------------------------------------------------------
// Pipeline: RgbImage → tiles (N,3,S,S) → RawOutput → Prediction
// ------------------------------------------------------------
// Public API
//   * Estimator::estimate(tiles, grain) – raw network outputs
//   * PostProcessor::apply(raw, grain)  – counts + measures
//   * Pipeline::run_batch(source, sink) – manifest → CSV
// ============================================================

//! Grain inference layer.
//!
//! The [`Estimator`] trait is the seam between preprocessing and the
//! network: [`EagerEstimator`] runs the heads natively on top of a
//! [`FeatureBackbone`](grain_model::FeatureBackbone), [`OnnxEstimator`]
//! runs a fixed-shape exported graph (FP32 or INT8). Either one plugs into
//! the [`Pipeline`], which owns tiling, post-processing and the per-image
//! error policy.

use grain_model::{CountCategory, GrainType, MeasureKind};
use ndarray::ArrayView4;
use thiserror::Error;

pub mod bench;
pub mod estimator;
pub mod pipeline;
pub mod postprocess;
pub mod quality;

pub use estimator::{EagerEstimator, OnnxEstimator};
pub use pipeline::{BatchSummary, Pipeline, SkippedSample, Stage};
pub use postprocess::{PostProcessor, Prediction};
pub use quality::QualityReport;

#[derive(Debug, Error)]
pub enum InferError {
    #[error(transparent)]
    Model(#[from] grain_model::ModelError),
    #[error("onnxruntime: {0}")]
    Ort(#[from] ort::Error),
    #[error(transparent)]
    Preprocess(#[from] grain_preprocess::PreprocessError),
    #[error(transparent)]
    Source(#[from] grain_source::SourceError),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("non-finite {what} output at index {index}: {value}")]
    NonFinite { what: &'static str, index: usize, value: f32 },
    #[error("{id}: failed at {stage}: {source}")]
    Sample {
        id: String,
        stage: Stage,
        #[source]
        source: Box<InferError>,
    },
}

impl InferError {
    /// Whether this error only affects the sample it was raised for.
    pub fn is_per_sample(&self) -> bool {
        match self {
            InferError::Sample { source, .. } => source.is_per_sample(),
            InferError::Source(grain_source::SourceError::Sink(_)) => false,
            InferError::Source(grain_source::SourceError::Io(_)) => false,
            InferError::Model(e) => !e.is_fatal(),
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, InferError>;

/// Network outputs before any post-processing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawOutput {
    /// Scaled counts, column order of [`CountCategory::ALL`].
    pub counts: [f32; CountCategory::COUNT],
    /// Standardized measurements, column order of [`MeasureKind::ALL`].
    pub measures: [f32; MeasureKind::COUNT],
}

/// Anything that maps one image's tiles to raw outputs.
pub trait Estimator {
    /// `tiles: (N, 3, S, S)` for a single image.
    fn estimate(&mut self, tiles: ArrayView4<f32>, grain: GrainType) -> Result<RawOutput>;

    /// Short label for logs and benchmark tables.
    fn name(&self) -> &str;
}

impl<E: Estimator + ?Sized> Estimator for Box<E> {
    fn estimate(&mut self, tiles: ArrayView4<f32>, grain: GrainType) -> Result<RawOutput> {
        (**self).estimate(tiles, grain)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
