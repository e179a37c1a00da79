//! The two [`Estimator`] implementations.

use crate::{Estimator, InferError, RawOutput, Result};
use grain_model::export::{signature_of, COUNTS_OUTPUT, MEASURES_OUTPUT, META_INPUT, TILES_INPUT};
use grain_model::{FeatureBackbone, GrainType, ModelArtifact, ModelConfig, OnnxBackbone, TiledCounter};
use ndarray::{Array2, ArrayView4};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use std::path::Path;

/// Native heads over any backbone.
pub struct EagerEstimator<B> {
    net: TiledCounter<B>,
    fixed: bool,
    label: String,
}

impl<B: FeatureBackbone> EagerEstimator<B> {
    pub fn new(net: TiledCounter<B>) -> Self {
        Self { net, fixed: false, label: "eager".to_string() }
    }

    /// Route through `forward_fixed`, rejecting any other tile count.
    pub fn fixed(mut self) -> Self {
        self.fixed = true;
        self.label = "eager-fixed".to_string();
        self
    }

    pub fn network(&self) -> &TiledCounter<B> {
        &self.net
    }
}

impl EagerEstimator<OnnxBackbone> {
    /// Heads from a safetensors artifact over an ONNX backbone graph.
    pub fn from_files(config: ModelConfig, heads: impl AsRef<Path>, backbone: impl AsRef<Path>) -> Result<Self> {
        let artifact = ModelArtifact::load(heads)?;
        let backbone = OnnxBackbone::load(backbone)?;
        Ok(Self::new(TiledCounter::new(config, &artifact, backbone)?))
    }
}

impl<B: FeatureBackbone> Estimator for EagerEstimator<B> {
    fn estimate(&mut self, tiles: ArrayView4<f32>, grain: GrainType) -> Result<RawOutput> {
        let meta = meta_row(grain)?;
        let tiles = tiles.insert_axis(ndarray::Axis(0));
        let out = if self.fixed {
            self.net.forward_fixed(tiles, meta.view())?
        } else {
            self.net.forward(tiles, meta.view())?
        };
        Ok(RawOutput {
            counts: fixed_row(out.counts.row(0).iter().copied(), "counts")?,
            measures: fixed_row(out.measures.row(0).iter().copied(), "measures")?,
        })
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Exported single-image graph: `tiles (N,3,S,S)`, `meta (1,3)` →
/// `counts (1,9)`, `measures (1,6)`.
pub struct OnnxEstimator {
    session: Session,
    tile_count: usize,
    tile_size: usize,
    label: String,
}

impl OnnxEstimator {
    /// Fails unless the graph's names and static dims match the grid in
    /// `config`.
    pub fn load(path: impl AsRef<Path>, config: &ModelConfig) -> Result<Self> {
        let path = path.as_ref();
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(num_cpus::get())?
            .commit_from_file(path)?;
        signature_of(&session).check(config.tile_count(), config.tile_size)?;

        let label = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());
        log::info!("loaded {label}: {} tiles of {}px", config.tile_count(), config.tile_size);
        Ok(Self {
            session,
            tile_count: config.tile_count(),
            tile_size: config.tile_size as usize,
            label,
        })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl Estimator for OnnxEstimator {
    fn estimate(&mut self, tiles: ArrayView4<f32>, grain: GrainType) -> Result<RawOutput> {
        let expected = (self.tile_count, 3, self.tile_size, self.tile_size);
        if tiles.dim() != expected {
            return Err(InferError::ShapeMismatch(format!(
                "{} expects tiles {expected:?}, got {:?}",
                self.label,
                tiles.dim()
            )));
        }
        let tiles = tiles.as_standard_layout();
        let meta = meta_row(grain)?;
        let outputs = self.session.run(ort::inputs![
            TILES_INPUT => TensorRef::from_array_view(tiles.view())?,
            META_INPUT => TensorRef::from_array_view(meta.view())?,
        ])?;

        let (_, counts) = outputs[COUNTS_OUTPUT].try_extract_tensor::<f32>()?;
        let (_, measures) = outputs[MEASURES_OUTPUT].try_extract_tensor::<f32>()?;
        Ok(RawOutput {
            counts: fixed_row(counts.iter().copied(), "counts")?,
            measures: fixed_row(measures.iter().copied(), "measures")?,
        })
    }

    fn name(&self) -> &str {
        &self.label
    }
}

fn meta_row(grain: GrainType) -> Result<Array2<f32>> {
    Array2::from_shape_vec((1, 3), grain.one_hot().to_vec()).map_err(|e| InferError::ShapeMismatch(e.to_string()))
}

fn fixed_row<const N: usize>(values: impl Iterator<Item = f32>, what: &str) -> Result<[f32; N]> {
    let v: Vec<f32> = values.collect();
    <[f32; N]>::try_from(v)
        .map_err(|v| InferError::ShapeMismatch(format!("{what} has {} values, expected {N}", v.len())))
}
