//! Feature backbones: anything that maps a tile batch to a multi-scale
//! feature pyramid.

use crate::{ModelError, Result};
use ndarray::{Array4, ArrayView4, Axis};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::{TensorRef, ValueType};
use std::path::Path;

/// Maps `(T, 3, S, S)` tiles to stage outputs `(T, C_i, H_i, W_i)`,
/// highest resolution first.
pub trait FeatureBackbone {
    /// Channel width of every stage, if known before the first call.
    fn channels(&self) -> Option<Vec<usize>>;

    fn extract(&mut self, tiles: ArrayView4<f32>) -> Result<Vec<Array4<f32>>>;
}

impl<B: FeatureBackbone + ?Sized> FeatureBackbone for Box<B> {
    fn channels(&self) -> Option<Vec<usize>> {
        (**self).channels()
    }

    fn extract(&mut self, tiles: ArrayView4<f32>) -> Result<Vec<Array4<f32>>> {
        (**self).extract(tiles)
    }
}

/// At least two stages, every stage has `batch` items, channels strictly
/// increase and spatial size strictly decreases.
pub fn check_pyramid(features: &[Array4<f32>], batch: usize) -> Result<()> {
    if features.len() < 2 {
        return Err(ModelError::shape(format!(
            "backbone returned {} feature maps, need at least 2",
            features.len()
        )));
    }
    for (i, f) in features.iter().enumerate() {
        let (n, c, h, w) = f.dim();
        if n != batch {
            return Err(ModelError::shape(format!("stage {i} has batch {n}, expected {batch}")));
        }
        if c == 0 || h == 0 || w == 0 {
            return Err(ModelError::shape(format!("stage {i} is empty: {:?}", f.dim())));
        }
    }
    for (i, pair) in features.windows(2).enumerate() {
        let (_, c0, h0, w0) = pair[0].dim();
        let (_, c1, h1, w1) = pair[1].dim();
        if c1 <= c0 || h1 >= h0 || w1 >= w0 {
            return Err(ModelError::shape(format!(
                "stages {i}->{} are not a pyramid: ({c0},{h0},{w0}) -> ({c1},{h1},{w1})",
                i + 1
            )));
        }
    }
    Ok(())
}

/// Backbone exported as a standalone multi-output ONNX graph.
pub struct OnnxBackbone {
    session: Session,
    input_name: String,
    output_names: Vec<String>,
    channels: Option<Vec<usize>>,
}

impl OnnxBackbone {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(num_cpus::get())?
            .commit_from_file(path)?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| ModelError::shape(format!("{path:?} has no inputs")))?;
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        if output_names.len() < 2 {
            return Err(ModelError::shape(format!(
                "{path:?} exposes {} outputs, a feature pyramid needs at least 2",
                output_names.len()
            )));
        }
        let channels = static_channels(&session);
        log::info!("backbone {path:?}: input {input_name}, outputs {output_names:?}, channels {channels:?}");
        Ok(Self { session, input_name, output_names, channels })
    }
}

/// Channel width of every output when the graph declares all of them
/// statically as `(N, C, H, W)`.
fn static_channels(session: &Session) -> Option<Vec<usize>> {
    session
        .outputs
        .iter()
        .map(|o| match &o.output_type {
            ValueType::Tensor { shape, .. } if shape.len() == 4 && shape[1] > 0 => Some(shape[1] as usize),
            _ => None,
        })
        .collect()
}

impl FeatureBackbone for OnnxBackbone {
    fn channels(&self) -> Option<Vec<usize>> {
        self.channels.clone()
    }

    fn extract(&mut self, tiles: ArrayView4<f32>) -> Result<Vec<Array4<f32>>> {
        let tiles = tiles.as_standard_layout();
        let input = TensorRef::from_array_view(tiles.view())?;
        let outputs = self.session.run(ort::inputs![self.input_name.as_str() => input])?;

        let mut features = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let (shape, data) = outputs[name.as_str()].try_extract_tensor::<f32>()?;
            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            let [n, c, h, w] = <[usize; 4]>::try_from(dims)
                .map_err(|d| ModelError::shape(format!("output {name} has rank {}, expected 4", d.len())))?;
            let map = Array4::from_shape_vec((n, c, h, w), data.to_vec())
                .map_err(|e| ModelError::shape(format!("output {name}: {e}")))?;
            features.push(map);
        }
        self.channels = Some(features.iter().map(|f| f.dim().1).collect());
        Ok(features)
    }
}

/// Parameter-free pyramid: stage `i` average-pools the input by
/// `strides[i]` and spreads the three colour planes over `channels[i]`
/// planes with fixed per-plane gains. Deterministic; used to exercise the
/// heads without a trained backbone.
#[derive(Debug, Clone)]
pub struct PoolingBackbone {
    strides: Vec<usize>,
    channels: Vec<usize>,
}

impl PoolingBackbone {
    pub fn new(strides: Vec<usize>, channels: Vec<usize>) -> Result<Self> {
        if strides.len() != channels.len() || strides.len() < 2 {
            return Err(ModelError::Config(format!(
                "need matching stride/channel lists of length >= 2, got {strides:?} / {channels:?}"
            )));
        }
        if strides.iter().any(|&s| s == 0)
            || strides.windows(2).any(|w| w[1] <= w[0])
            || channels.windows(2).any(|w| w[1] <= w[0])
        {
            return Err(ModelError::Config(format!(
                "strides {strides:?} and channels {channels:?} must strictly increase"
            )));
        }
        Ok(Self { strides, channels })
    }

    /// Four stages at strides 4/8/16/32, ConvNeXt-like ratios at small width.
    pub fn tiny() -> Self {
        Self { strides: vec![4, 8, 16, 32], channels: vec![6, 12, 24, 48] }
    }

    /// Widths of the two stages the heads consume.
    pub fn fused_channels(&self) -> (usize, usize) {
        let n = self.channels.len();
        (self.channels[n - 2], self.channels[n - 1])
    }
}

impl FeatureBackbone for PoolingBackbone {
    fn channels(&self) -> Option<Vec<usize>> {
        Some(self.channels.clone())
    }

    fn extract(&mut self, tiles: ArrayView4<f32>) -> Result<Vec<Array4<f32>>> {
        let (t, c_in, h, w) = tiles.dim();
        if c_in == 0 {
            return Err(ModelError::shape("tiles have no channels"));
        }
        let mut out = Vec::with_capacity(self.strides.len());
        for (&stride, &channels) in self.strides.iter().zip(&self.channels) {
            let (oh, ow) = (h / stride, w / stride);
            if oh == 0 || ow == 0 {
                return Err(ModelError::shape(format!("tile {h}x{w} is smaller than stride {stride}")));
            }
            let mut pooled = Array4::<f32>::zeros((t, c_in, oh, ow));
            let area = (stride * stride) as f32;
            for (ti, tile) in tiles.axis_iter(Axis(0)).enumerate() {
                for ci in 0..c_in {
                    for y in 0..oh {
                        for x in 0..ow {
                            let window = tile.slice(ndarray::s![
                                ci,
                                y * stride..(y + 1) * stride,
                                x * stride..(x + 1) * stride
                            ]);
                            pooled[(ti, ci, y, x)] = window.sum() / area;
                        }
                    }
                }
            }
            let mut stage = Array4::<f32>::zeros((t, channels, oh, ow));
            for k in 0..channels {
                let gain = 1.0 + (k / c_in) as f32 * 0.25;
                let src = pooled.index_axis(Axis(1), k % c_in);
                stage.index_axis_mut(Axis(1), k).assign(&src.mapv(|v| v * gain));
            }
            out.push(stage);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooling_pyramid_shapes() {
        let mut b = PoolingBackbone::tiny();
        let tiles = Array4::<f32>::ones((3, 3, 64, 64));
        let f = b.extract(tiles.view()).unwrap();
        let dims: Vec<_> = f.iter().map(|m| m.dim()).collect();
        assert_eq!(dims, vec![(3, 6, 16, 16), (3, 12, 8, 8), (3, 24, 4, 4), (3, 48, 2, 2)]);
        check_pyramid(&f, 3).unwrap();
    }

    #[test]
    fn odd_tile_edges_floor() {
        let mut b = PoolingBackbone::new(vec![2, 4], vec![3, 5]).unwrap();
        let f = b.extract(Array4::<f32>::zeros((1, 3, 14, 10)).view()).unwrap();
        assert_eq!(f[0].dim(), (1, 3, 7, 5));
        assert_eq!(f[1].dim(), (1, 5, 3, 2));
    }

    #[test]
    fn too_small_tiles_fail() {
        let mut b = PoolingBackbone::tiny();
        assert!(b.extract(Array4::<f32>::zeros((1, 3, 16, 16)).view()).is_err());
    }

    #[test]
    fn pyramid_checks() {
        let good = vec![Array4::<f32>::zeros((2, 4, 8, 8)), Array4::<f32>::zeros((2, 8, 4, 4))];
        check_pyramid(&good, 2).unwrap();
        assert!(check_pyramid(&good, 3).is_err());
        assert!(check_pyramid(&good[..1], 2).is_err());
        let flat = vec![Array4::<f32>::zeros((2, 4, 8, 8)), Array4::<f32>::zeros((2, 8, 8, 8))];
        assert!(check_pyramid(&flat, 2).is_err());
        assert!(PoolingBackbone::new(vec![8, 4], vec![3, 6]).is_err());
    }
}
