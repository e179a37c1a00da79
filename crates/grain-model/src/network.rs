//! The tiled multi-task network.
//!
//! `(B, N, 3, S, S)` tiles are flattened to `(B·N, 3, S, S)`, run through
//! the backbone once, and the two coarsest stages feed nine count decoders
//! and the measurement head. Cross-tile reductions regroup by image.

use crate::aggregate;
use crate::artifact::ModelArtifact;
use crate::backbone::{check_pyramid, FeatureBackbone};
use crate::category::{CountCategory, MeasureKind};
use crate::config::ModelConfig;
use crate::decoder::CountDecoder;
use crate::measure::MeasurementHead;
use crate::meta::MetaEncoder;
use crate::error::ForwardStage;
use crate::{ModelError, Result};
use ndarray::{Array2, Array3, ArrayView2, ArrayView5};

/// Raw (pre post-processing) network outputs for a batch of images.
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    /// `(B, 9)` scaled counts.
    pub counts: Array2<f32>,
    /// `(B, 6)` standardized measurements.
    pub measures: Array2<f32>,
    /// `(B, N, 9)` per-tile density integrals.
    pub tile_counts: Array3<f32>,
}

pub struct TiledCounter<B> {
    config: ModelConfig,
    backbone: B,
    meta: MetaEncoder,
    heads: Vec<CountDecoder>,
    measure: MeasurementHead,
}

impl<B: FeatureBackbone> TiledCounter<B> {
    /// Builds every head from `artifact`. Missing or mis-shaped tensors
    /// fail here, before any image is processed.
    pub fn new(config: ModelConfig, artifact: &ModelArtifact, backbone: B) -> Result<Self> {
        config.validate()?;
        artifact.check_complete()?;

        let meta = MetaEncoder::from_artifact(artifact, &config)?;
        let heads = (0..CountCategory::COUNT)
            .map(|i| CountDecoder::from_artifact(artifact, i, &config))
            .collect::<Result<Vec<_>>>()?;
        let measure = MeasurementHead::from_artifact(artifact, &config)?;

        let (fine, coarse) = heads[0].input_channels();
        if let Some((i, h)) = heads.iter().enumerate().find(|(_, h)| h.input_channels() != (fine, coarse)) {
            return Err(ModelError::BadTensor {
                key: format!("count_heads.{i}"),
                reason: format!("inputs {:?} differ from head 0 ({fine}, {coarse})", h.input_channels()),
            });
        }
        if measure.in_features() != coarse + meta.dim() {
            return Err(ModelError::BadTensor {
                key: "measure_head.0.weight".into(),
                reason: format!("expects {} inputs, coarse stage + meta is {}", measure.in_features(), coarse + meta.dim()),
            });
        }
        if let Some(channels) = backbone.channels() {
            let n = channels.len();
            if n < 2 || (channels[n - 2], channels[n - 1]) != (fine, coarse) {
                return Err(ModelError::BackboneMismatch(format!(
                    "stages {channels:?} do not end in ({fine}, {coarse})"
                )));
            }
        }

        let counter = Self { config, backbone, meta, heads, measure };
        log::info!(
            "tiled counter ready: {}x{} grid, {}px tiles, {} head params",
            counter.config.grid_rows,
            counter.config.grid_cols,
            counter.config.tile_size,
            counter.head_param_count()
        );
        Ok(counter)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn backbone_mut(&mut self) -> &mut B {
        &mut self.backbone
    }

    pub fn head_param_count(&self) -> usize {
        self.meta.param_count()
            + self.heads.iter().map(CountDecoder::param_count).sum::<usize>()
            + self.measure.param_count()
    }

    /// Flexible path: any tile count and tile edge the backbone accepts.
    pub fn forward(&mut self, tiles: ArrayView5<f32>, meta: ArrayView2<f32>) -> Result<NetworkOutput> {
        let (b, n, c, h, w) = tiles.dim();
        if b == 0 || n == 0 {
            return Err(ModelError::shape(format!("empty tile batch {:?}", tiles.dim())));
        }
        if c != 3 {
            return Err(ModelError::shape(format!("tiles must be RGB, got {c} channels")));
        }
        if meta.dim() != (b, 3) {
            return Err(ModelError::shape(format!("meta is {:?}, expected ({b}, 3)", meta.dim())));
        }
        check_one_hot(meta)?;

        let flat = tiles
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((b * n, c, h, w))
            .map_err(|e| ModelError::shape(e.to_string()))?;
        let features = self
            .backbone
            .extract(flat.view())
            .and_then(|features| {
                check_pyramid(&features, b * n)?;
                self.check_widths(&features)?;
                Ok(features)
            })
            .map_err(ModelError::at(ForwardStage::Backbone))?;
        let fine = &features[features.len() - 2];
        let coarse = &features[features.len() - 1];
        log::debug!("backbone: fine {:?}, coarse {:?}", fine.dim(), coarse.dim());

        let embedding = self.meta.encode_batch(meta)?;
        // repeat each image's embedding for its N tiles
        let per_tile = Array2::from_shape_fn((b * n, embedding.ncols()), |(t, e)| embedding[(t / n, e)]);

        let mut counts = Array2::<f32>::zeros((b, CountCategory::COUNT));
        let mut tile_counts = Array3::<f32>::zeros((b, n, CountCategory::COUNT));
        for (k, head) in self.heads.iter().enumerate() {
            let density = head
                .forward(fine.view(), coarse.view(), per_tile.view())
                .map_err(ModelError::at(ForwardStage::DecodeCounts))?;
            let tiles_k = aggregate::tile_totals(density.view());
            for (t, &v) in tiles_k.iter().enumerate() {
                tile_counts[(t / n, t % n, k)] = v as f32;
            }
            let totals = aggregate::image_totals(&tiles_k, n).map_err(ModelError::at(ForwardStage::Aggregate))?;
            for (i, total) in totals.into_iter().enumerate() {
                counts[(i, k)] = total as f32;
            }
        }

        let measures = self
            .measure
            .forward(coarse.view(), embedding.view(), n)
            .map_err(ModelError::at(ForwardStage::PoolMeasure))?;
        debug_assert_eq!(measures.ncols(), MeasureKind::COUNT);
        Ok(NetworkOutput { counts, measures, tile_counts })
    }

    /// Backbones that cannot announce their widths up front are checked
    /// against the heads on every call.
    fn check_widths(&self, features: &[ndarray::Array4<f32>]) -> Result<()> {
        let want = self.heads[0].input_channels();
        let got = (features[features.len() - 2].dim().1, features[features.len() - 1].dim().1);
        if got != want {
            return Err(ModelError::BackboneMismatch(format!(
                "last two stages have {got:?} channels, heads expect {want:?}"
            )));
        }
        Ok(())
    }

    /// Static path: the tile count and edge must equal the configured grid,
    /// mirroring the exported graph's fixed input shape.
    pub fn forward_fixed(&mut self, tiles: ArrayView5<f32>, meta: ArrayView2<f32>) -> Result<NetworkOutput> {
        let (_, n, _, h, w) = tiles.dim();
        let expected = self.config.tile_count();
        let edge = self.config.tile_size as usize;
        if n != expected {
            return Err(ModelError::shape(format!("fixed-shape path expects {expected} tiles, got {n}")));
        }
        if (h, w) != (edge, edge) {
            return Err(ModelError::shape(format!("fixed-shape path expects {edge}x{edge} tiles, got {h}x{w}")));
        }
        self.forward(tiles, meta)
    }
}

/// Every meta row must be a one-hot grain type.
fn check_one_hot(meta: ArrayView2<f32>) -> Result<()> {
    for (i, row) in meta.outer_iter().enumerate() {
        let ones = row.iter().filter(|&&v| v == 1.0).count();
        let zeros = row.iter().filter(|&&v| v == 0.0).count();
        if ones != 1 || ones + zeros != row.len() {
            return Err(ModelError::InvalidInput(format!("meta row {i} {row} is not one-hot")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::PoolingBackbone;
    use crate::category::GrainType;
    use ndarray::{Array5, Axis};
    use rand::{Rng, SeedableRng};

    fn small_config() -> ModelConfig {
        ModelConfig {
            grid_rows: 2,
            grid_cols: 2,
            tile_size: 64,
            meta_dim: 4,
            decoder_channels: 6,
            backend_channels: [5, 3],
            measure_hidden: 8,
            ..ModelConfig::default()
        }
    }

    fn counter(seed: u64) -> TiledCounter<PoolingBackbone> {
        let config = small_config();
        let backbone = PoolingBackbone::tiny();
        let (fine, coarse) = backbone.fused_channels();
        let artifact = ModelArtifact::random(&config, fine, coarse, seed);
        TiledCounter::new(config, &artifact, backbone).unwrap()
    }

    fn tiles(b: usize, n: usize, edge: usize, seed: u64) -> Array5<f32> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        Array5::from_shape_fn((b, n, 3, edge, edge), |_| rng.gen_range(-2.0..2.0))
    }

    fn meta(grains: &[GrainType]) -> Array2<f32> {
        Array2::from_shape_fn((grains.len(), 3), |(i, j)| grains[i].one_hot()[j])
    }

    #[test]
    fn output_shapes() {
        let mut net = counter(1);
        let out = net
            .forward(tiles(2, 4, 64, 0).view(), meta(&[GrainType::Paddy, GrainType::White]).view())
            .unwrap();
        assert_eq!(out.counts.dim(), (2, 9));
        assert_eq!(out.measures.dim(), (2, 6));
        assert_eq!(out.tile_counts.dim(), (2, 4, 9));
        assert!(out.counts.iter().all(|&v| v >= 0.0));
        let summed = out.tile_counts.sum_axis(Axis(1));
        for (a, b) in summed.iter().zip(out.counts.iter()) {
            assert!((a - b).abs() <= 1e-3 * a.abs().max(1.0));
        }
    }

    #[test]
    fn flexible_path_accepts_other_tile_counts() {
        let mut net = counter(2);
        let out = net.forward(tiles(1, 3, 96, 4).view(), meta(&[GrainType::Brown]).view()).unwrap();
        assert_eq!(out.tile_counts.dim(), (1, 3, 9));
    }

    #[test]
    fn fixed_path_rejects_wrong_tile_count() {
        let mut net = counter(3);
        let m = meta(&[GrainType::White]);
        assert!(net.forward_fixed(tiles(1, 4, 64, 0).view(), m.view()).is_ok());
        assert!(matches!(
            net.forward_fixed(tiles(1, 5, 64, 0).view(), m.view()),
            Err(ModelError::ShapeMismatch(_))
        ));
        assert!(net.forward_fixed(tiles(1, 4, 96, 0).view(), m.view()).is_err());
    }

    #[test]
    fn tile_permutation_leaves_outputs_unchanged() {
        let mut net = counter(4);
        let t = tiles(1, 4, 64, 9);
        let mut permuted = t.clone();
        permuted.invert_axis(Axis(1));
        let m = meta(&[GrainType::White]);
        let a = net.forward(t.view(), m.view()).unwrap();
        let b = net.forward(permuted.view(), m.view()).unwrap();
        for (x, y) in a.counts.iter().zip(b.counts.iter()) {
            assert!((x - y).abs() <= 1e-3 * x.abs().max(1.0), "{x} vs {y}");
        }
        for (x, y) in a.measures.iter().zip(b.measures.iter()) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn images_in_a_batch_are_independent() {
        let mut net = counter(5);
        let both = tiles(2, 4, 64, 11);
        let grains = [GrainType::Paddy, GrainType::Brown];
        let joint = net.forward(both.view(), meta(&grains).view()).unwrap();
        let second = both.slice(ndarray::s![1..2, .., .., .., ..]);
        let alone = net.forward(second, meta(&grains[1..]).view()).unwrap();
        for (x, y) in joint.counts.row(1).iter().zip(alone.counts.row(0).iter()) {
            assert!((x - y).abs() <= 1e-3 * x.abs().max(1.0));
        }
    }

    #[test]
    fn meta_and_channel_validation() {
        let mut net = counter(6);
        assert!(net.forward(tiles(1, 4, 64, 0).view(), Array2::zeros((2, 3)).view()).is_err());
        let gray = Array5::<f32>::zeros((1, 4, 1, 64, 64));
        assert!(net.forward(gray.view(), meta(&[GrainType::Paddy]).view()).is_err());
    }

    #[test]
    fn backbone_width_mismatch_fails_at_construction() {
        let config = small_config();
        let artifact = ModelArtifact::random(&config, 7, 13, 0);
        let err = TiledCounter::new(config, &artifact, PoolingBackbone::tiny()).err().unwrap();
        assert!(matches!(err, ModelError::BackboneMismatch(_)));
        assert!(err.is_fatal());
    }

    /// A backbone that only reveals its widths by running.
    struct Silent(PoolingBackbone);

    impl FeatureBackbone for Silent {
        fn channels(&self) -> Option<Vec<usize>> {
            None
        }

        fn extract(&mut self, tiles: ndarray::ArrayView4<f32>) -> Result<Vec<ndarray::Array4<f32>>> {
            self.0.extract(tiles)
        }
    }

    #[test]
    fn unannounced_width_mismatch_is_fatal_on_first_forward() {
        let config = small_config();
        let artifact = ModelArtifact::random(&config, 7, 13, 0);
        let mut net = TiledCounter::new(config, &artifact, Silent(PoolingBackbone::tiny())).unwrap();
        let err = net.forward(tiles(1, 4, 64, 0).view(), meta(&[GrainType::Paddy]).view()).unwrap_err();
        assert_eq!(err.forward_stage(), Some(ForwardStage::Backbone));
        assert!(err.is_fatal());
    }

    #[test]
    fn meta_rows_must_be_one_hot() {
        let mut net = counter(7);
        let t = tiles(1, 4, 64, 0);
        for bad in [[0.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.5, 0.5, 0.0], [1.0, 0.0, f32::NAN]] {
            let m = Array2::from_shape_vec((1, 3), bad.to_vec()).unwrap();
            let err = net.forward(t.view(), m.view()).unwrap_err();
            assert!(matches!(err, ModelError::InvalidInput(_)), "{bad:?}: {err}");
            assert!(!err.is_fatal());
        }
        assert!(net.forward(t.view(), meta(&[GrainType::Brown]).view()).is_ok());
    }
}
