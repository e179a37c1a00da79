//! Whole-image regression of the six continuous measurements.

use crate::artifact::ModelArtifact;
use crate::category::MeasureKind;
use crate::config::ModelConfig;
use crate::ops::{self, Linear};
use crate::{ModelError, Result};
use ndarray::{concatenate, Array2, ArrayView2, ArrayView4, Axis};

/// `Linear(C + E, hidden) → GELU → Dropout → Linear(hidden, 6)` over the
/// tile-averaged coarsest features and the meta embedding.
#[derive(Debug, Clone)]
pub struct MeasurementHead {
    hidden: Linear,
    out: Linear,
}

impl MeasurementHead {
    pub fn from_artifact(artifact: &ModelArtifact, config: &ModelConfig) -> Result<Self> {
        let hidden = artifact.linear("measure_head.0")?;
        let out = artifact.linear("measure_head.3")?;
        if hidden.out_features() != config.measure_hidden || out.in_features() != hidden.out_features() {
            return Err(ModelError::BadTensor {
                key: "measure_head".into(),
                reason: format!(
                    "hidden width {} -> {}, expected {}",
                    hidden.out_features(),
                    out.in_features(),
                    config.measure_hidden
                ),
            });
        }
        if out.out_features() != MeasureKind::COUNT {
            return Err(ModelError::BadTensor {
                key: "measure_head.3.weight".into(),
                reason: format!("expected {} outputs, found {}", MeasureKind::COUNT, out.out_features()),
            });
        }
        Ok(Self { hidden, out })
    }

    /// Width of the pooled vector, `C + E`.
    pub fn in_features(&self) -> usize {
        self.hidden.in_features()
    }

    pub fn param_count(&self) -> usize {
        self.hidden.param_count() + self.out.param_count()
    }

    /// `coarse: (B·N, C, H, W)`, `meta: (B, E)` → `(B, 6)`.
    ///
    /// Pooling the broadcast meta map yields the embedding itself, so it is
    /// appended after pooling instead of being concatenated spatially.
    pub fn forward(&self, coarse: ArrayView4<f32>, meta: ArrayView2<f32>, tiles_per_image: usize) -> Result<Array2<f32>> {
        let b = meta.nrows();
        if tiles_per_image == 0 || coarse.dim().0 != b * tiles_per_image {
            return Err(ModelError::shape(format!(
                "{} tiles do not form {b} images of {tiles_per_image}",
                coarse.dim().0
            )));
        }
        let pooled = ops::global_avg_pool(coarse);
        let c = pooled.ncols();
        let per_image = pooled
            .into_shape_with_order((b, tiles_per_image, c))
            .map_err(|e| ModelError::shape(e.to_string()))?
            .mean_axis(Axis(1))
            .ok_or_else(|| ModelError::shape("no tiles to average"))?;
        let x = concatenate(Axis(1), &[per_image.view(), meta.view()])
            .map_err(|e| ModelError::shape(format!("measure concat: {e}")))?;

        let mut h = self.hidden.forward(x.view())?;
        ops::gelu(&mut h);
        self.out.forward(h.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array4, Axis};

    fn head() -> MeasurementHead {
        let config = ModelConfig { meta_dim: 4, measure_hidden: 9, ..ModelConfig::default() };
        MeasurementHead::from_artifact(&ModelArtifact::random(&config, 6, 10, 5), &config).unwrap()
    }

    #[test]
    fn shape_is_stable_for_any_tile_count() {
        let h = head();
        assert_eq!(h.in_features(), 14);
        let meta = Array2::<f32>::from_elem((2, 4), 0.5);
        for n in [1, 3, 48] {
            let coarse = Array4::<f32>::from_elem((2 * n, 10, 3, 2), 0.25);
            let y = h.forward(coarse.view(), meta.view(), n).unwrap();
            assert_eq!(y.dim(), (2, 6));
            assert!(y.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn tile_order_does_not_matter() {
        let h = head();
        let meta = Array2::<f32>::from_elem((1, 4), 0.1);
        let coarse = Array4::from_shape_fn((4, 10, 2, 2), |(t, c, y, x)| (t * 3 + c + y + x) as f32 * 0.05);
        let mut reversed = coarse.clone();
        reversed.invert_axis(Axis(0));
        let a = h.forward(coarse.view(), meta.view(), 4).unwrap();
        let b = h.forward(reversed.view(), meta.view(), 4).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn embedding_reaches_the_regressor() {
        let h = head();
        let coarse = Array4::<f32>::from_elem((3, 10, 2, 2), 0.2);
        let zero = h.forward(coarse.view(), Array2::<f32>::zeros((1, 4)).view(), 3).unwrap();
        let ones = h.forward(coarse.view(), Array2::<f32>::ones((1, 4)).view(), 3).unwrap();
        assert_ne!(zero, ones);
    }

    #[test]
    fn ragged_batches_rejected() {
        let h = head();
        let meta = Array2::<f32>::zeros((2, 4));
        let coarse = Array4::<f32>::zeros((5, 10, 2, 2));
        assert!(h.forward(coarse.view(), meta.view(), 2).is_err());
    }
}
