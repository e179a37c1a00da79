//! Scale-fusion count decoder.
//!
//! Fuses the two coarsest backbone stages with the meta embedding into a
//! single-channel, non-negative density map at the finer stage's
//! resolution. Nine instances, one per [`CountCategory`](crate::CountCategory).

use crate::artifact::ModelArtifact;
use crate::config::ModelConfig;
use crate::meta::MetaEncoder;
use crate::ops::{self, Conv2d};
use crate::{ModelError, Result};
use ndarray::{Array3, Array4, ArrayView1, ArrayView2, ArrayView3, ArrayView4, Axis};

#[derive(Debug, Clone)]
pub struct CountDecoder {
    reduce_coarse: Conv2d,
    reduce_fine: Conv2d,
    backend: [Conv2d; 3],
}

impl CountDecoder {
    /// Loads `count_heads.{index}.*`.
    pub fn from_artifact(artifact: &ModelArtifact, index: usize, config: &ModelConfig) -> Result<Self> {
        let p = format!("count_heads.{index}");
        let reduce_coarse = artifact.conv(&format!("{p}.reduce_32.0"))?;
        let reduce_fine = artifact.conv(&format!("{p}.reduce_16.0"))?;
        let backend = [
            artifact.conv(&format!("{p}.backend.0"))?,
            artifact.conv(&format!("{p}.backend.2"))?,
            artifact.conv(&format!("{p}.backend.4"))?,
        ];

        let bad = |reason: String| ModelError::BadTensor { key: p.clone(), reason };
        let mid = config.decoder_channels;
        if reduce_coarse.out_channels() != mid || reduce_fine.out_channels() != mid {
            return Err(bad(format!(
                "reductions produce {}/{} channels, expected {mid}",
                reduce_fine.out_channels(),
                reduce_coarse.out_channels()
            )));
        }
        if reduce_coarse.kernel_size() != 1 || reduce_fine.kernel_size() != 1 {
            return Err(bad("reductions must be 1x1".into()));
        }
        let fused = 2 * mid + config.meta_dim;
        let widths = [
            (backend[0].in_channels(), fused),
            (backend[0].out_channels(), config.backend_channels[0]),
            (backend[1].in_channels(), config.backend_channels[0]),
            (backend[1].out_channels(), config.backend_channels[1]),
            (backend[2].in_channels(), config.backend_channels[1]),
            (backend[2].out_channels(), 1),
        ];
        if let Some((found, expected)) = widths.iter().find(|(f, e)| f != e) {
            return Err(bad(format!("backend width {found}, expected {expected}")));
        }
        let kernels = backend.iter().map(Conv2d::kernel_size).collect::<Vec<_>>();
        if kernels != [3, 3, 1] {
            return Err(bad(format!("backend kernels {kernels:?}, expected [3, 3, 1]")));
        }
        Ok(Self { reduce_coarse, reduce_fine, backend })
    }

    /// `(fine, coarse)` channel widths this head expects.
    pub fn input_channels(&self) -> (usize, usize) {
        (self.reduce_fine.in_channels(), self.reduce_coarse.in_channels())
    }

    pub fn param_count(&self) -> usize {
        self.reduce_coarse.param_count()
            + self.reduce_fine.param_count()
            + self.backend.iter().map(Conv2d::param_count).sum::<usize>()
    }

    /// One tile: `fine (C_a, H_a, W_a)`, `coarse (C_b, H_b, W_b)`,
    /// `meta (E,)` → density `(1, H_a, W_a)`.
    pub fn forward_tile(
        &self,
        fine: ArrayView3<f32>,
        coarse: ArrayView3<f32>,
        meta: ArrayView1<f32>,
    ) -> Result<Array3<f32>> {
        let mut f = self.reduce_fine.forward(fine)?;
        ops::relu(&mut f);
        let (_, ha, wa) = f.dim();

        let mut c = self.reduce_coarse.forward(coarse)?;
        ops::relu(&mut c);
        let mut c = ops::upsample2x(c.view());
        if (c.dim().1, c.dim().2) != (ha, wa) {
            log::trace!("aligning coarse map {:?} to {ha}x{wa}", c.dim());
            c = ops::resize_bilinear(c.view(), ha, wa);
        }

        let m = MetaEncoder::broadcast(meta, ha, wa);
        let mut x = ops::concat_channels(&[f.view(), c.view(), m.view()])?;
        for conv in &self.backend {
            x = conv.forward(x.view())?;
            ops::relu(&mut x);
        }
        Ok(x)
    }

    /// Tile batch: `meta` has one embedding row per tile.
    pub fn forward(
        &self,
        fine: ArrayView4<f32>,
        coarse: ArrayView4<f32>,
        meta: ArrayView2<f32>,
    ) -> Result<Array4<f32>> {
        let (t, _, ha, wa) = fine.dim();
        if coarse.dim().0 != t || meta.nrows() != t {
            return Err(ModelError::shape(format!(
                "decoder got {t} fine, {} coarse and {} meta rows",
                coarse.dim().0,
                meta.nrows()
            )));
        }
        let mut out = Array4::<f32>::zeros((t, 1, ha, wa));
        for i in 0..t {
            let density = self.forward_tile(
                fine.index_axis(Axis(0), i),
                coarse.index_axis(Axis(0), i),
                meta.row(i),
            )?;
            out.index_axis_mut(Axis(0), i).assign(&density);
        }
        Ok(out)
    }
}
