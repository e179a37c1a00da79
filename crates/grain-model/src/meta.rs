//! Grain-type conditioning: one-hot → dense embedding.

use crate::artifact::ModelArtifact;
use crate::category::GrainType;
use crate::config::ModelConfig;
use crate::ops::{self, Linear};
use crate::{ModelError, Result};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};

/// `Linear(3, E) → LayerNorm(E) → GELU`, weights under `meta_proj.{0,1}`.
#[derive(Debug, Clone)]
pub struct MetaEncoder {
    proj: Linear,
    gamma: Array1<f32>,
    beta: Array1<f32>,
    eps: f32,
}

impl MetaEncoder {
    pub fn from_artifact(artifact: &ModelArtifact, config: &ModelConfig) -> Result<Self> {
        let proj = artifact.linear("meta_proj.0")?;
        let gamma = artifact.array1("meta_proj.1.weight")?;
        let beta = artifact.array1("meta_proj.1.bias")?;
        if proj.in_features() != GrainType::ALL.len() {
            return Err(ModelError::BadTensor {
                key: "meta_proj.0.weight".into(),
                reason: format!("expected 3 inputs, found {}", proj.in_features()),
            });
        }
        let e = proj.out_features();
        if e != config.meta_dim || gamma.len() != e || beta.len() != e {
            return Err(ModelError::BadTensor {
                key: "meta_proj".into(),
                reason: format!(
                    "embedding width {e} (norm {}/{}) does not match meta_dim {}",
                    gamma.len(),
                    beta.len(),
                    config.meta_dim
                ),
            });
        }
        Ok(Self { proj, gamma, beta, eps: config.layer_norm_eps })
    }

    pub fn dim(&self) -> usize {
        self.proj.out_features()
    }

    pub fn param_count(&self) -> usize {
        self.proj.param_count() + self.gamma.len() + self.beta.len()
    }

    /// `meta: (B, 3)` → `(B, E)`.
    pub fn encode_batch(&self, meta: ArrayView2<f32>) -> Result<Array2<f32>> {
        let mut x = self.proj.forward(meta)?;
        ops::layer_norm(&mut x, self.gamma.view(), self.beta.view(), self.eps);
        ops::gelu(&mut x);
        Ok(x)
    }

    pub fn encode(&self, grain: GrainType) -> Result<Array1<f32>> {
        let one_hot = Array1::from(grain.one_hot().to_vec()).insert_axis(Axis(0));
        Ok(self.encode_batch(one_hot.view())?.index_axis_move(Axis(0), 0))
    }

    /// Embedding repeated over an `h × w` grid, `(E, h, w)`.
    pub fn broadcast(embedding: ArrayView1<f32>, h: usize, w: usize) -> Array3<f32> {
        ops::broadcast_spatial(embedding, h, w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> MetaEncoder {
        let config = ModelConfig { meta_dim: 8, ..ModelConfig::default() };
        let artifact = ModelArtifact::random(&config, 4, 8, 11);
        MetaEncoder::from_artifact(&artifact, &config).unwrap()
    }

    #[test]
    fn encoding_is_deterministic_and_sized() {
        let enc = encoder();
        let a = enc.encode(GrainType::White).unwrap();
        let b = enc.encode(GrainType::White).unwrap();
        assert_eq!(a.len(), 8);
        assert_eq!(a, b);
        assert_ne!(a, enc.encode(GrainType::Brown).unwrap());
    }

    #[test]
    fn broadcast_fills_every_position() {
        let enc = encoder();
        let e = enc.encode(GrainType::Paddy).unwrap();
        let map = MetaEncoder::broadcast(e.view(), 3, 5);
        assert_eq!(map.dim(), (8, 3, 5));
        for (k, plane) in map.outer_iter().enumerate() {
            assert!(plane.iter().all(|&v| v == e[k]));
        }
    }

    #[test]
    fn width_must_match_config() {
        let artifact = ModelArtifact::random(&ModelConfig { meta_dim: 8, ..ModelConfig::default() }, 4, 8, 0);
        assert!(MetaEncoder::from_artifact(&artifact, &ModelConfig::default()).is_err());
    }
}
