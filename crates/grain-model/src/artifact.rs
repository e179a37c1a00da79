//! Head weights and measurement normalization constants, stored as
//! safetensors under their PyTorch `state_dict` names.

use crate::category::{CountCategory, MeasureKind};
use crate::config::ModelConfig;
use crate::ops::{Conv2d, Linear};
use crate::{ModelError, Result};
use ndarray::{Array1, Array2, Array4, ArrayD, Dimension, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MEAN_KEY: &str = "m_stats.mean";
pub const STD_KEY: &str = "m_stats.std";
/// Written by the export next to the graphs it produces.
pub const NORMALIZATION_FILE: &str = "normalization.json";

/// Per-measurement `(mean, std)` used to undo target standardization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormStats {
    pub mean: [f32; MeasureKind::COUNT],
    pub std: [f32; MeasureKind::COUNT],
}

impl Default for NormStats {
    /// Constants of the released checkpoint.
    fn default() -> Self {
        Self {
            mean: [7.648381, 2.564115, 3.064693, 64.199936, 2.807240, 15.470088],
            std: [1.224848, 0.378145, 0.346573, 6.393577, 5.450570, 14.535635],
        }
    }
}

impl NormStats {
    /// `raw * (std + eps) + mean`, element-wise.
    pub fn denormalize(&self, raw: &[f32; MeasureKind::COUNT], eps: f32) -> [f32; MeasureKind::COUNT] {
        std::array::from_fn(|i| raw[i] * (self.std[i] + eps) + self.mean[i])
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// Stats exported alongside `graph`. An exported graph has no other
    /// source for them, so a missing file is an artifact error.
    pub fn beside_graph(graph: impl AsRef<Path>) -> Result<Self> {
        let path = graph.as_ref().with_file_name(NORMALIZATION_FILE);
        let text = std::fs::read_to_string(&path).map_err(|source| ModelError::Artifact { path, source })?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Tensors keyed by name, all `f32`.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    path: PathBuf,
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl ModelArtifact {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = std::fs::read(&path).map_err(|source| ModelError::Artifact {
            path: path.clone(),
            source,
        })?;
        let artifact = Self::from_bytes(&bytes, path)?;
        log::info!(
            "loaded {} tensors ({} params) from {:?}",
            artifact.tensors.len(),
            artifact.param_count(),
            artifact.path
        );
        Ok(artifact)
    }

    /// `origin` is only used in error messages.
    pub fn from_bytes(bytes: &[u8], origin: impl Into<PathBuf>) -> Result<Self> {
        let st = SafeTensors::deserialize(bytes)?;
        let mut tensors = BTreeMap::new();
        for (name, view) in st.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(ModelError::BadTensor {
                    key: name,
                    reason: format!("expected F32, found {:?}", view.dtype()),
                });
            }
            let data: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let array = ArrayD::from_shape_vec(IxDyn(view.shape()), data)
                .map_err(|e| ModelError::BadTensor { key: name.clone(), reason: e.to_string() })?;
            tensors.insert(name, array);
        }
        Ok(Self { path: origin.into(), tensors })
    }

    pub fn empty(origin: impl Into<PathBuf>) -> Self {
        Self { path: origin.into(), tensors: BTreeMap::new() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn param_count(&self) -> usize {
        self.tensors.values().map(|t| t.len()).sum()
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(key.into(), tensor);
    }

    pub fn tensor(&self, key: &str) -> Result<&ArrayD<f32>> {
        self.tensors.get(key).ok_or_else(|| ModelError::MissingKey {
            path: self.path.clone(),
            key: key.to_string(),
        })
    }

    fn typed<D: Dimension>(&self, key: &str) -> Result<ndarray::Array<f32, D>> {
        self.tensor(key)?
            .clone()
            .into_dimensionality::<D>()
            .map_err(|e| ModelError::BadTensor { key: key.to_string(), reason: e.to_string() })
    }

    pub fn array1(&self, key: &str) -> Result<Array1<f32>> {
        self.typed(key)
    }

    pub fn array2(&self, key: &str) -> Result<Array2<f32>> {
        self.typed(key)
    }

    pub fn array4(&self, key: &str) -> Result<Array4<f32>> {
        self.typed(key)
    }

    /// `{prefix}.weight` + `{prefix}.bias` as a fully connected layer.
    pub fn linear(&self, prefix: &str) -> Result<Linear> {
        Linear::new(self.array2(&format!("{prefix}.weight"))?, self.array1(&format!("{prefix}.bias"))?)
    }

    pub fn conv(&self, prefix: &str) -> Result<Conv2d> {
        Conv2d::new(self.array4(&format!("{prefix}.weight"))?, self.array1(&format!("{prefix}.bias"))?)
    }

    pub fn norm_stats(&self) -> Result<NormStats> {
        let fixed = |key: &str| -> Result<[f32; MeasureKind::COUNT]> {
            let v = self.array1(key)?;
            <[f32; MeasureKind::COUNT]>::try_from(v.to_vec()).map_err(|v| ModelError::BadTensor {
                key: key.to_string(),
                reason: format!("expected {} values, found {}", MeasureKind::COUNT, v.len()),
            })
        };
        Ok(NormStats { mean: fixed(MEAN_KEY)?, std: fixed(STD_KEY)? })
    }

    pub fn set_norm_stats(&mut self, norm: &NormStats) {
        self.insert(MEAN_KEY, Array1::from(norm.mean.to_vec()).into_dyn());
        self.insert(STD_KEY, Array1::from(norm.std.to_vec()).into_dyn());
    }

    /// Every tensor name the heads read, in load order.
    pub fn required_keys() -> Vec<String> {
        let mut keys = Vec::new();
        let mut pair = |prefix: String| {
            keys.push(format!("{prefix}.weight"));
            keys.push(format!("{prefix}.bias"));
        };
        pair("meta_proj.0".into());
        pair("meta_proj.1".into());
        for i in 0..CountCategory::COUNT {
            for layer in ["reduce_32.0", "reduce_16.0", "backend.0", "backend.2", "backend.4"] {
                pair(format!("count_heads.{i}.{layer}"));
            }
        }
        pair("measure_head.0".into());
        pair("measure_head.3".into());
        keys.push(MEAN_KEY.into());
        keys.push(STD_KEY.into());
        keys
    }

    /// Fails on the first absent key, before any image is touched.
    pub fn check_complete(&self) -> Result<()> {
        for key in Self::required_keys() {
            self.tensor(&key)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let raw: Vec<(&str, Vec<u8>, Vec<usize>)> = self
            .tensors
            .iter()
            .map(|(k, t)| {
                let bytes = t.iter().flat_map(|v| v.to_le_bytes()).collect();
                (k.as_str(), bytes, t.shape().to_vec())
            })
            .collect();
        let views = raw
            .iter()
            .map(|(k, bytes, shape)| Ok((*k, TensorView::new(Dtype::F32, shape.clone(), bytes)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(safetensors::serialize(views.iter().map(|(k, v)| (*k, v)), &None)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Randomly initialised heads for a backbone with the given last two
    /// stage widths. Used for smoke runs and benchmarks without a checkpoint.
    pub fn random(config: &ModelConfig, fine_channels: usize, coarse_channels: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut a = Self::empty(format!("<random:{seed}>"));
        let e = config.meta_dim;
        let mid = config.decoder_channels;
        let [b0, b1] = config.backend_channels;

        let mut uniform = |shape: &[usize], fan_in: usize| -> ArrayD<f32> {
            let bound = 1.0 / (fan_in as f32).sqrt();
            ArrayD::from_shape_fn(IxDyn(shape), |_| rng.gen_range(-bound..bound))
        };
        let mut put = |a: &mut Self, prefix: String, shape: &[usize], fan_in: usize| {
            a.insert(format!("{prefix}.weight"), uniform(shape, fan_in));
            a.insert(format!("{prefix}.bias"), uniform(&shape[..1], fan_in));
        };

        put(&mut a, "meta_proj.0".into(), &[e, 3], 3);
        for i in 0..CountCategory::COUNT {
            let p = format!("count_heads.{i}");
            put(&mut a, format!("{p}.reduce_32.0"), &[mid, coarse_channels, 1, 1], coarse_channels);
            put(&mut a, format!("{p}.reduce_16.0"), &[mid, fine_channels, 1, 1], fine_channels);
            let fused = 2 * mid + e;
            put(&mut a, format!("{p}.backend.0"), &[b0, fused, 3, 3], fused * 9);
            put(&mut a, format!("{p}.backend.2"), &[b1, b0, 3, 3], b0 * 9);
            put(&mut a, format!("{p}.backend.4"), &[1, b1, 1, 1], b1);
        }
        put(&mut a, "measure_head.0".into(), &[config.measure_hidden, coarse_channels + e], coarse_channels + e);
        put(&mut a, "measure_head.3".into(), &[MeasureKind::COUNT, config.measure_hidden], config.measure_hidden);

        a.insert("meta_proj.1.weight", ArrayD::ones(IxDyn(&[e])));
        a.insert("meta_proj.1.bias", ArrayD::zeros(IxDyn(&[e])));
        a.set_norm_stats(&NormStats::default());
        a
    }
}
