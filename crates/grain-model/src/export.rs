//! Export of the tiled network to static-shape ONNX graphs.
//!
//! Graph capture needs torch and timm, so this module writes Python scripts
//! and drives them with `tokio::process`, then checks the results from Rust.

use crate::artifact::ModelArtifact;
use crate::config::ModelConfig;
use crate::integrity::{self, GraphReport, IntegrityBounds, IntegrityReport, Precision};
use crate::quantize::ModelQuantizer;
use crate::{CountCategory, MeasureKind, ModelError};
use anyhow::{Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::ValueType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const TILES_INPUT: &str = "tiles";
pub const META_INPUT: &str = "meta";
pub const COUNTS_OUTPUT: &str = "counts";
pub const MEASURES_OUTPUT: &str = "measures";

/// Export settings. The network shape itself comes from `model`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
    /// Torch checkpoint holding `model` (state dict) and `m_stats`.
    pub checkpoint: PathBuf,
    /// timm model name of the backbone.
    pub backbone: String,
    pub model: ModelConfig,
    pub opset: u32,
    pub quantize: bool,
    pub python: String,
    pub fp32_name: String,
    pub int8_name: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./models"),
            checkpoint: PathBuf::from("./models/base/best_model.pth"),
            backbone: "convnext_small.fb_in22k_ft_in1k_384".to_string(),
            model: ModelConfig::mobile(),
            opset: 14,
            quantize: true,
            python: "python3".to_string(),
            fp32_name: "tiled_counter_fp32.onnx".to_string(),
            int8_name: "tiled_counter_int8.onnx".to_string(),
        }
    }
}

impl ExportConfig {
    pub fn normalization_path(&self) -> PathBuf {
        self.output_dir.join(crate::artifact::NORMALIZATION_FILE)
    }

    pub fn model_config_path(&self) -> PathBuf {
        self.output_dir.join("model_config.json")
    }
}

/// Names and static dims of a graph's inputs and outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSignature {
    pub inputs: Vec<(String, Vec<i64>)>,
    pub outputs: Vec<(String, Vec<i64>)>,
}

impl GraphSignature {
    pub fn input(&self, name: &str) -> Option<&[i64]> {
        self.inputs.iter().find(|(n, _)| n == name).map(|(_, d)| d.as_slice())
    }

    pub fn output(&self, name: &str) -> Option<&[i64]> {
        self.outputs.iter().find(|(n, _)| n == name).map(|(_, d)| d.as_slice())
    }

    /// `tiles (N,3,S,S)`, `meta (1,3)` → `counts (1,9)`, `measures (1,6)`.
    pub fn check(&self, tile_count: usize, tile_size: u32) -> std::result::Result<(), ModelError> {
        let (n, s) = (tile_count as i64, tile_size as i64);
        let expect = [
            (self.input(TILES_INPUT), vec![n, 3, s, s], TILES_INPUT),
            (self.input(META_INPUT), vec![1, 3], META_INPUT),
            (self.output(COUNTS_OUTPUT), vec![1, CountCategory::COUNT as i64], COUNTS_OUTPUT),
            (self.output(MEASURES_OUTPUT), vec![1, MeasureKind::COUNT as i64], MEASURES_OUTPUT),
        ];
        for (found, want, name) in expect {
            match found {
                None => return Err(ModelError::shape(format!("graph has no `{name}` tensor"))),
                Some(dims) if dims != want.as_slice() => {
                    return Err(ModelError::shape(format!("`{name}` is {dims:?}, expected {want:?}")))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Loads `path` in onnxruntime and reports its I/O signature.
pub fn inspect_graph(path: &Path) -> std::result::Result<GraphSignature, ModelError> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level1)?
        .commit_from_file(path)?;
    Ok(signature_of(&session))
}

/// I/O names and dims of a live session. Symbolic dimensions show up as `-1`.
pub fn signature_of(session: &Session) -> GraphSignature {
    let dims = |t: &ValueType| -> Vec<i64> {
        match t {
            ValueType::Tensor { shape, .. } => shape.iter().copied().collect(),
            _ => Vec::new(),
        }
    };
    GraphSignature {
        inputs: session.inputs.iter().map(|i| (i.name.clone(), dims(&i.input_type))).collect(),
        outputs: session.outputs.iter().map(|o| (o.name.clone(), dims(&o.output_type))).collect(),
    }
}

/// Everything produced by [`ExportPipeline::export`].
#[derive(Debug, Clone)]
pub struct ExportResult {
    pub fp32_model: PathBuf,
    pub fp32_integrity: IntegrityReport,
    pub int8_model: Option<PathBuf>,
    pub int8_integrity: Option<IntegrityReport>,
    pub report: GraphReport,
    pub normalization: PathBuf,
    pub signature: GraphSignature,
}

/// Output of [`ExportPipeline::prepare_eager_artifact`].
#[derive(Debug, Clone)]
pub struct EagerArtifacts {
    pub heads: PathBuf,
    pub backbone: PathBuf,
    pub model_config: PathBuf,
}

pub struct ExportPipeline {
    config: ExportConfig,
    bounds: IntegrityBounds,
}

impl ExportPipeline {
    pub fn new(config: ExportConfig) -> Result<Self> {
        config.model.validate()?;
        std::fs::create_dir_all(&config.output_dir)
            .with_context(|| format!("Failed to create output directory: {:?}", config.output_dir))?;
        Ok(Self { config, bounds: IntegrityBounds::default() })
    }

    pub fn with_bounds(mut self, bounds: IntegrityBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Checkpoint → FP32 graph (→ INT8 graph), each verified before the
    /// next step runs.
    pub async fn export(&self) -> Result<ExportResult> {
        let fp32_path = self.config.output_dir.join(&self.config.fp32_name);
        let report_path = fp32_path.with_extension("report.json");
        log::info!("exporting {:?} -> {:?}", self.config.checkpoint, fp32_path);

        let script = self.generate_export_script(&fp32_path, &report_path);
        run_python(&self.config.python, &script, "export").await?;

        let report = GraphReport::from_json_file(&report_path)
            .with_context(|| format!("Failed to read export report {report_path:?}"))?;
        let file_bytes = tokio::fs::metadata(&fp32_path).await?.len();
        let fp32_integrity = integrity::verify(&report, file_bytes, Precision::Fp32, &self.bounds)?;

        let signature = inspect_graph(&fp32_path)?;
        signature.check(self.config.model.tile_count(), self.config.model.tile_size)?;
        self.config.model.to_json_file(self.config.model_config_path())?;

        let (int8_model, int8_integrity) = if self.config.quantize {
            let quantizer = ModelQuantizer::new(&self.config);
            let (path, int8_report) = quantizer
                .quantize_dynamic(&fp32_path, &self.config.int8_name, report.source_params)
                .await?;
            let bytes = tokio::fs::metadata(&path).await?.len();
            let checked = integrity::verify(&int8_report, bytes, Precision::Int8, &self.bounds)?;
            quantizer
                .validate_quantized_model(&path)?
                .check(self.config.model.tile_count(), self.config.model.tile_size)?;
            (Some(path), Some(checked))
        } else {
            (None, None)
        };

        Ok(ExportResult {
            fp32_model: fp32_path,
            fp32_integrity,
            int8_model,
            int8_integrity,
            report,
            normalization: self.config.normalization_path(),
            signature,
        })
    }

    /// Splits the checkpoint for the native path: head weights and
    /// normalization constants to safetensors, the backbone alone to a
    /// multi-output ONNX graph with a dynamic batch axis.
    pub async fn prepare_eager_artifact(&self) -> Result<EagerArtifacts> {
        let heads = self.config.output_dir.join("heads.safetensors");
        let backbone = self.config.output_dir.join("backbone.onnx");
        let report_path = backbone.with_extension("report.json");

        let script = self.generate_eager_script(&heads, &backbone, &report_path);
        run_python(&self.config.python, &script, "eager artifact").await?;

        let artifact = ModelArtifact::load(&heads)?;
        artifact.check_complete()?;
        let report = GraphReport::from_json_file(&report_path)?;
        let bytes = tokio::fs::metadata(&backbone).await?.len();
        integrity::verify(&report, bytes, Precision::Fp32, &self.bounds)?;

        let model_config = self.config.model_config_path();
        self.config.model.to_json_file(&model_config)?;
        Ok(EagerArtifacts { heads, backbone, model_config })
    }

    fn script_header(&self) -> String {
        let m = &self.config.model;
        format!(
            r#"#!/usr/bin/env python3
CHECKPOINT = {checkpoint}
BACKBONE = {backbone}
NORM_OUT = {norm}
TILE = {tile}
N_TILES = {n_tiles}
META_DIM = {meta_dim}
MID = {mid}
BACKEND = ({b0}, {b1})
HIDDEN = {hidden}
DROPOUT = {dropout}
N_COUNTS = {n_counts}
N_MEASURES = {n_measures}
OPSET = {opset}
"#,
            checkpoint = py_str(&self.config.checkpoint),
            backbone = py_str(&self.config.backbone),
            norm = py_str(&self.config.normalization_path()),
            tile = m.tile_size,
            n_tiles = m.tile_count(),
            meta_dim = m.meta_dim,
            mid = m.decoder_channels,
            b0 = m.backend_channels[0],
            b1 = m.backend_channels[1],
            hidden = m.measure_hidden,
            dropout = m.measure_dropout,
            n_counts = CountCategory::COUNT,
            n_measures = MeasureKind::COUNT,
            opset = self.config.opset,
        )
    }

    fn generate_export_script(&self, out: &Path, report: &Path) -> String {
        format!(
            "{header}OUT = {out}\nREPORT = {report}\n{model}{main}",
            header = self.script_header(),
            out = py_str(out),
            report = py_str(report),
            model = MODEL_PY,
            main = EXPORT_MAIN_PY,
        )
    }

    fn generate_eager_script(&self, heads: &Path, backbone: &Path, report: &Path) -> String {
        format!(
            "{header}HEADS_OUT = {heads}\nBACKBONE_OUT = {backbone}\nREPORT = {report}\n{model}{main}",
            header = self.script_header(),
            heads = py_str(heads),
            backbone = py_str(backbone),
            report = py_str(report),
            model = MODEL_PY,
            main = EAGER_MAIN_PY,
        )
    }
}

/// Quoted Python string literal.
pub(crate) fn py_str(value: impl AsRef<std::ffi::OsStr>) -> String {
    let s = value.as_ref().to_string_lossy();
    serde_json::to_string(s.as_ref()).unwrap_or_else(|_| format!("{s:?}"))
}

/// Runs `script` with `python` and returns its stdout.
pub(crate) async fn run_python(python: &str, script: &str, what: &str) -> Result<String> {
    let temp_script = tempfile::NamedTempFile::with_suffix(".py")?;
    tokio::fs::write(temp_script.path(), script).await?;

    let output = tokio::process::Command::new(python)
        .arg(temp_script.path())
        .output()
        .await
        .with_context(|| format!("Failed to execute {what} script with {python}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!("{what} failed: {stderr}"));
    }
    for line in stdout.lines() {
        log::info!("[{what}] {line}");
    }
    Ok(stdout)
}

const MODEL_PY: &str = r#"
import json
import numpy as np
import torch
import torch.nn as nn
import torch.nn.functional as F
import timm


class CountDecoder(nn.Module):
    def __init__(self, channels):
        super().__init__()
        self.up = nn.Upsample(scale_factor=2, mode="bilinear", align_corners=True)
        self.reduce_32 = nn.Sequential(nn.Conv2d(channels[-1], MID, 1), nn.ReLU(inplace=True))
        self.reduce_16 = nn.Sequential(nn.Conv2d(channels[-2], MID, 1), nn.ReLU(inplace=True))
        self.backend = nn.Sequential(
            nn.Conv2d(MID * 2 + META_DIM, BACKEND[0], kernel_size=3, padding=1),
            nn.ReLU(inplace=True),
            nn.Conv2d(BACKEND[0], BACKEND[1], kernel_size=3, padding=1),
            nn.ReLU(inplace=True),
            nn.Conv2d(BACKEND[1], 1, kernel_size=1),
        )

    def forward(self, fine, coarse, meta_map):
        up = self.up(self.reduce_32(coarse))
        fine = self.reduce_16(fine)
        if up.shape != fine.shape:
            up = F.interpolate(up, size=fine.shape[2:], mode="bilinear", align_corners=True)
        return self.backend(torch.cat([fine, up, meta_map], dim=1))


class TiledCounter(nn.Module):
    def __init__(self, name):
        super().__init__()
        self.backbone = timm.create_model(name, pretrained=False, features_only=True)
        channels = self.backbone.feature_info.channels()
        self.meta_proj = nn.Sequential(nn.Linear(3, META_DIM), nn.LayerNorm(META_DIM), nn.GELU())
        self.count_heads = nn.ModuleList([CountDecoder(channels) for _ in range(N_COUNTS)])
        self.measure_head = nn.Sequential(
            nn.Linear(channels[-1] + META_DIM, HIDDEN), nn.GELU(), nn.Dropout(DROPOUT),
            nn.Linear(HIDDEN, N_MEASURES),
        )

    def forward(self, x, meta):
        b, n, c, h, w = x.shape
        feats = self.backbone(x.view(b * n, c, h, w))
        fine, coarse = feats[-2], feats[-1]
        m = self.meta_proj(meta).repeat_interleave(n, dim=0)
        m_fine = m.view(b * n, META_DIM, 1, 1).expand(-1, -1, fine.shape[2], fine.shape[3])
        counts = []
        for head in self.count_heads:
            d = F.relu(head(fine, coarse, m_fine))
            counts.append(d.sum(dim=(1, 2, 3)).view(b, n).sum(dim=1, keepdim=True))
        m_coarse = m.view(b * n, META_DIM, 1, 1).expand(-1, -1, coarse.shape[2], coarse.shape[3])
        pooled = F.adaptive_avg_pool2d(torch.cat([coarse, m_coarse], dim=1), 1).view(b, n, -1).mean(dim=1)
        return torch.cat(counts, dim=1), self.measure_head(pooled)


def load_model():
    ckpt = torch.load(CHECKPOINT, map_location="cpu", weights_only=False)
    model = TiledCounter(BACKBONE)
    model.load_state_dict(ckpt["model"])
    model.eval()
    mean, std = [np.asarray(v, dtype=np.float32).reshape(-1).tolist() for v in ckpt["m_stats"]]
    with open(NORM_OUT, "w") as f:
        json.dump(dict(mean=mean, std=std), f)
    return model, mean, std


def count_params(module):
    return int(sum(p.numel() for p in module.parameters()))


def graph_params(path):
    import onnx
    graph = onnx.load(path)
    onnx.checker.check_model(graph)
    return int(sum(int(np.prod(t.dims)) for t in graph.graph.initializer))


def write_report(source, backbone, exported):
    with open(REPORT, "w") as f:
        json.dump(dict(source_params=source, backbone_params=backbone, exported_params=exported, opset=OPSET), f)
"#;

// Static shapes: no dynamic_axes. The tracer exporter (dynamo=False) is
// required; the dynamo exporter drops the backbone for this model.
const EXPORT_MAIN_PY: &str = r#"

class ExportWrapper(nn.Module):
    def __init__(self, model):
        super().__init__()
        self.m = model

    def forward(self, tiles, meta):
        return self.m(tiles.unsqueeze(0), meta)


def main():
    model, _, _ = load_model()
    wrapper = ExportWrapper(model).eval()
    tiles = torch.randn(N_TILES, 3, TILE, TILE)
    meta = torch.zeros(1, 3)
    meta[0, 0] = 1.0
    with torch.no_grad():
        torch.onnx.export(
            wrapper,
            (tiles, meta),
            OUT,
            input_names=["tiles", "meta"],
            output_names=["counts", "measures"],
            opset_version=OPSET,
            do_constant_folding=True,
            dynamo=False,
        )
    exported = graph_params(OUT)
    write_report(count_params(model), count_params(model.backbone), exported)
    print("exported %d parameters to %s" % (exported, OUT))


if __name__ == "__main__":
    main()
"#;

const EAGER_MAIN_PY: &str = r#"

class BackboneOnly(nn.Module):
    def __init__(self, backbone):
        super().__init__()
        self.b = backbone

    def forward(self, x):
        return tuple(self.b(x))


def main():
    from safetensors.torch import save_file

    model, mean, std = load_model()
    heads = dict(
        (k, v.detach().float().contiguous())
        for k, v in model.state_dict().items()
        if not k.startswith("backbone.")
    )
    heads["m_stats.mean"] = torch.tensor(mean, dtype=torch.float32)
    heads["m_stats.std"] = torch.tensor(std, dtype=torch.float32)
    save_file(heads, HEADS_OUT)

    names = ["stage%d" % i for i in range(len(model.backbone.feature_info.channels()))]
    axes = dict((n, {0: "tiles"}) for n in names + ["tiles"])
    with torch.no_grad():
        torch.onnx.export(
            BackboneOnly(model.backbone).eval(),
            (torch.randn(1, 3, TILE, TILE),),
            BACKBONE_OUT,
            input_names=["tiles"],
            output_names=names,
            dynamic_axes=axes,
            opset_version=OPSET,
            do_constant_folding=True,
            dynamo=False,
        )
    backbone = count_params(model.backbone)
    write_report(backbone, backbone, graph_params(BACKBONE_OUT))
    print("wrote %d head tensors and a %d-stage backbone" % (len(heads), len(names)))


if __name__ == "__main__":
    main()
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pipeline(dir: &Path) -> ExportPipeline {
        ExportPipeline::new(ExportConfig {
            output_dir: dir.join("out"),
            checkpoint: dir.join("ckpt.pth"),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn export_script_is_static_and_traced() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        let script = p.generate_export_script(Path::new("/tmp/a.onnx"), Path::new("/tmp/a.json"));
        assert!(script.contains("TILE = 224"));
        assert!(script.contains("N_TILES = 48"));
        assert!(script.contains("OPSET = 14"));
        assert!(script.contains("dynamo=False"));
        assert!(script.contains("OUT = \"/tmp/a.onnx\""));
        let main = &script[script.find("class ExportWrapper").unwrap()..];
        assert!(!main.contains("dynamic_axes"));
        assert!(dir.path().join("out").is_dir());
    }

    #[test]
    fn eager_script_keeps_batch_dynamic() {
        let dir = tempdir().unwrap();
        let p = pipeline(dir.path());
        let script = p.generate_eager_script(Path::new("h.safetensors"), Path::new("b.onnx"), Path::new("r.json"));
        assert!(script.contains("HEADS_OUT = \"h.safetensors\""));
        assert!(script.contains("dynamic_axes=axes"));
        assert!(script.contains("m_stats.mean"));
    }

    #[test]
    fn python_literals_are_quoted() {
        assert_eq!(py_str("a\"b"), r#""a\"b""#);
        assert_eq!(py_str(Path::new("/x y/z")), "\"/x y/z\"");
    }

    #[test]
    fn signature_check() {
        let good = GraphSignature {
            inputs: vec![("tiles".into(), vec![48, 3, 224, 224]), ("meta".into(), vec![1, 3])],
            outputs: vec![("counts".into(), vec![1, 9]), ("measures".into(), vec![1, 6])],
        };
        good.check(48, 224).unwrap();
        assert!(good.check(40, 224).is_err());

        let dynamic = GraphSignature {
            inputs: vec![("tiles".into(), vec![-1, 3, 224, 224]), ("meta".into(), vec![1, 3])],
            ..good.clone()
        };
        assert!(dynamic.check(48, 224).is_err());

        let renamed = GraphSignature { outputs: vec![("output".into(), vec![1, 9])], ..good };
        assert!(matches!(renamed.check(48, 224), Err(ModelError::ShapeMismatch(_))));
    }

    #[tokio::test]
    async fn failing_script_surfaces_stderr() {
        let err = run_python("sh", "echo boom >&2; exit 3", "probe").await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn missing_interpreter_is_an_error() {
        assert!(run_python("/nonexistent/python3", "", "probe").await.is_err());
    }
}
