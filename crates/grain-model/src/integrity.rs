//! Plausibility checks on exported graphs.
//!
//! A graph that silently lost its backbone still loads and runs, so size
//! and parameter count are checked against the source model instead.

use crate::{ModelError, Result};
use serde::{Deserialize, Serialize};

/// Written by the export / quantization scripts next to each graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphReport {
    /// Parameters of the in-memory source model.
    pub source_params: u64,
    /// Of which belong to the backbone.
    #[serde(default)]
    pub backbone_params: u64,
    /// Elements across all initializers of the written graph.
    pub exported_params: u64,
    #[serde(default)]
    pub opset: u32,
}

impl GraphReport {
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    Fp32,
    Int8,
}

impl Precision {
    /// Storage per quantizable weight.
    pub fn bytes_per_param(self) -> u64 {
        match self {
            Precision::Fp32 => 4,
            Precision::Int8 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegrityBounds {
    /// Exported params must be within `[min, max] × source`.
    pub min_param_ratio: f64,
    pub max_param_ratio: f64,
    /// File must hold at least this fraction of `params × bytes_per_param`.
    pub min_size_ratio: f64,
    /// Upper slack over a full-precision file.
    pub max_size_ratio: f64,
    /// Sources at or above this size also get the absolute floors below.
    pub large_source_params: u64,
    pub min_params: u64,
    /// Absolute FP32 floor; scaled by precision for quantized graphs.
    pub min_file_bytes: u64,
}

impl Default for IntegrityBounds {
    fn default() -> Self {
        Self {
            min_param_ratio: 0.9,
            max_param_ratio: 1.1,
            min_size_ratio: 0.8,
            max_size_ratio: 1.25,
            large_source_params: 10_000_000,
            min_params: 10_000_000,
            min_file_bytes: 50_000_000,
        }
    }
}

/// What a passing check measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub precision: Precision,
    pub params: u64,
    pub file_bytes: u64,
    pub min_file_bytes: u64,
    pub max_file_bytes: u64,
}

impl std::fmt::Display for IntegrityReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}: {} params, {:.1} MB (allowed {:.1}..{:.1} MB)",
            self.precision,
            self.params,
            self.file_bytes as f64 / 1e6,
            self.min_file_bytes as f64 / 1e6,
            self.max_file_bytes as f64 / 1e6,
        )
    }
}

/// Fails with [`ModelError::ExportIntegrity`] when the graph is
/// implausibly small or large for its source model.
pub fn verify(
    report: &GraphReport,
    file_bytes: u64,
    precision: Precision,
    bounds: &IntegrityBounds,
) -> Result<IntegrityReport> {
    let source = report.source_params as f64;
    let params = report.exported_params;
    let large = report.source_params >= bounds.large_source_params;

    let min_params = (source * bounds.min_param_ratio).ceil() as u64;
    let min_params = if large { min_params.max(bounds.min_params) } else { min_params };
    let max_params = (source * bounds.max_param_ratio).floor() as u64;
    if params < min_params || params > max_params {
        return Err(ModelError::ExportIntegrity(format!(
            "{precision:?} graph has {params} parameters, source has {} (allowed {min_params}..={max_params})",
            report.source_params
        )));
    }

    let bpp = precision.bytes_per_param();
    let mut min_file = (params as f64 * bpp as f64 * bounds.min_size_ratio) as u64;
    if large {
        min_file = min_file.max(bounds.min_file_bytes * bpp / Precision::Fp32.bytes_per_param());
    }
    // protobuf framing dominates tiny graphs
    let max_file = (params as f64 * Precision::Fp32.bytes_per_param() as f64 * bounds.max_size_ratio) as u64 + (1 << 20);
    if file_bytes == 0 || file_bytes < min_file || file_bytes > max_file {
        return Err(ModelError::ExportIntegrity(format!(
            "{precision:?} graph is {file_bytes} bytes, expected {min_file}..={max_file} for {params} parameters"
        )));
    }

    log::info!(
        "{precision:?} graph ok: {:.1}M params, {:.1} MB",
        params as f64 / 1e6,
        file_bytes as f64 / 1e6
    );
    Ok(IntegrityReport { precision, params, file_bytes, min_file_bytes: min_file, max_file_bytes: max_file })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(source: u64, exported: u64) -> GraphReport {
        GraphReport { source_params: source, backbone_params: source, exported_params: exported, opset: 14 }
    }

    #[test]
    fn collapsed_backbone_is_rejected() {
        let b = IntegrityBounds::default();
        let err = verify(&report(150_000_000, 9_000_000), 36_000_000, Precision::Fp32, &b).unwrap_err();
        assert!(matches!(err, ModelError::ExportIntegrity(_)));
    }

    #[test]
    fn small_file_is_rejected_even_with_plausible_params() {
        let b = IntegrityBounds::default();
        let err = verify(&report(150_000_000, 150_000_000), 40_000_000, Precision::Fp32, &b).unwrap_err();
        assert!(matches!(err, ModelError::ExportIntegrity(_)));
    }

    #[test]
    fn full_graph_passes() {
        let b = IntegrityBounds::default();
        let ok = verify(&report(50_200_000, 50_150_000), 201_000_000, Precision::Fp32, &b).unwrap();
        assert_eq!(ok.params, 50_150_000);
    }

    #[test]
    fn int8_uses_one_byte_per_param() {
        let b = IntegrityBounds::default();
        let r = report(50_200_000, 50_200_000);
        assert!(verify(&r, 52_000_000, Precision::Int8, &b).is_ok());
        assert!(verify(&r, 52_000_000, Precision::Fp32, &b).is_err());
        assert!(verify(&r, 30_000_000, Precision::Int8, &b).is_err());
    }

    #[test]
    fn oversized_graph_is_rejected() {
        let b = IntegrityBounds::default();
        assert!(verify(&report(1_000_000, 1_500_000), 6_000_000, Precision::Fp32, &b).is_err());
        assert!(verify(&report(1_000_000, 1_000_000), 9_000_000, Precision::Fp32, &b).is_err());
    }

    #[test]
    fn small_sources_skip_absolute_floors() {
        let b = IntegrityBounds::default();
        assert!(verify(&report(200_000, 200_000), 820_000, Precision::Fp32, &b).is_ok());
        assert!(verify(&report(200_000, 200_000), 0, Precision::Fp32, &b).is_err());
    }
}
