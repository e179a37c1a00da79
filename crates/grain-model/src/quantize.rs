//! Weight-only INT8 quantization using ONNX Runtime's Python tooling.
//!
//! Dynamic quantization needs no calibration data: weights are stored as
//! INT8 and activations are quantized on the fly at inference time.

use crate::export::{inspect_graph, py_str, run_python, ExportConfig, GraphSignature};
use crate::integrity::GraphReport;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub struct ModelQuantizer<'a> {
    config: &'a ExportConfig,
}

impl<'a> ModelQuantizer<'a> {
    pub fn new(config: &'a ExportConfig) -> Self {
        Self { config }
    }

    /// Quantizes `input_model` into `output_dir/output_name`. Returns the
    /// new graph and its parameter report; `source_params` is carried into
    /// the report for the integrity check.
    pub async fn quantize_dynamic(
        &self,
        input_model: &Path,
        output_name: &str,
        source_params: u64,
    ) -> Result<(PathBuf, GraphReport)> {
        let output_path = self.config.output_dir.join(output_name);
        let report_path = output_path.with_extension("report.json");
        log::info!("dynamic INT8 quantization {:?} -> {:?}", input_model, output_path);

        let script = self.generate_quantization_script(input_model, &output_path, &report_path, source_params);
        run_python(&self.config.python, &script, "quantization").await?;

        let report = GraphReport::from_json_file(&report_path)
            .with_context(|| format!("Failed to read quantization report {report_path:?}"))?;
        Ok((output_path, report))
    }

    fn generate_quantization_script(
        &self,
        input_model: &Path,
        output_model: &Path,
        report: &Path,
        source_params: u64,
    ) -> String {
        format!(
            r#"#!/usr/bin/env python3
import json
import numpy as np
import onnx
from onnxruntime.quantization import QuantType, quantize_dynamic


def main():
    quantize_dynamic({input_path}, {output_path}, weight_type=QuantType.QInt8)
    graph = onnx.load({output_path})
    onnx.checker.check_model(graph)
    exported = int(sum(int(np.prod(t.dims)) for t in graph.graph.initializer))
    with open({report_path}, "w") as f:
        json.dump(dict(source_params={source_params}, exported_params=exported, opset={opset}), f)
    print("quantized %d parameters" % exported)


if __name__ == "__main__":
    main()
"#,
            input_path = py_str(input_model),
            output_path = py_str(output_model),
            report_path = py_str(report),
            source_params = source_params,
            opset = self.config.opset,
        )
    }

    /// Loads the quantized graph and returns its signature.
    pub fn validate_quantized_model(&self, model_path: &Path) -> Result<GraphSignature> {
        let signature = inspect_graph(model_path)
            .with_context(|| format!("Quantized model {model_path:?} failed to load"))?;
        log::info!("quantized model loads: {} inputs, {} outputs", signature.inputs.len(), signature.outputs.len());
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn script_uses_weight_only_int8() {
        let dir = tempdir().unwrap();
        let config = ExportConfig { output_dir: dir.path().to_path_buf(), ..Default::default() };
        let q = ModelQuantizer::new(&config);
        let script = q.generate_quantization_script(
            Path::new("/m/fp32.onnx"),
            Path::new("/m/int8.onnx"),
            Path::new("/m/int8.report.json"),
            50_000_000,
        );
        assert!(script.contains(r#"quantize_dynamic("/m/fp32.onnx", "/m/int8.onnx", weight_type=QuantType.QInt8)"#));
        assert!(script.contains("source_params=50000000"));
        assert!(!script.contains("calibration"));
    }

    #[tokio::test]
    async fn failed_quantization_is_reported() {
        let dir = tempdir().unwrap();
        let config = ExportConfig {
            output_dir: dir.path().to_path_buf(),
            python: "false".to_string(),
            ..Default::default()
        };
        let q = ModelQuantizer::new(&config);
        assert!(q.quantize_dynamic(&dir.path().join("in.onnx"), "out.onnx", 1).await.is_err());
    }
}
