use anyhow::{bail, Context, Result};
use clap::Parser;
use grain_infer::bench::{self, BenchCase, BenchConfig};
use grain_infer::{EagerEstimator, OnnxEstimator, PostProcessor};
use grain_model::{ExportConfig, ExportPipeline, GrainType, ModelConfig, NormStats};
use grain_preprocess::{GridLayout, TileGrid, TileTransform};
use std::path::PathBuf;

/// Exports a trained checkpoint to ONNX (FP32 and INT8), then benchmarks the
/// exported graphs against the eager network.
#[derive(Parser, Debug)]
#[command(version, about)]
struct CliArgs {
    #[arg(long, default_value = "./models/base/best_model.pth")]
    checkpoint: PathBuf,

    #[arg(long, default_value = "./models")]
    output_dir: PathBuf,

    /// timm backbone name the checkpoint was trained with
    #[arg(long, default_value = "convnext_small.fb_in22k_ft_in1k_384")]
    backbone: String,

    /// Model configuration JSON; the mobile 224px profile when absent
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 14)]
    opset: u32,

    #[arg(long)]
    no_quantize: bool,

    #[arg(long, default_value = "python3")]
    python: String,

    /// Also write safetensors heads plus a backbone graph and compare them
    #[arg(long)]
    eager: bool,

    /// Benchmark on this photograph instead of synthetic tiles
    #[arg(long)]
    sample: Option<PathBuf>,

    #[arg(long, default_value_t = 5)]
    runs: usize,

    #[arg(long, default_value_t = 1)]
    tolerance: u32,

    #[arg(long)]
    skip_bench: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = CliArgs::parse();

    let model = match &args.config {
        Some(path) => ModelConfig::from_json_file(path)?,
        None => ModelConfig::mobile(),
    };
    let config = ExportConfig {
        output_dir: args.output_dir.clone(),
        checkpoint: args.checkpoint.clone(),
        backbone: args.backbone.clone(),
        model: model.clone(),
        opset: args.opset,
        quantize: !args.no_quantize,
        python: args.python.clone(),
        ..ExportConfig::default()
    };
    let pipeline = ExportPipeline::new(config)?;

    let exported = pipeline.export().await.context("export failed")?;
    println!("FP32: {} ({})", exported.fp32_model.display(), exported.fp32_integrity);
    if let (Some(path), Some(integrity)) = (&exported.int8_model, &exported.int8_integrity) {
        println!("INT8: {} ({})", path.display(), integrity);
    }
    println!("graph: {}", serde_json::to_string(&exported.report)?);

    let eager = if args.eager {
        let artifacts = pipeline.prepare_eager_artifact().await.context("eager artifact failed")?;
        println!("eager heads: {}", artifacts.heads.display());
        Some(EagerEstimator::from_files(model.clone(), &artifacts.heads, &artifacts.backbone)?.fixed())
    } else {
        None
    };

    if args.skip_bench {
        return Ok(());
    }

    let tiles = match &args.sample {
        Some(path) => {
            let image = image_rgb(path)?;
            let grid = TileGrid::new(model.grid_rows, model.grid_cols)?;
            TileTransform::new(model.tile_size)?
                .with_layout(GridLayout::ResizeThenSplit)
                .run(&image, &grid)?
        }
        None => bench::synthetic_tiles(model.tile_count(), model.tile_size as usize, 0),
    };
    let post = PostProcessor::new(&model, NormStats::from_json_file(&exported.normalization)?);

    let mut fp32 = OnnxEstimator::load(&exported.fp32_model, &model)?.with_label("onnx-fp32");
    let mut int8 = match &exported.int8_model {
        Some(path) => Some(OnnxEstimator::load(path, &model)?.with_label("onnx-int8")),
        None => None,
    };
    let mut eager = eager;

    let mut cases = Vec::new();
    if let Some(e) = eager.as_mut() {
        cases.push(BenchCase { estimator: e, timed: true });
    }
    cases.push(BenchCase { estimator: &mut fp32, timed: true });
    if let Some(q) = int8.as_mut() {
        cases.push(BenchCase { estimator: q, timed: true });
    }

    let bench_config = BenchConfig { runs: args.runs, parity_tolerance: args.tolerance, ..BenchConfig::default() };
    let report = bench::run(&mut cases, tiles.view(), GrainType::Paddy, &post, &bench_config)?;
    println!("{report}");

    if !report.parity_ok() {
        bail!("exported graphs disagree with the reference beyond ±{}", args.tolerance);
    }
    Ok(())
}

fn image_rgb(path: &std::path::Path) -> Result<image::RgbImage> {
    Ok(image::open(path).with_context(|| format!("reading {}", path.display()))?.to_rgb8())
}
