use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use grain_infer::{EagerEstimator, Estimator, OnnxEstimator, Pipeline, QualityReport};
use grain_model::{CountCategory, MeasureKind, ModelArtifact, ModelConfig, NormStats, OnnxBackbone, TiledCounter};
use grain_preprocess::GridLayout;
use grain_source::{ImageSource, ResultsSink};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Layout {
    /// crop the grid from the original image, then resize each tile
    Crop,
    /// resize the whole image, then cut exact tiles
    Split,
}

impl From<Layout> for GridLayout {
    fn from(layout: Layout) -> Self {
        match layout {
            Layout::Crop => GridLayout::CropThenResize,
            Layout::Split => GridLayout::ResizeThenSplit,
        }
    }
}

/// Runs grain counting over a manifest of photographs and writes the results CSV.
#[derive(Parser, Debug)]
#[command(version, about)]
struct CliArgs {
    /// CSV manifest with `ID` and `Comment` columns
    #[arg(long)]
    manifest: PathBuf,

    /// Directory holding `<ID>.<ext>` images
    #[arg(long)]
    images: PathBuf,

    #[arg(long, default_value = "png")]
    extension: String,

    #[arg(long, default_value = "submission.csv")]
    output: PathBuf,

    /// Model configuration JSON (grid, tile size, head widths)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Exported single-image ONNX graph (FP32 or INT8)
    #[arg(long, conflicts_with_all = ["heads", "backbone"])]
    onnx: Option<PathBuf>,

    /// Safetensors head weights for the eager path
    #[arg(long, requires = "backbone")]
    heads: Option<PathBuf>,

    /// ONNX feature-pyramid backbone for the eager path
    #[arg(long, requires = "heads")]
    backbone: Option<PathBuf>,

    /// Measurement normalization JSON; overrides the stats stored with the
    /// heads or exported next to the graph
    #[arg(long)]
    normalization: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Layout::Crop)]
    layout: Layout,

    /// Log a milling-quality grade for every written row
    #[arg(long)]
    grade: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = CliArgs::parse();

    let config = match &args.config {
        Some(path) => ModelConfig::from_json_file(path).with_context(|| format!("loading {}", path.display()))?,
        None if args.onnx.is_some() => ModelConfig::mobile(),
        None => ModelConfig::default(),
    };

    let explicit_norm = match &args.normalization {
        Some(path) => Some(NormStats::from_json_file(path).with_context(|| format!("loading {}", path.display()))?),
        None => None,
    };

    let (estimator, norm): (Box<dyn Estimator>, NormStats) = match (&args.onnx, &args.heads, &args.backbone) {
        (Some(onnx), _, _) => {
            let norm = match explicit_norm {
                Some(norm) => norm,
                None => NormStats::beside_graph(onnx)
                    .with_context(|| format!("no normalization stats for {}", onnx.display()))?,
            };
            (Box::new(OnnxEstimator::load(onnx, &config)?), norm)
        }
        (None, Some(heads), Some(backbone)) => {
            let artifact = ModelArtifact::load(heads)?;
            let norm = match explicit_norm {
                Some(norm) => norm,
                None => artifact.norm_stats()?,
            };
            let net = TiledCounter::new(config.clone(), &artifact, OnnxBackbone::load(backbone)?)?;
            log::info!("eager heads: {} parameters", net.head_param_count());
            (Box::new(EagerEstimator::new(net)), norm)
        }
        _ => bail!("pass either --onnx or both --heads and --backbone"),
    };

    let source = ImageSource::open(&args.manifest, &args.images)?.with_extension(&args.extension);
    log::info!("{} manifest rows, model {}", source.len(), estimator.name());

    let mut pipeline = Pipeline::new(&config, args.layout.into(), estimator, norm)?;
    let mut sink = ResultsSink::create(&args.output, &CountCategory::columns(), &MeasureKind::columns())?;

    let started = Instant::now();
    let grade = args.grade;
    let summary = pipeline.run_batch_with(&source, &mut sink, |id, grain, prediction| {
        if grade {
            log::info!("{id} ({grain}): {}", QualityReport::from_prediction(prediction, grain));
        }
    })?;
    sink.finish()?;

    println!(
        "wrote {} rows to {} in {:.1}s",
        summary.written,
        args.output.display(),
        started.elapsed().as_secs_f64()
    );
    for skipped in &summary.skipped {
        println!("skipped {} at {}: {}", skipped.id, skipped.stage, skipped.reason);
    }
    Ok(())
}
