use grain_infer::{EagerEstimator, InferError, OnnxEstimator, Pipeline, Stage};
use grain_model::{CountCategory, GrainType, ModelArtifact, ModelConfig, NormStats, PoolingBackbone, TiledCounter};
use grain_preprocess::GridLayout;
use grain_source::{ImageSource, ResultsSink};
use image::{Rgb, RgbImage};
use std::path::Path;

fn config() -> ModelConfig {
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

fn eager(config: &ModelConfig, heads: &Path) -> anyhow::Result<EagerEstimator<PoolingBackbone>> {
    let backbone = PoolingBackbone::tiny();
    let (fine, coarse) = backbone.fused_channels();
    ModelArtifact::random(config, fine, coarse, 99).save(heads)?;
    let artifact = ModelArtifact::load(heads)?;
    Ok(EagerEstimator::new(TiledCounter::new(config.clone(), &artifact, backbone)?))
}

fn speckled(w: u32, h: u32, seed: u8) -> RgbImage {
    RgbImage::from_fn(w, h, |x, y| {
        let v = ((x * 7 + y * 13) as u8).wrapping_mul(seed | 1);
        Rgb([v, v.wrapping_add(40), 255 - v])
    })
}

#[test]
fn batch_writes_good_rows_and_skips_bad_ones() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let images = dir.path().join("images");
    std::fs::create_dir(&images)?;
    speckled(200, 150, 3).save(images.join("a.png"))?;
    speckled(128, 128, 5).save(images.join("b.png"))?;
    speckled(333, 257, 9).save(images.join("d.png"))?;
    std::fs::write(images.join("c.png"), b"definitely not a png")?;
    std::fs::write(
        dir.path().join("test.csv"),
        "ID,Comment\na,White\nb,Paddy\nc,Brown\nmissing,White\nd,Basmati\n",
    )?;

    let config = config();
    let estimator = eager(&config, &dir.path().join("heads.safetensors"))?;
    let mut pipeline = Pipeline::new(&config, GridLayout::CropThenResize, estimator, NormStats::default())?;

    let source = ImageSource::open(dir.path().join("test.csv"), &images)?;
    let out = dir.path().join("submission.csv");
    let mut sink = ResultsSink::create(&out, &CountCategory::columns(), &grain_model::MeasureKind::columns())?;
    let summary = pipeline.run_batch(&source, &mut sink)?;
    sink.finish()?;

    assert_eq!(summary.written, 3);
    let skipped: Vec<_> = summary.skipped.iter().map(|s| (s.id.as_str(), s.stage)).collect();
    assert_eq!(skipped, vec![("c", Stage::Load), ("missing", Stage::Load)]);

    let mut reader = csv::Reader::from_path(&out)?;
    let header: Vec<String> = reader.headers()?.iter().map(String::from).collect();
    assert_eq!(header.len(), 16);
    assert_eq!(header[0], "ID");
    assert_eq!(header[1], "Count");
    assert_eq!(header[15], "Average_b");

    let rows: Vec<csv::StringRecord> = reader.records().collect::<Result<_, _>>()?;
    let ids: Vec<&str> = rows.iter().map(|r| &r[0]).collect();
    assert_eq!(ids, vec!["a", "b", "d"]);
    // b and d (unknown label) are treated as paddy
    for row in &rows[1..] {
        for col in ["Medium_Count", "Chalky_Count", "Yellow_Count", "Green_Count"] {
            let idx = header.iter().position(|h| h == col).unwrap();
            assert_eq!(&row[idx], "0", "{col} in {}", &row[0]);
        }
    }
    for row in &rows {
        for i in 1..10 {
            row[i].parse::<u32>()?;
        }
        for i in 10..16 {
            assert!(row[i].parse::<f32>()?.is_finite());
        }
    }
    Ok(())
}

#[test]
fn both_layouts_give_the_configured_tile_count() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config();
    for layout in [GridLayout::CropThenResize, GridLayout::ResizeThenSplit] {
        let estimator = eager(&config, &dir.path().join("heads.safetensors"))?.fixed();
        let mut pipeline = Pipeline::new(&config, layout, estimator, NormStats::default())?;
        let image = speckled(301, 199, 7);
        assert_eq!(pipeline.tiles(&image)?.dim(), (4, 3, 64, 64));
        let sample = grain_source::GrainSample { id: "x".into(), label: "Brown".into(), image };
        let p = pipeline.process(&sample)?;
        assert_eq!(p.count(CountCategory::Green), 0);
    }
    Ok(())
}

#[test]
fn tiny_image_is_a_tile_stage_failure() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config();
    let estimator = eager(&config, &dir.path().join("heads.safetensors"))?;
    let mut pipeline = Pipeline::new(&config, GridLayout::CropThenResize, estimator, NormStats::default())?;
    let sample = grain_source::GrainSample { id: "speck".into(), label: "White".into(), image: RgbImage::new(1, 1) };
    match pipeline.process_as(&sample, GrainType::White) {
        Err(InferError::Sample { stage: Stage::Tile, .. }) => Ok(()),
        other => anyhow::bail!("expected a tile-stage failure, got {other:?}"),
    }
}

#[test]
fn exported_graph_smoke() -> anyhow::Result<()> {
    // Needs a real export; skipped unless GRAIN_ONNX_MODEL points at one.
    let Ok(model) = std::env::var("GRAIN_ONNX_MODEL") else {
        return Ok(());
    };
    let config = ModelConfig::mobile();
    let mut onnx = OnnxEstimator::load(&model, &config)?;
    let tiles = grain_infer::bench::synthetic_tiles(config.tile_count(), config.tile_size as usize, 0);
    let raw = grain_infer::Estimator::estimate(&mut onnx, tiles.view(), GrainType::White)?;
    assert!(raw.counts.iter().all(|v| v.is_finite()));
    Ok(())
}

/// Announces nothing, so a width mismatch only shows up at run time.
struct Unannounced(PoolingBackbone);

impl grain_model::FeatureBackbone for Unannounced {
    fn channels(&self) -> Option<Vec<usize>> {
        None
    }

    fn extract(&mut self, tiles: ndarray::ArrayView4<f32>) -> grain_model::Result<Vec<ndarray::Array4<f32>>> {
        grain_model::FeatureBackbone::extract(&mut self.0, tiles)
    }
}

#[test]
fn backbone_width_mismatch_aborts_the_batch() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    for id in ["a", "b", "c"] {
        speckled(160, 120, 1).save(dir.path().join(format!("{id}.png")))?;
    }
    std::fs::write(dir.path().join("test.csv"), "ID,Comment\na,White\nb,Paddy\nc,Brown\n")?;

    let config = config();
    let artifact = ModelArtifact::random(&config, 7, 13, 3);
    let net = TiledCounter::new(config.clone(), &artifact, Unannounced(PoolingBackbone::tiny()))?;
    let mut pipeline = Pipeline::new(&config, GridLayout::CropThenResize, EagerEstimator::new(net), NormStats::default())?;

    let source = ImageSource::open(dir.path().join("test.csv"), dir.path())?;
    let mut sink = ResultsSink::new(Vec::new(), &CountCategory::columns(), &grain_model::MeasureKind::columns())?;
    let err = pipeline.run_batch(&source, &mut sink).unwrap_err();
    assert!(!err.is_per_sample(), "{err}");
    assert!(matches!(err, InferError::Sample { ref id, stage: Stage::BackboneForward, .. } if id == "a"));
    assert_eq!(sink.rows(), 0);
    Ok(())
}
