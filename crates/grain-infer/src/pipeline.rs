//! Per-image orchestration and the batch loop.

use crate::postprocess::{PostProcessor, Prediction};
use crate::{Estimator, InferError, Result};
use grain_model::{ForwardStage, GrainType, ModelConfig, NormStats};
use grain_preprocess::{GridLayout, TileGrid, TileTransform};
use grain_source::{GrainSample, ImageSource, ResultsSink};
use std::fmt;
use std::io::Write;

/// Where a sample was when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Tile,
    Transform,
    BackboneForward,
    DecodeCounts,
    Aggregate,
    PoolMeasure,
    Denormalize,
    Emit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Load => "LOAD",
            Stage::Tile => "TILE",
            Stage::Transform => "TRANSFORM",
            Stage::BackboneForward => "BACKBONE_FORWARD",
            Stage::DecodeCounts => "DECODE_COUNTS",
            Stage::Aggregate => "AGGREGATE",
            Stage::PoolMeasure => "POOL_MEASURE",
            Stage::Denormalize => "DENORMALIZE",
            Stage::Emit => "EMIT",
        })
    }
}

impl Stage {
    /// Where inside the estimator an error was raised. Errors that do not
    /// name a forward stage are charged to the backbone pass.
    pub fn of_estimate(err: &InferError) -> Stage {
        let stage = match err {
            InferError::Model(e) => e.forward_stage(),
            _ => None,
        };
        match stage {
            Some(ForwardStage::DecodeCounts) => Stage::DecodeCounts,
            Some(ForwardStage::Aggregate) => Stage::Aggregate,
            Some(ForwardStage::PoolMeasure) => Stage::PoolMeasure,
            Some(ForwardStage::Backbone) | None => Stage::BackboneForward,
        }
    }
}

/// A row that was not written.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedSample {
    pub id: String,
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub written: usize,
    pub skipped: Vec<SkippedSample>,
}

pub struct Pipeline<E> {
    grid: TileGrid,
    transform: TileTransform,
    estimator: E,
    post: PostProcessor,
}

impl<E: Estimator> Pipeline<E> {
    pub fn new(config: &ModelConfig, layout: GridLayout, estimator: E, norm: NormStats) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            grid: TileGrid::new(config.grid_rows, config.grid_cols)?,
            transform: TileTransform::new(config.tile_size)?.with_layout(layout),
            estimator,
            post: PostProcessor::new(config, norm),
        })
    }

    pub fn estimator_mut(&mut self) -> &mut E {
        &mut self.estimator
    }

    pub fn post_processor(&self) -> &PostProcessor {
        &self.post
    }

    /// Tiles and normalizes an image: `(N, 3, S, S)`.
    pub fn tiles(&self, image: &image::RgbImage) -> Result<ndarray::Array4<f32>> {
        self.staged_tiles(image).map_err(|(_, e)| e)
    }

    fn staged_tiles(&self, image: &image::RgbImage) -> std::result::Result<ndarray::Array4<f32>, (Stage, InferError)> {
        self.grid
            .rects(image.height(), image.width())
            .map_err(|e| (Stage::Tile, e.into()))?;
        self.transform.run(image, &self.grid).map_err(|e| (Stage::Transform, e.into()))
    }

    /// Runs every stage for one decoded sample. The grain type comes from
    /// the sample label, falling back to Paddy.
    pub fn process(&mut self, sample: &GrainSample) -> Result<Prediction> {
        let grain = GrainType::from_label(&sample.label);
        self.process_as(sample, grain)
    }

    pub fn process_as(&mut self, sample: &GrainSample, grain: GrainType) -> Result<Prediction> {
        let wrap = |stage: Stage, source: InferError| InferError::Sample {
            id: sample.id.clone(),
            stage,
            source: Box::new(source),
        };

        let tiles = self.staged_tiles(&sample.image).map_err(|(stage, e)| wrap(stage, e))?;
        log::debug!("{}: {} tiles {:?}", sample.id, tiles.dim().0, tiles.dim());

        // the estimator covers BACKBONE_FORWARD through POOL_MEASURE
        let raw = self
            .estimator
            .estimate(tiles.view(), grain)
            .map_err(|e| wrap(Stage::of_estimate(&e), e))?;
        log::debug!("{}: raw counts {:?}", sample.id, raw.counts);

        let prediction = self.post.apply(&raw, grain).map_err(|e| wrap(Stage::Denormalize, e))?;
        log::debug!("{}: {grain} -> {:?}", sample.id, prediction.counts);
        Ok(prediction)
    }

    /// Processes every manifest row in order. A sample that fails to decode
    /// or run is logged and skipped; sink failures abort the batch.
    pub fn run_batch<W: Write>(&mut self, source: &ImageSource, sink: &mut ResultsSink<W>) -> Result<BatchSummary> {
        self.run_batch_with(source, sink, |_, _, _| {})
    }

    /// [`run_batch`](Self::run_batch), calling `on_row` for every written row.
    pub fn run_batch_with<W, F>(
        &mut self,
        source: &ImageSource,
        sink: &mut ResultsSink<W>,
        mut on_row: F,
    ) -> Result<BatchSummary>
    where
        W: Write,
        F: FnMut(&str, GrainType, &Prediction),
    {
        let mut summary = BatchSummary::default();
        for (i, entry) in source.entries().iter().enumerate() {
            let grain = GrainType::from_label(&entry.label);
            let outcome = source
                .load(entry)
                .map_err(|e| InferError::Sample { id: entry.id.clone(), stage: Stage::Load, source: Box::new(e.into()) })
                .and_then(|sample| self.process_as(&sample, grain));

            match outcome {
                Ok(prediction) => {
                    sink.write(&prediction.to_row(&entry.id))?;
                    on_row(&entry.id, grain, &prediction);
                    summary.written += 1;
                }
                Err(err) if err.is_per_sample() => {
                    log::warn!("skipping {}: {err}", entry.id);
                    let stage = match &err {
                        InferError::Sample { stage, .. } => *stage,
                        _ => Stage::Emit,
                    };
                    summary.skipped.push(SkippedSample { id: entry.id.clone(), stage, reason: err.to_string() });
                }
                Err(err) => return Err(err),
            }
            if (i + 1) % 50 == 0 {
                log::info!("{}/{} samples processed", i + 1, source.len());
            }
        }
        log::info!("batch done: {} written, {} skipped", summary.written, summary.skipped.len());
        Ok(summary)
    }
}
