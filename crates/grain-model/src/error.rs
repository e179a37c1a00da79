use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Part of the tiled forward pass an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardStage {
    Backbone,
    DecodeCounts,
    Aggregate,
    PoolMeasure,
}

impl fmt::Display for ForwardStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ForwardStage::Backbone => "backbone",
            ForwardStage::DecodeCounts => "count decoders",
            ForwardStage::Aggregate => "aggregation",
            ForwardStage::PoolMeasure => "measurement head",
        })
    }
}

/// Errors raised while loading weights or running the network.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("artifact {path:?} is missing tensor `{key}`")]
    MissingKey { path: PathBuf, key: String },

    #[error("artifact tensor `{key}`: {reason}")]
    BadTensor { key: String, reason: String },

    #[error("failed to read artifact {path:?}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("safetensors: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Backbone stage widths disagree with the widths the heads were built for.
    #[error("backbone does not match the heads: {0}")]
    BackboneMismatch(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{stage}: {source}")]
    Forward {
        stage: ForwardStage,
        #[source]
        source: Box<ModelError>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("export integrity check failed: {0}")]
    ExportIntegrity(String),

    #[error("onnxruntime: {0}")]
    Ort(#[from] ort::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ModelError {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        ModelError::ShapeMismatch(msg.into())
    }

    pub(crate) fn at(stage: ForwardStage) -> impl FnOnce(ModelError) -> ModelError {
        move |source| match source {
            already @ ModelError::Forward { .. } => already,
            source => ModelError::Forward { stage, source: Box::new(source) },
        }
    }

    /// The forward stage that raised this error, if it came from one.
    pub fn forward_stage(&self) -> Option<ForwardStage> {
        match self {
            ModelError::Forward { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Errors that mean the weights, backbone or configuration are wrong,
    /// so every further input would fail the same way.
    pub fn is_fatal(&self) -> bool {
        match self {
            ModelError::Forward { source, .. } => source.is_fatal(),
            ModelError::MissingKey { .. }
            | ModelError::BadTensor { .. }
            | ModelError::Artifact { .. }
            | ModelError::Safetensors(_)
            | ModelError::BackboneMismatch(_)
            | ModelError::Config(_)
            | ModelError::ExportIntegrity(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
