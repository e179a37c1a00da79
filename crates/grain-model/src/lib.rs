//! # grain-model
//!
//! The tiled multi-task grain counting network and the tooling around it.
//!
//! A sample image is cut into a grid of tiles; a shared backbone turns each
//! tile into a feature pyramid; nine scale-fusion decoders predict density
//! maps whose integrals are the per-category grain counts, and a small MLP
//! regresses six size/colour measurements from tile-averaged features.
//!
//! ## Features
//!
//! - Native head inference on `ndarray` from a safetensors artifact
//! - Pluggable backbones ([`FeatureBackbone`]): ONNX graph or a parameter-free pyramid
//! - Flexible (`forward`) and fixed-shape (`forward_fixed`) entry points
//! - Static-shape ONNX export and dynamic INT8 quantization with integrity checks

pub mod aggregate;
pub mod artifact;
pub mod backbone;
pub mod category;
pub mod config;
pub mod decoder;
mod error;
pub mod export;
pub mod integrity;
pub mod measure;
pub mod meta;
pub mod network;
pub mod ops;
pub mod quantize;

pub use artifact::{ModelArtifact, NormStats};
pub use backbone::{FeatureBackbone, OnnxBackbone, PoolingBackbone};
pub use category::{CountCategory, GrainType, MeasureKind};
pub use config::ModelConfig;
pub use error::{ForwardStage, ModelError, Result};
pub use export::{ExportConfig, ExportPipeline, ExportResult};
pub use integrity::{IntegrityBounds, Precision};
pub use network::{NetworkOutput, TiledCounter};
