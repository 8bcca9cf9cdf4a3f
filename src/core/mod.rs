//! Core types for patchserve.
//!
//! This module contains the foundations every other module builds on:
//! - Regions, sizes and multi-band rasters
//! - Source bundles, output specifications and patch batches
//! - Error types and the validation report
//! - Configuration and constant placeholder expressions

pub mod config;
pub mod error;
pub mod expression;
pub mod raster;
pub mod region;
pub mod sink;
pub mod types;

// Re-export commonly used types
pub use config::{OutputConfig, ServeConfig, SourceConfig, TilingConfig};
pub use error::{ConfigError, ExecutionError, ServeError, ServeResult, SourceIndex, Stage};
pub use expression::parse_expression;
pub use raster::{GeoTransform, MemoryRaster, RasterInfo, RasterSource, RegionBuffer, StackedSource};
pub use region::{ImageRegion, Size2D};
pub use sink::{MemorySink, RasterSink};
pub use types::{ConstantPlaceholder, InferenceMode, OutputSpec, PatchBatch, ScalarValue, SourceBundle, SourceSet};
