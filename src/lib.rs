//! # patchserve - Tiled patch-based model serving
//!
//! patchserve applies a trained graph to arbitrarily large rasters. Each
//! source image contributes patches centred on the same geographic
//! location; the graph turns every group of patches into one or more output
//! pixels; the results are reassembled into an output raster. Outputs are
//! produced tile by tile so memory stays bounded by the tile size, not by
//! the image size.
//!
//! ## Features
//!
//! - **Multi-source**: any number of co-registered sources, each with its own
//!   field of view and resolution
//! - **Patch-based or fully convolutional**: one run per patch batch, or one
//!   run per tile
//! - **Streaming**: tiles are mapped, extracted, run and assembled on demand
//! - **Parallel tiles**: independent tiles can be processed concurrently
//! - **Validation**: placeholders, geometry and tensor shapes are checked
//!   before any tile is computed
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use patchserve::prelude::*;
//!
//! let config = ServeConfig::load("serve.toml")?;
//! let host = default_host()?;
//! let server = ModelServer::from_config(&config, host.as_ref())?;
//!
//! let mut sink = TiffSink::new(&config.output.path);
//! let report = server.serve(&mut sink)?;
//! println!("{} tiles written", report.tiles);
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: regions, rasters, sources, errors and configuration
//! - [`model`]: the opaque graph session capability
//! - [`execution`]: region mapping, patch extraction, inference, assembly
//!   and tile streaming
//! - [`validation`]: multi-stage validation of a serving setup
//! - [`io`]: TIFF and image file readers, GeoTIFF writer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod core;
pub mod execution;
pub mod io;
pub mod model;
pub mod validation;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```rust,ignore
/// use patchserve::prelude::*;
/// ```
pub mod prelude {
    // Geometry and rasters
    pub use crate::core::raster::{
        GeoTransform, MemoryRaster, RasterInfo, RasterSource, RegionBuffer, StackedSource,
    };
    pub use crate::core::region::{ImageRegion, Size2D};
    pub use crate::core::sink::{MemorySink, RasterSink};

    // Serving setup
    pub use crate::core::config::{OutputConfig, ServeConfig, SourceConfig, TilingConfig};
    pub use crate::core::expression::parse_expression;
    pub use crate::core::types::{
        ConstantPlaceholder, InferenceMode, OutputSpec, PatchBatch, ScalarType, ScalarValue,
        SourceBundle, SourceSet,
    };

    // Errors
    pub use crate::core::error::{
        ConfigError, ExecutionError, ModelLoadError, RasterError, ServeError, ServeResult,
        SourceIndex, Stage, ValidationReport, ValidationWarning,
    };

    // Model
    pub use crate::model::{
        default_host, FeedValue, GraphInfo, GraphSession, GraphSessionHost, SessionError,
        SessionOutputs, TensorInfo,
    };

    // Validation
    pub use crate::validation::{
        GeometryValidation, PlaceholderValidation, ServeSetup, TensorValidation,
        ValidationPipeline, ValidationStage,
    };

    // Execution
    pub use crate::execution::engine::ModelServer;
    pub use crate::execution::mapper::{compute_geometry, RegionMapper, ServeGeometry};
    pub use crate::execution::progress::{CancelHandle, ProgressCallback, ProgressTracker, ProgressUpdate};
    pub use crate::execution::splitter::{plan_tiles, TilePlan};
    pub use crate::execution::streaming::{
        StreamReport, StreamState, StreamingController, StreamingOptions,
    };

    // I/O
    pub use crate::io::{open_raster, open_sources, TiffSink, TiffSource};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
        assert_eq!(super::NAME, "patchserve");
    }

    #[test]
    fn test_geometry_from_prelude() {
        let image: std::sync::Arc<dyn RasterSource> =
            std::sync::Arc::new(MemoryRaster::from_fn(10, 10, 1, |_, _, _| 0.0));
        let sources = SourceSet::new().with_source(SourceBundle::new(image, Size2D::square(4), "x"));
        let geometry = compute_geometry(&sources, &OutputSpec::new(["y"])).unwrap();
        assert_eq!(geometry.output_region().size(), Size2D::square(7));
    }

    #[test]
    fn test_default_pipeline_stages() {
        let pipeline = ValidationPipeline::default();
        assert_eq!(
            pipeline.stage_names(),
            vec![
                "Placeholder Validation",
                "Geometry Validation",
                "Tensor Validation"
            ]
        );
    }
}
