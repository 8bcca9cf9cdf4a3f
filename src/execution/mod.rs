//! Tiled execution of a serving pass.
//!
//! Leaves first: the mapper translates output tiles to input regions, the
//! extractor batches patches, the runner executes the graph and the
//! assembler rebuilds output tiles. The splitter plans tiles and the
//! streaming controller drives all of them.

pub mod assembler;
pub mod engine;
pub mod extractor;
pub mod mapper;
pub mod progress;
pub mod runner;
pub mod splitter;
pub mod streaming;

pub use assembler::OutputAssembler;
pub use engine::ModelServer;
pub use extractor::PatchExtractor;
pub use mapper::{ExtractionPlan, InputRegion, RegionMapper, ServeGeometry, TileMapping};
pub use progress::{CancelHandle, ProgressTracker, ProgressUpdate};
pub use runner::InferenceRunner;
pub use runner::{probe, probe_all};
pub use splitter::{plan_tiles, required_tile_count, split, TileIterator, TilePlan};
pub use streaming::{StreamReport, StreamState, StreamingController, StreamingOptions};
