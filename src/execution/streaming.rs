//! Tile-by-tile streaming of a serving pass.
//!
//! The controller walks the tile plan in row-major order. For every tile it
//! maps the input regions, extracts the patch batches, runs the graph and
//! assembles the output tile, then hands the tile to the sink. The sink is
//! initialised lazily once the first tile reveals the band count, and is
//! finalised only when every tile has been written. A failure leaves the
//! controller in [`StreamState::Failed`]; tiles already written stay written
//! and the sink is never finalised.
//!
//! With `tiles_in_flight > 1`, independent tiles are computed in waves on the
//! rayon pool and written in tile order once the wave completes.

use crate::core::config::TilingConfig;
use crate::core::error::{ConfigError, ExecutionError, RasterError, ServeError, ServeResult, Stage};
use crate::core::raster::{RasterInfo, RegionBuffer};
use crate::core::region::ImageRegion;
use crate::core::sink::RasterSink;
use crate::core::types::{ConstantPlaceholder, OutputSpec, SourceSet};
use crate::execution::assembler::{check_band_count, OutputAssembler};
use crate::execution::extractor::PatchExtractor;
use crate::execution::mapper::{RegionMapper, ServeGeometry};
use crate::execution::progress::{CancelHandle, ProgressCallback, ProgressTracker, ProgressUpdate};
use crate::execution::runner::{probe, InferenceRunner};
use crate::execution::splitter::{plan_tiles, TilePlan};
use crate::model::GraphSession;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;

/// Default tile side, in output pixels.
pub const DEFAULT_TILE_SIZE: u32 = crate::core::config::DEFAULT_TILE_SIZE;

/// Streaming options.
#[derive(Clone)]
pub struct StreamingOptions {
    /// Split the output into square tiles; otherwise stream one tile.
    pub tiling: bool,
    /// Tile side, in output pixels.
    pub tile_size: u32,
    /// Number of tiles computed concurrently.
    pub tiles_in_flight: usize,
    /// Progress callback.
    pub progress_callback: Option<Arc<ProgressCallback>>,
    /// External cancellation handle.
    pub cancel: Option<CancelHandle>,
}

impl std::fmt::Debug for StreamingOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingOptions")
            .field("tiling", &self.tiling)
            .field("tile_size", &self.tile_size)
            .field("tiles_in_flight", &self.tiles_in_flight)
            .field("progress_callback", &self.progress_callback.as_ref().map(|_| "<callback>"))
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            tiling: true,
            tile_size: DEFAULT_TILE_SIZE,
            tiles_in_flight: 1,
            progress_callback: None,
            cancel: None,
        }
    }
}

impl StreamingOptions {
    /// Create a new options builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable/disable tiling.
    pub fn with_tiling(mut self, tiling: bool) -> Self {
        self.tiling = tiling;
        self
    }

    /// Set the tile side.
    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    /// Set the number of tiles computed concurrently.
    pub fn with_tiles_in_flight(mut self, tiles: usize) -> Self {
        self.tiles_in_flight = tiles.max(1);
        self
    }

    /// Set progress callback.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(Box::new(callback)));
        self
    }

    /// Use an external cancellation handle.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Tile alignment, or `None` when tiling is disabled.
    pub fn alignment(&self) -> Option<u32> {
        self.tiling.then_some(self.tile_size)
    }
}

impl From<&TilingConfig> for StreamingOptions {
    fn from(config: &TilingConfig) -> Self {
        Self::new()
            .with_tiling(config.enabled)
            .with_tile_size(config.tile_size)
            .with_tiles_in_flight(config.tiles_in_flight)
    }
}

/// Lifecycle of a streaming pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing processed yet.
    Idle,
    /// Tiles before `cursor` have been written.
    Streaming { cursor: usize },
    /// Every tile written and the sink finalised.
    Done,
    /// A tile failed or the pass was cancelled.
    Failed,
}

impl StreamState {
    /// Whether the pass can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Done | StreamState::Failed)
    }
}

/// Summary of a completed pass.
#[derive(Debug, Clone)]
pub struct StreamReport {
    /// Output raster metadata.
    pub output: RasterInfo,
    /// Tiles written.
    pub tiles: usize,
    /// Division budget requested from the splitter.
    pub required_tiles: u64,
    /// Wall time, in milliseconds.
    pub duration_ms: u64,
}

/// Per-tile pipeline; shared by reference across rayon workers.
struct TileWorker<'a> {
    mapper: RegionMapper,
    extractor: PatchExtractor<'a>,
    runner: InferenceRunner<'a>,
    assembler: OutputAssembler,
}

impl TileWorker<'_> {
    fn process(&self, tile: ImageRegion) -> ServeResult<RegionBuffer> {
        let mapping = self.mapper.map(tile).map_err(|e| e.at(Stage::Mapping, tile))?;
        let batches = self
            .extractor
            .extract(&mapping)
            .map_err(|e| e.at(Stage::Extraction, tile))?;
        let outputs = self.runner.run(&batches).map_err(|e| e.at(Stage::Inference, tile))?;
        self.assembler
            .assemble(&mapping, &outputs)
            .map_err(|e| e.at(Stage::Assembly, tile))
    }

    fn process_timed(&self, tile: ImageRegion) -> (ImageRegion, ServeResult<RegionBuffer>, u64) {
        let start = Instant::now();
        let result = self.process(tile);
        (tile, result, start.elapsed().as_millis() as u64)
    }
}

/// Drives tiles through mapping, extraction, inference, assembly and writing.
pub struct StreamingController<'a> {
    worker: TileWorker<'a>,
    plan: TilePlan,
    tiles_in_flight: usize,
    tracker: ProgressTracker,
    state: StreamState,
    output_info: Option<RasterInfo>,
    started: Option<Instant>,
}

impl<'a> StreamingController<'a> {
    /// Set up a pass. Geometry and tensor names are checked here, before any
    /// tile is processed.
    pub fn new(
        sources: &'a SourceSet,
        session: &'a dyn GraphSession,
        constants: &'a [ConstantPlaceholder],
        spec: &'a OutputSpec,
        options: StreamingOptions,
    ) -> ServeResult<Self> {
        if spec.names.is_empty() {
            return Err(ConfigError::NoOutputs.into());
        }
        probe(session.info(), sources, constants, &spec.names)?;
        let mapper = RegionMapper::new(sources, spec)?;

        let full = mapper.output_region();
        let plan = plan_tiles(full, options.alignment()).map_err(|e| e.at(Stage::Splitting, full))?;
        log::info!(
            "Streaming {} output as {} tile(s) ({} requested division(s))",
            full.size(),
            plan.len(),
            plan.required_tiles
        );

        let mut tracker = ProgressTracker::new(plan.len());
        if let Some(callback) = &options.progress_callback {
            let callback = callback.clone();
            tracker = tracker.with_callback(Box::new(move |update| callback(update)));
        }
        if let Some(cancel) = &options.cancel {
            tracker = tracker.with_cancel_handle(cancel.clone());
        }

        Ok(Self {
            worker: TileWorker {
                mapper,
                extractor: PatchExtractor::new(sources),
                runner: InferenceRunner::new(session, constants, &spec.names),
                assembler: OutputAssembler::new(spec.foe, spec.mode),
            },
            plan,
            tiles_in_flight: options.tiles_in_flight.max(1),
            tracker,
            state: StreamState::Idle,
            output_info: None,
            started: None,
        })
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The tile plan.
    pub fn plan(&self) -> &TilePlan {
        &self.plan
    }

    /// Geometry of the pass.
    pub fn geometry(&self) -> &ServeGeometry {
        self.worker.mapper.geometry()
    }

    /// Output metadata, known once the first tile has been written.
    pub fn output_info(&self) -> Option<&RasterInfo> {
        self.output_info.as_ref()
    }

    /// Handle that cancels this pass between tiles.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.tracker.cancel_handle()
    }

    fn fail(&mut self, error: ServeError) -> ServeResult<StreamState> {
        self.state = StreamState::Failed;
        let tile = match &error {
            ServeError::Tile { tile, .. } => Some(*tile),
            _ => None,
        };
        self.tracker.report_error(tile, error.to_string());
        Err(error)
    }

    fn write(&mut self, sink: &mut dyn RasterSink, tile: ImageRegion, buffer: &RegionBuffer) -> ServeResult<()> {
        let sink_error = |e: RasterError| ExecutionError::Sink(e.to_string()).at(Stage::Writing, tile);

        match self.output_info.as_ref().map(|info| info.bands) {
            Some(bands) => {
                check_band_count(bands, buffer.bands()).map_err(|e| e.at(Stage::Assembly, tile))?;
            }
            None => {
                let info = self.geometry().output_info(buffer.bands());
                sink.initialize(&info).map_err(sink_error)?;
                log::info!(
                    "Output raster {}x{} with {} band(s)",
                    info.width,
                    info.height,
                    info.bands
                );
                self.output_info = Some(info);
            }
        }
        sink.write_tile(buffer).map_err(sink_error)
    }

    fn finish(&mut self, sink: &mut dyn RasterSink) -> ServeResult<StreamState> {
        let full = self.plan.full;
        if let Err(e) = sink.finalize() {
            return self.fail(ExecutionError::Sink(e.to_string()).at(Stage::Writing, full));
        }
        self.state = StreamState::Done;
        self.tracker.complete();
        log::info!(
            "Wrote {} tile(s) in {} ms",
            self.tracker.completed_tiles(),
            self.tracker.elapsed_ms()
        );
        Ok(self.state)
    }

    /// Process the next tile, or the next wave of tiles.
    pub fn step(&mut self, sink: &mut dyn RasterSink) -> ServeResult<StreamState> {
        let cursor = match self.state {
            StreamState::Done | StreamState::Failed => return Ok(self.state),
            StreamState::Idle => {
                self.started = Some(Instant::now());
                self.tracker.start();
                0
            }
            StreamState::Streaming { cursor } => cursor,
        };

        let total = self.plan.len();
        if cursor >= total {
            return self.finish(sink);
        }
        if self.tracker.is_cancelled() {
            self.state = StreamState::Failed;
            self.tracker.report_cancelled();
            return Err(ServeError::Cancelled {
                completed: cursor,
                total,
            });
        }

        let end = (cursor + self.tiles_in_flight).min(total);
        for (offset, tile) in self.plan.tiles[cursor..end].iter().enumerate() {
            self.tracker.tile_started(*tile, cursor + offset);
        }

        let worker = &self.worker;
        let wave = &self.plan.tiles[cursor..end];
        let results: Vec<_> = if wave.len() > 1 {
            wave.par_iter().map(|tile| worker.process_timed(*tile)).collect()
        } else {
            wave.iter().map(|tile| worker.process_timed(*tile)).collect()
        };

        for (tile, result, duration_ms) in results {
            let buffer = match result {
                Ok(buffer) => buffer,
                Err(e) => return self.fail(e),
            };
            if let Err(e) = self.write(sink, tile, &buffer) {
                return self.fail(e);
            }
            log::debug!("Tile {} done in {} ms", tile, duration_ms);
            self.tracker.tile_completed(tile, duration_ms);
        }

        self.state = StreamState::Streaming { cursor: end };
        if end == total {
            return self.finish(sink);
        }
        Ok(self.state)
    }

    /// Stream every remaining tile into `sink`.
    pub fn run(&mut self, sink: &mut dyn RasterSink) -> ServeResult<StreamReport> {
        loop {
            match self.step(sink)? {
                StreamState::Done => break,
                StreamState::Failed => {
                    return Err(ServeError::Other("streaming already failed".to_string()));
                }
                _ => {}
            }
        }

        let output = self
            .output_info
            .unwrap_or_else(|| self.geometry().output_info(0));
        Ok(StreamReport {
            output,
            tiles: self.plan.len(),
            required_tiles: self.plan.required_tiles,
            duration_ms: self.started.map(|t| t.elapsed().as_millis() as u64).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SourceIndex;
    use crate::core::raster::{MemoryRaster, RasterSource};
    use crate::core::region::Size2D;
    use crate::core::sink::MemorySink;
    use crate::core::types::{InferenceMode, SourceBundle};
    use crate::model::{FeedValue, GraphInfo, SessionError, SessionOutputs, TensorInfo};
    use ndarray::{ArrayD, Axis, IxDyn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Emits the centre pixel of every patch, optionally failing on a given run.
    struct CentreSession {
        info: GraphInfo,
        runs: AtomicUsize,
        fail_on_run: Option<usize>,
    }

    impl CentreSession {
        fn new() -> Self {
            Self {
                info: GraphInfo {
                    inputs: vec![TensorInfo::new("x", vec![None, Some(3), Some(3), Some(1)])],
                    outputs: vec![TensorInfo::new("centre", vec![None, Some(1)])],
                },
                runs: AtomicUsize::new(0),
                fail_on_run: None,
            }
        }
    }

    impl GraphSession for CentreSession {
        fn info(&self) -> &GraphInfo {
            &self.info
        }

        fn run(&self, feeds: &[(&str, FeedValue<'_>)], _fetches: &[&str]) -> Result<SessionOutputs, SessionError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_run == Some(run) {
                return Err(SessionError("device lost".to_string()));
            }
            let view = match &feeds[0].1 {
                FeedValue::Batch(view) => view,
                _ => return Err(SessionError("expected a batch".to_string())),
            };
            let centres: Vec<f32> = view.axis_iter(Axis(0)).map(|p| p[[1, 1, 0]]).collect();
            let n = centres.len();
            let mut out = SessionOutputs::new();
            out.insert(
                "centre".to_string(),
                ArrayD::from_shape_vec(IxDyn(&[n, 1]), centres).map_err(|e| SessionError(e.to_string()))?,
            );
            Ok(out)
        }
    }

    fn sources() -> SourceSet {
        let image: Arc<dyn RasterSource> =
            Arc::new(MemoryRaster::from_fn(12, 10, 1, |x, y, _| (y * 100 + x) as f32));
        SourceSet::new().with_source(SourceBundle::new(image, Size2D::square(3), "x"))
    }

    fn spec() -> OutputSpec {
        OutputSpec::new(["centre"])
    }

    #[test]
    fn test_repeated_output_fails_before_any_run() {
        let sources = sources();
        let session = CentreSession::new();
        let spec = OutputSpec::new(["centre", "centre"]);
        let err = StreamingController::new(&sources, &session, &[], &spec, StreamingOptions::new())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ServeError::Config(ConfigError::InvalidParameter { ref parameter, .. }) if parameter == "output.names"
        ));
        assert_eq!(session.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_writes_every_tile_in_order() {
        let sources = sources();
        let session = CentreSession::new();
        let spec = spec();
        let mut controller =
            StreamingController::new(&sources, &session, &[], &spec, StreamingOptions::new().with_tile_size(4))
                .unwrap();
        assert_eq!(controller.state(), StreamState::Idle);
        assert_eq!(controller.plan().len(), 6);

        let mut sink = MemorySink::new();
        let report = controller.run(&mut sink).unwrap();
        assert_eq!(report.tiles, 6);
        assert_eq!(report.output.size(), Size2D::new(10, 8));
        assert_eq!(controller.state(), StreamState::Done);
        assert!(sink.is_finalized());

        // Output pixel (x, y) is the centre of the patch starting at (x, y).
        let out = sink.into_buffer().unwrap();
        assert_eq!(out.get(0, 0, 0), 101.0);
        assert_eq!(out.get(9, 7, 0), 810.0);
    }

    #[test]
    fn test_step_by_step() {
        let sources = sources();
        let session = CentreSession::new();
        let spec = spec();
        let options = StreamingOptions::new().with_tile_size(8);
        let mut controller = StreamingController::new(&sources, &session, &[], &spec, options).unwrap();
        let mut sink = MemorySink::new();

        assert_eq!(controller.step(&mut sink).unwrap(), StreamState::Streaming { cursor: 1 });
        assert_eq!(controller.output_info().unwrap().bands, 1);
        assert_eq!(controller.step(&mut sink).unwrap(), StreamState::Done);
        assert_eq!(controller.step(&mut sink).unwrap(), StreamState::Done);
        assert_eq!(sink.tiles_written(), 2);
    }

    #[test]
    fn test_waves_match_sequential_output() {
        let sources = sources();
        let spec = spec();

        let sequential = {
            let session = CentreSession::new();
            let mut sink = MemorySink::new();
            StreamingController::new(&sources, &session, &[], &spec, StreamingOptions::new().with_tile_size(3))
                .unwrap()
                .run(&mut sink)
                .unwrap();
            sink.into_buffer().unwrap()
        };
        let parallel = {
            let session = CentreSession::new();
            let mut sink = MemorySink::new();
            let options = StreamingOptions::new().with_tile_size(3).with_tiles_in_flight(4);
            StreamingController::new(&sources, &session, &[], &spec, options)
                .unwrap()
                .run(&mut sink)
                .unwrap();
            sink.into_buffer().unwrap()
        };
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_failure_stops_without_finalizing() {
        let sources = sources();
        let mut session = CentreSession::new();
        session.fail_on_run = Some(2);
        let spec = spec();
        let mut controller =
            StreamingController::new(&sources, &session, &[], &spec, StreamingOptions::new().with_tile_size(4))
                .unwrap();

        let mut sink = MemorySink::new();
        let err = controller.run(&mut sink).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Inference));
        assert!(matches!(err, ServeError::Tile { tile, .. } if tile == ImageRegion::new(8, 0, 2, 4)));
        assert_eq!(controller.state(), StreamState::Failed);
        assert_eq!(sink.tiles_written(), 2);
        assert!(!sink.is_finalized());
    }

    #[test]
    fn test_cancellation_between_tiles() {
        let sources = sources();
        let session = CentreSession::new();
        let spec = spec();
        let cancel = CancelHandle::new();
        let options = StreamingOptions::new().with_tile_size(4).with_cancel_handle(cancel.clone());
        let mut controller = StreamingController::new(&sources, &session, &[], &spec, options).unwrap();
        let mut sink = MemorySink::new();

        controller.step(&mut sink).unwrap();
        cancel.cancel();
        let err = controller.step(&mut sink).unwrap_err();
        assert!(matches!(err, ServeError::Cancelled { completed: 1, total: 6 }));
        assert!(!sink.is_finalized());
    }

    #[test]
    fn test_setup_rejects_unknown_output() {
        let sources = sources();
        let session = CentreSession::new();
        let spec = OutputSpec::new(["logits"]);
        let err = StreamingController::new(&sources, &session, &[], &spec, StreamingOptions::new())
            .err()
            .unwrap();
        assert!(matches!(err, ServeError::Config(ConfigError::UnknownTensor { .. })));
        assert_eq!(session.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_tile_size_is_splitting_error() {
        let sources = sources();
        let session = CentreSession::new();
        let spec = spec();
        let err = StreamingController::new(&sources, &session, &[], &spec, StreamingOptions::new().with_tile_size(0))
            .err()
            .unwrap();
        assert_eq!(err.stage(), Some(Stage::Splitting));
    }

    #[test]
    fn test_fully_convolutional_tiling_disabled() {
        let sources = sources();
        let session = CentreSession::new();
        let spec = spec().with_mode(InferenceMode::FullyConvolutional);
        let options = StreamingOptions::new().with_tiling(false);
        let mut controller = StreamingController::new(&sources, &session, &[], &spec, options).unwrap();
        assert_eq!(controller.plan().tiles, vec![ImageRegion::new(0, 0, 10, 8)]);

        // One pass over the whole region yields a single value, not a 10x8 block.
        let err = controller.run(&mut MemorySink::new()).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Assembly));
        assert_eq!(
            err.execution_error().and_then(|e| e.source_index()),
            None::<SourceIndex>
        );
    }
}
