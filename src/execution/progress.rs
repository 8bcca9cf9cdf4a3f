//! Progress reporting and cancellation for a streaming pass.
//!
//! A pass emits `Started`, then for each wave one `TileStarted` per tile
//! followed by a `TileCompleted` and a `Progress` per tile once it reached
//! the sink. It ends with exactly one of `Completed`, `Cancelled` or `Error`.

use crate::core::region::ImageRegion;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One event of a streaming pass.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    /// The pass is about to compute its first tile.
    Started {
        total_tiles: usize,
    },
    /// A tile was handed to the workers; `index` is its position in the plan.
    TileStarted {
        tile: ImageRegion,
        index: usize,
        total: usize,
    },
    /// A tile reached the sink; `index` counts written tiles from 1.
    TileCompleted {
        tile: ImageRegion,
        duration_ms: u64,
        index: usize,
        total: usize,
    },
    /// Share of the output written so far.
    Progress {
        percent: f32,
        elapsed_ms: u64,
        estimated_remaining_ms: Option<u64>,
    },
    /// Every tile was written and the sink finalized.
    Completed {
        total_duration_ms: u64,
        tiles_processed: usize,
    },
    /// The pass stopped at a wave boundary after a cancel request.
    Cancelled {
        written: usize,
        total: usize,
    },
    /// The pass failed; `tile` is set when the failure belongs to one tile.
    Error {
        tile: Option<ImageRegion>,
        message: String,
    },
}

/// Callback receiving [`ProgressUpdate`]s. It may run on the thread driving
/// the pass while rayon workers are idle, never concurrently with itself.
pub type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Shareable cancellation flag, checked between waves.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Create a new, unset handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the pass to stop before its next wave.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Counts written tiles, estimates the remaining time and forwards events.
pub struct ProgressTracker {
    total_tiles: usize,
    written: AtomicUsize,
    /// Sum of per-tile compute times, the basis of the estimate.
    busy_ms: AtomicU64,
    cancel: CancelHandle,
    start_time: Option<Instant>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    /// Tracker for a plan of `total_tiles` tiles.
    pub fn new(total_tiles: usize) -> Self {
        Self {
            total_tiles,
            written: AtomicUsize::new(0),
            busy_ms: AtomicU64::new(0),
            cancel: CancelHandle::new(),
            start_time: None,
            callback: None,
        }
    }

    /// Forward every event to `callback`.
    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Use a cancellation flag owned by the caller.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that stops this pass.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Tiles in the plan.
    pub fn total_tiles(&self) -> usize {
        self.total_tiles
    }

    /// Tiles written to the sink so far.
    pub fn completed_tiles(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }

    /// Start the clock and emit `Started`.
    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
        self.emit(ProgressUpdate::Started {
            total_tiles: self.total_tiles,
        });
    }

    /// Emit `TileStarted` for the tile at plan position `index`.
    pub fn tile_started(&self, tile: ImageRegion, index: usize) {
        self.emit(ProgressUpdate::TileStarted {
            tile,
            index,
            total: self.total_tiles,
        });
    }

    /// Record a written tile and emit `TileCompleted` then `Progress`.
    pub fn tile_completed(&self, tile: ImageRegion, duration_ms: u64) {
        let written = self.written.fetch_add(1, Ordering::Relaxed) + 1;
        self.busy_ms.fetch_add(duration_ms, Ordering::Relaxed);

        self.emit(ProgressUpdate::TileCompleted {
            tile,
            duration_ms,
            index: written,
            total: self.total_tiles,
        });
        self.emit(ProgressUpdate::Progress {
            percent: self.progress_percent(),
            elapsed_ms: self.elapsed_ms(),
            estimated_remaining_ms: self.estimated_remaining_ms(),
        });
    }

    /// Whether a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Emit `Cancelled` with the number of tiles already written.
    pub fn report_cancelled(&self) {
        self.emit(ProgressUpdate::Cancelled {
            written: self.completed_tiles(),
            total: self.total_tiles,
        });
    }

    /// Emit `Error`.
    pub fn report_error(&self, tile: Option<ImageRegion>, message: String) {
        self.emit(ProgressUpdate::Error { tile, message });
    }

    /// Milliseconds since `start`, or zero before it.
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.map_or(0, |t| t.elapsed().as_millis() as u64)
    }

    /// Emit `Completed`.
    pub fn complete(&self) {
        self.emit(ProgressUpdate::Completed {
            total_duration_ms: self.elapsed_ms(),
            tiles_processed: self.completed_tiles(),
        });
    }

    /// Written share of the plan, in percent. An empty plan is complete.
    pub fn progress_percent(&self) -> f32 {
        if self.total_tiles == 0 {
            return 100.0;
        }
        self.completed_tiles() as f32 * 100.0 / self.total_tiles as f32
    }

    /// Mean tile compute time times the tiles left. This ignores wave
    /// parallelism, so it overestimates when several tiles are in flight.
    pub fn estimated_remaining_ms(&self) -> Option<u64> {
        let written = self.completed_tiles() as u64;
        if written == 0 {
            return None;
        }
        let mean = self.busy_ms.load(Ordering::Relaxed) / written;
        let left = self.total_tiles.saturating_sub(written as usize) as u64;
        Some(mean * left)
    }

    fn emit(&self, update: ProgressUpdate) {
        if let Some(callback) = &self.callback {
            callback(update);
        }
    }
}
