//! Region-addressed raster outputs.
//!
//! A sink is initialised once the band count of the output is known (after
//! the first tile), receives every tile exactly once, and is finalised when
//! streaming completes. A sink that is never finalised must not be treated as
//! a complete raster.

use crate::core::error::RasterError;
use crate::core::raster::{RasterInfo, RegionBuffer};

/// Trait for region-addressed raster destinations.
pub trait RasterSink: Send {
    /// Initialize the destination with the output metadata.
    fn initialize(&mut self, info: &RasterInfo) -> Result<(), RasterError>;

    /// Write a finished tile.
    fn write_tile(&mut self, tile: &RegionBuffer) -> Result<(), RasterError>;

    /// Finalize the destination (flush buffers, close files, etc.).
    fn finalize(&mut self) -> Result<(), RasterError>;
}

/// Check that `tile` fits an output described by `info`.
pub(crate) fn check_tile(info: &RasterInfo, tile: &RegionBuffer) -> Result<(), RasterError> {
    if tile.bands() != info.bands {
        return Err(RasterError::Invalid(format!(
            "tile {} has {} bands, output has {}",
            tile.region(),
            tile.bands(),
            info.bands
        )));
    }
    if !tile.region().is_within_bounds(info.width, info.height) {
        return Err(RasterError::OutOfBounds {
            region: tile.region(),
            extent: info.size(),
        });
    }
    Ok(())
}

/// In-memory sink that assembles tiles into one buffer.
#[derive(Debug, Default)]
pub struct MemorySink {
    info: Option<RasterInfo>,
    output: Option<RegionBuffer>,
    tiles_written: usize,
    finalized: bool,
}

impl MemorySink {
    /// Create a new memory sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Output metadata, once initialised.
    pub fn info(&self) -> Option<&RasterInfo> {
        self.info.as_ref()
    }

    /// Assembled output, once initialised.
    pub fn buffer(&self) -> Option<&RegionBuffer> {
        self.output.as_ref()
    }

    /// Take the assembled output.
    pub fn into_buffer(self) -> Option<RegionBuffer> {
        self.output
    }

    /// Number of tiles received so far.
    pub fn tiles_written(&self) -> usize {
        self.tiles_written
    }

    /// Whether `finalize` has been called.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl RasterSink for MemorySink {
    fn initialize(&mut self, info: &RasterInfo) -> Result<(), RasterError> {
        self.output = Some(RegionBuffer::new(info.extent(), info.bands));
        self.info = Some(*info);
        Ok(())
    }

    fn write_tile(&mut self, tile: &RegionBuffer) -> Result<(), RasterError> {
        let (info, output) = match (&self.info, self.output.as_mut()) {
            (Some(info), Some(output)) => (info, output),
            _ => return Err(RasterError::Invalid("sink not initialized".to_string())),
        };
        check_tile(info, tile)?;

        let region = tile.region();
        let row_len = region.width as usize * info.bands;
        let stride = info.width as usize * info.bands;
        let data = output.data_mut();
        for row in 0..region.height {
            let dst = (region.y + row) as usize * stride + region.x as usize * info.bands;
            data[dst..dst + row_len].copy_from_slice(tile.row(row));
        }

        self.tiles_written += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), RasterError> {
        self.finalized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::region::ImageRegion;

    #[test]
    fn test_memory_sink_assembles_tiles() {
        let mut sink = MemorySink::new();
        sink.initialize(&RasterInfo::new(4, 2, 1)).unwrap();

        let left = RegionBuffer::from_vec(ImageRegion::new(0, 0, 2, 2), 1, vec![1.0, 2.0, 5.0, 6.0]).unwrap();
        let right = RegionBuffer::from_vec(ImageRegion::new(2, 0, 2, 2), 1, vec![3.0, 4.0, 7.0, 8.0]).unwrap();
        sink.write_tile(&left).unwrap();
        sink.write_tile(&right).unwrap();
        sink.finalize().unwrap();

        assert!(sink.is_finalized());
        assert_eq!(sink.tiles_written(), 2);
        let out = sink.into_buffer().unwrap();
        assert_eq!(out.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_memory_sink_rejects_bad_tiles() {
        let mut sink = MemorySink::new();
        let tile = RegionBuffer::new(ImageRegion::new(0, 0, 2, 2), 1);
        assert!(sink.write_tile(&tile).is_err());

        sink.initialize(&RasterInfo::new(4, 4, 2)).unwrap();
        assert!(sink.write_tile(&tile).is_err());
        let outside = RegionBuffer::new(ImageRegion::new(3, 3, 2, 2), 2);
        assert!(matches!(sink.write_tile(&outside), Err(RasterError::OutOfBounds { .. })));
    }
}
