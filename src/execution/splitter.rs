//! Square tile splitting of the output region.
//!
//! Tiles are produced row-major with side `alignment`; tiles on the right and
//! bottom edges may be smaller. The tiles partition the region: no gaps, no
//! overlaps, union equal to the region.

use crate::core::error::{ExecutionError, ExecutionResult};
use crate::core::region::ImageRegion;

/// Iterator over the square tiles of a region.
#[derive(Debug, Clone)]
pub struct TileIterator {
    full: ImageRegion,
    alignment: u32,
    current_x: u32,
    current_y: u32,
}

impl TileIterator {
    /// Create a new tile iterator. `alignment` must be non-zero.
    fn new(full: ImageRegion, alignment: u32) -> Self {
        Self {
            full,
            alignment,
            current_x: full.x,
            current_y: full.y,
        }
    }

    /// Number of tiles along x and y.
    pub fn grid(&self) -> (u32, u32) {
        if self.full.is_empty() {
            return (0, 0);
        }
        (
            self.full.width.div_ceil(self.alignment),
            self.full.height.div_ceil(self.alignment),
        )
    }

    /// Get the total number of tiles.
    pub fn tile_count(&self) -> usize {
        let (tiles_x, tiles_y) = self.grid();
        tiles_x as usize * tiles_y as usize
    }
}

impl Iterator for TileIterator {
    type Item = ImageRegion;

    fn next(&mut self) -> Option<Self::Item> {
        if self.full.is_empty() || self.current_y >= self.full.bottom() {
            return None;
        }

        let x = self.current_x;
        let y = self.current_y;
        let width = self.alignment.min(self.full.right() - x);
        let height = self.alignment.min(self.full.bottom() - y);

        // Move to next tile
        self.current_x += self.alignment;
        if self.current_x >= self.full.right() {
            self.current_x = self.full.x;
            self.current_y += self.alignment;
        }

        Some(ImageRegion::new(x, y, width, height))
    }
}

/// The tiling of one output region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
    /// Region being split.
    pub full: ImageRegion,
    /// Tile side; `None` when tiling is disabled.
    pub alignment: Option<u32>,
    /// Division budget: `ceil(pixels / alignment²)`.
    pub required_tiles: u64,
    /// Tiles, row-major.
    pub tiles: Vec<ImageRegion>,
}

impl TilePlan {
    /// Number of tiles actually produced.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// True when the region holds no tile.
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

fn check_alignment(alignment: u32) -> ExecutionResult<()> {
    if alignment == 0 {
        return Err(ExecutionError::Splitting(
            "tile alignment must be at least 1 pixel".to_string(),
        ));
    }
    Ok(())
}

/// Split `full` into row-major square tiles of side `alignment`.
pub fn split(full: ImageRegion, alignment: u32) -> ExecutionResult<Vec<ImageRegion>> {
    check_alignment(alignment)?;
    Ok(TileIterator::new(full, alignment).collect())
}

/// Number of divisions requested for `full`: `ceil(pixels / alignment²)`.
///
/// This is a budget, not the grid size: edge tiles make the actual grid
/// larger whenever the region is not a multiple of the alignment.
pub fn required_tile_count(full: ImageRegion, alignment: u32) -> ExecutionResult<u64> {
    check_alignment(alignment)?;
    let tile_pixels = alignment as u64 * alignment as u64;
    Ok(full.area().div_ceil(tile_pixels))
}

/// Split the output region, or keep it whole when `alignment` is `None`.
pub fn plan_tiles(full: ImageRegion, alignment: Option<u32>) -> ExecutionResult<TilePlan> {
    match alignment {
        Some(side) => Ok(TilePlan {
            full,
            alignment: Some(side),
            required_tiles: required_tile_count(full, side)?,
            tiles: split(full, side)?,
        }),
        None => Ok(TilePlan {
            full,
            alignment: None,
            required_tiles: 1,
            tiles: if full.is_empty() { Vec::new() } else { vec![full] },
        }),
    }
}
