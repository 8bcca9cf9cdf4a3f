//! Pixel regions and sizes.
//!
//! Every raster-addressed step of the pipeline (tiles, mapped input regions,
//! patch windows) speaks in terms of [`ImageRegion`]: an axis-aligned block of
//! pixels with an exclusive right/bottom edge.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A width/height pair in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size2D {
    /// Extent along x.
    pub width: u32,
    /// Extent along y.
    pub height: u32,
}

impl Size2D {
    /// Create a new size.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Create a square size.
    pub const fn square(side: u32) -> Self {
        Self { width: side, height: side }
    }

    /// Number of pixels covered.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// True when either side is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Size2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Represents a rectangular region within a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ImageRegion {
    /// X offset from the raster origin
    pub x: u32,
    /// Y offset from the raster origin
    pub y: u32,
    /// Width of the region
    pub width: u32,
    /// Height of the region
    pub height: u32,
}

impl ImageRegion {
    /// Create a new region.
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Region anchored at the origin with the given size.
    pub const fn from_size(size: Size2D) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    /// Size of the region.
    pub fn size(&self) -> Size2D {
        Size2D::new(self.width, self.height)
    }

    /// Get the right edge coordinate (exclusive).
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Get the bottom edge coordinate (exclusive).
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Calculate the area of this region in pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// True when the region covers no pixel.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Check if this region is entirely within the given bounds.
    pub fn is_within_bounds(&self, width: u32, height: u32) -> bool {
        self.right() <= width && self.bottom() <= height
    }

    /// Check whether `other` lies completely inside this region.
    pub fn contains_region(&self, other: &ImageRegion) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Overlapping part of two regions, if any.
    pub fn intersection(&self, other: &ImageRegion) -> Option<ImageRegion> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(ImageRegion::new(x0, y0, x1 - x0, y1 - y0))
    }

    /// True when the two regions share at least one pixel.
    pub fn overlaps(&self, other: &ImageRegion) -> bool {
        self.intersection(other).is_some()
    }
}

impl fmt::Display for ImageRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}
