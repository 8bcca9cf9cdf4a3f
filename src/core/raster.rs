//! Region-addressed multi-band rasters.
//!
//! Rasters are never assumed to fit in memory: every consumer goes through
//! [`RasterSource::read_region`] and only ever holds the block it asked for.
//! Pixels are stored as `f32`, band-interleaved by pixel, which is also the
//! channel-last layout the graph tensors use.

use crate::core::error::RasterError;
use crate::core::region::{ImageRegion, Size2D};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Affine pixel-to-world mapping for north-up rasters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    /// World x of the upper-left corner of pixel (0, 0).
    pub origin_x: f64,
    /// World y of the upper-left corner of pixel (0, 0).
    pub origin_y: f64,
    /// Pixel width in world units.
    pub spacing_x: f64,
    /// Pixel height in world units (negative for north-up images).
    pub spacing_y: f64,
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self {
            origin_x: 0.0,
            origin_y: 0.0,
            spacing_x: 1.0,
            spacing_y: 1.0,
        }
    }
}

impl GeoTransform {
    /// Create a transform from origin and spacing.
    pub fn new(origin_x: f64, origin_y: f64, spacing_x: f64, spacing_y: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            spacing_x,
            spacing_y,
        }
    }

    /// Position of `other`'s origin, in pixels of this grid.
    pub fn pixel_offset_of(&self, other: &GeoTransform) -> (f64, f64) {
        (
            (other.origin_x - self.origin_x) / self.spacing_x,
            (other.origin_y - self.origin_y) / self.spacing_y,
        )
    }

    /// Whether both grids use the same pixel size, up to a relative tolerance.
    pub fn same_spacing(&self, other: &GeoTransform, tolerance: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance * a.abs().max(b.abs());
        close(self.spacing_x, other.spacing_x) && close(self.spacing_y, other.spacing_y)
    }

    /// Move the origin by a (possibly fractional) number of pixels.
    pub fn shifted(&self, dx: f64, dy: f64) -> Self {
        Self {
            origin_x: self.origin_x + dx * self.spacing_x,
            origin_y: self.origin_y + dy * self.spacing_y,
            ..*self
        }
    }

    /// Same origin, spacing multiplied by `scale_x`/`scale_y`.
    pub fn scaled(&self, scale_x: f64, scale_y: f64) -> Self {
        Self {
            spacing_x: self.spacing_x * scale_x,
            spacing_y: self.spacing_y * scale_y,
            ..*self
        }
    }
}

/// Raster metadata without the pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasterInfo {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Number of bands per pixel
    pub bands: usize,
    /// Georeferencing of the pixel grid
    pub geo: GeoTransform,
}

impl RasterInfo {
    /// Create metadata on the default (unit) grid.
    pub fn new(width: u32, height: u32, bands: usize) -> Self {
        Self {
            width,
            height,
            bands,
            geo: GeoTransform::default(),
        }
    }

    /// Attach a geotransform.
    pub fn with_geo(mut self, geo: GeoTransform) -> Self {
        self.geo = geo;
        self
    }

    /// Raster size.
    pub fn size(&self) -> Size2D {
        Size2D::new(self.width, self.height)
    }

    /// The full raster as a region.
    pub fn extent(&self) -> ImageRegion {
        ImageRegion::from_size(self.size())
    }
}

/// A block of pixels read from, or written to, a raster.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionBuffer {
    region: ImageRegion,
    bands: usize,
    data: Vec<f32>,
}

impl RegionBuffer {
    /// Zero-filled buffer covering `region`.
    pub fn new(region: ImageRegion, bands: usize) -> Self {
        let len = region.area() as usize * bands;
        Self {
            region,
            bands,
            data: vec![0.0; len],
        }
    }

    /// Wrap existing band-interleaved samples.
    pub fn from_vec(region: ImageRegion, bands: usize, data: Vec<f32>) -> Result<Self, RasterError> {
        let expected = region.area() as usize * bands;
        if data.len() != expected {
            return Err(RasterError::Invalid(format!(
                "buffer for {} with {} bands needs {} samples, got {}",
                region,
                bands,
                expected,
                data.len()
            )));
        }
        Ok(Self { region, bands, data })
    }

    /// Region covered, in raster coordinates.
    pub fn region(&self) -> ImageRegion {
        self.region
    }

    /// Bands per pixel.
    pub fn bands(&self) -> usize {
        self.bands
    }

    /// All samples.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// All samples, mutable.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consume into the sample vector.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Memory held by the samples, in bytes.
    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.region.width as usize + x as usize) * self.bands
    }

    /// Samples of one pixel, in buffer-local coordinates.
    pub fn pixel(&self, x: u32, y: u32) -> &[f32] {
        let start = self.offset(x, y);
        &self.data[start..start + self.bands]
    }

    /// Mutable samples of one pixel, in buffer-local coordinates.
    pub fn pixel_mut(&mut self, x: u32, y: u32) -> &mut [f32] {
        let start = self.offset(x, y);
        let bands = self.bands;
        &mut self.data[start..start + bands]
    }

    /// One sample, in buffer-local coordinates.
    pub fn get(&self, x: u32, y: u32, band: usize) -> f32 {
        self.data[self.offset(x, y) + band]
    }

    /// One row of samples, in buffer-local coordinates.
    pub fn row(&self, y: u32) -> &[f32] {
        let start = self.offset(0, y);
        &self.data[start..start + self.region.width as usize * self.bands]
    }

    /// Copy out a sub-region given in raster coordinates.
    pub fn crop(&self, sub: ImageRegion) -> Result<RegionBuffer, RasterError> {
        if !self.region.contains_region(&sub) {
            return Err(RasterError::OutOfBounds {
                region: sub,
                extent: self.region.size(),
            });
        }
        let mut out = RegionBuffer::new(sub, self.bands);
        let row_len = sub.width as usize * self.bands;
        for row in 0..sub.height {
            let src = self.offset(sub.x - self.region.x, sub.y - self.region.y + row);
            let dst = row as usize * row_len;
            out.data[dst..dst + row_len].copy_from_slice(&self.data[src..src + row_len]);
        }
        Ok(out)
    }
}

/// Trait for region-addressed raster inputs.
pub trait RasterSource: Send + Sync {
    /// Get raster metadata without loading pixel data.
    fn info(&self) -> &RasterInfo;

    /// Read a region of the raster.
    ///
    /// Fails with [`RasterError::OutOfBounds`] when the region is not fully
    /// inside the raster; sources never pad or clamp.
    fn read_region(&self, region: ImageRegion) -> Result<RegionBuffer, RasterError>;

    /// Short human-readable description, used in logs.
    fn description(&self) -> String {
        let info = self.info();
        format!("{}x{} raster with {} band(s)", info.width, info.height, info.bands)
    }
}

/// Fail unless `region` lies within the raster described by `info`.
pub fn check_region(info: &RasterInfo, region: ImageRegion) -> Result<(), RasterError> {
    if region.is_empty() || !region.is_within_bounds(info.width, info.height) {
        return Err(RasterError::OutOfBounds {
            region,
            extent: info.size(),
        });
    }
    Ok(())
}

/// In-memory raster source.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    info: RasterInfo,
    data: Arc<Vec<f32>>,
    name: Option<String>,
}

impl MemoryRaster {
    /// Create from band-interleaved samples.
    pub fn new(width: u32, height: u32, bands: usize, data: Vec<f32>) -> Result<Self, RasterError> {
        let expected = width as usize * height as usize * bands;
        if bands == 0 || data.len() != expected {
            return Err(RasterError::Invalid(format!(
                "{}x{} raster with {} bands needs {} samples, got {}",
                width,
                height,
                bands,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            info: RasterInfo::new(width, height, bands),
            data: Arc::new(data),
            name: None,
        })
    }

    /// Create by evaluating `f(x, y, band)` for every sample.
    pub fn from_fn<F>(width: u32, height: u32, bands: usize, f: F) -> Self
    where
        F: Fn(u32, u32, usize) -> f32,
    {
        let mut data = Vec::with_capacity(width as usize * height as usize * bands);
        for y in 0..height {
            for x in 0..width {
                for b in 0..bands {
                    data.push(f(x, y, b));
                }
            }
        }
        Self {
            info: RasterInfo::new(width, height, bands),
            data: Arc::new(data),
            name: None,
        }
    }

    /// Create from a buffer; the buffer's region offset is dropped.
    pub fn from_buffer(buffer: RegionBuffer) -> Self {
        let region = buffer.region();
        let bands = buffer.bands();
        Self {
            info: RasterInfo::new(region.width, region.height, bands),
            data: Arc::new(buffer.into_vec()),
            name: None,
        }
    }

    /// Attach a geotransform.
    pub fn with_geo(mut self, geo: GeoTransform) -> Self {
        self.info.geo = geo;
        self
    }

    /// Attach a name used in descriptions.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// All samples.
    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

impl RasterSource for MemoryRaster {
    fn info(&self) -> &RasterInfo {
        &self.info
    }

    fn read_region(&self, region: ImageRegion) -> Result<RegionBuffer, RasterError> {
        check_region(&self.info, region)?;

        let bands = self.info.bands;
        let row_len = region.width as usize * bands;
        let mut data = Vec::with_capacity(region.area() as usize * bands);
        for y in region.y..region.bottom() {
            let start = (y as usize * self.info.width as usize + region.x as usize) * bands;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }

        RegionBuffer::from_vec(region, bands, data)
    }

    fn description(&self) -> String {
        match &self.name {
            Some(name) => format!(
                "{} ({}x{}, {} band(s))",
                name, self.info.width, self.info.height, self.info.bands
            ),
            None => format!(
                "in-memory {}x{} raster with {} band(s)",
                self.info.width, self.info.height, self.info.bands
            ),
        }
    }
}

/// Band-wise stack of same-sized rasters, presented as one source.
pub struct StackedSource {
    layers: Vec<Arc<dyn RasterSource>>,
    info: RasterInfo,
}

impl StackedSource {
    /// Stack `layers` in order; all layers must share the same size.
    pub fn new(layers: Vec<Arc<dyn RasterSource>>) -> Result<Self, RasterError> {
        let first = layers
            .first()
            .ok_or_else(|| RasterError::Invalid("cannot stack an empty image list".to_string()))?;
        let mut info = *first.info();

        for layer in &layers[1..] {
            let other = layer.info();
            if other.size() != info.size() {
                return Err(RasterError::Invalid(format!(
                    "cannot stack {} onto a {}x{} raster",
                    layer.description(),
                    info.width,
                    info.height
                )));
            }
            info.bands += other.bands;
        }

        Ok(Self { layers, info })
    }

    /// Number of stacked layers.
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

impl RasterSource for StackedSource {
    fn info(&self) -> &RasterInfo {
        &self.info
    }

    fn read_region(&self, region: ImageRegion) -> Result<RegionBuffer, RasterError> {
        check_region(&self.info, region)?;
        if self.layers.len() == 1 {
            return self.layers[0].read_region(region);
        }

        let mut out = RegionBuffer::new(region, self.info.bands);
        let mut band_offset = 0;
        for layer in &self.layers {
            let part = layer.read_region(region)?;
            let bands = part.bands();
            for y in 0..region.height {
                for x in 0..region.width {
                    out.pixel_mut(x, y)[band_offset..band_offset + bands]
                        .copy_from_slice(part.pixel(x, y));
                }
            }
            band_offset += bands;
        }
        Ok(out)
    }

    fn description(&self) -> String {
        let parts: Vec<String> = self.layers.iter().map(|l| l.description()).collect();
        format!("stack of [{}]", parts.join(", "))
    }
}
