//! Non-TIFF inputs decoded with the `image` crate.
//!
//! Samples keep their stored values (no normalisation to `[0, 1]`).

use crate::core::error::RasterError;
use crate::core::raster::MemoryRaster;
use image::DynamicImage;
use std::path::Path;

fn widen<T: Copy + Into<f32>>(samples: &[T]) -> Vec<f32> {
    samples.iter().map(|&s| s.into()).collect()
}

/// Split a decoded image into band count and interleaved `f32` samples.
fn samples(image: DynamicImage) -> (usize, Vec<f32>) {
    match image {
        DynamicImage::ImageLuma8(b) => (1, widen(b.as_raw())),
        DynamicImage::ImageLumaA8(b) => (2, widen(b.as_raw())),
        DynamicImage::ImageRgb8(b) => (3, widen(b.as_raw())),
        DynamicImage::ImageRgba8(b) => (4, widen(b.as_raw())),
        DynamicImage::ImageLuma16(b) => (1, widen(b.as_raw())),
        DynamicImage::ImageLumaA16(b) => (2, widen(b.as_raw())),
        DynamicImage::ImageRgb16(b) => (3, widen(b.as_raw())),
        DynamicImage::ImageRgba16(b) => (4, widen(b.as_raw())),
        DynamicImage::ImageRgb32F(b) => (3, b.into_raw()),
        DynamicImage::ImageRgba32F(b) => (4, b.into_raw()),
        other => (4, other.to_rgba32f().into_raw()),
    }
}

/// Decode an image file into an in-memory raster.
pub fn open_image(path: impl AsRef<Path>) -> Result<MemoryRaster, RasterError> {
    let path = path.as_ref();
    let image = image::open(path)?;
    let (width, height) = (image.width(), image.height());
    let (bands, data) = samples(image);
    log::debug!(
        "Decoded {} ({}x{}, {} band(s))",
        path.display(),
        width,
        height,
        bands
    );
    Ok(MemoryRaster::new(width, height, bands, data)?.with_name(path.display().to_string()))
}
