//! Raster file I/O.
//!
//! TIFF files are read lazily; other formats are decoded in full with the
//! `image` crate. Outputs are written as float GeoTIFF.

pub mod decoded;
pub mod geotiff;

pub use decoded::open_image;
pub use geotiff::{TiffSink, TiffSource};

use crate::core::config::SourceConfig;
use crate::core::error::{RasterError, ServeResult};
use crate::core::raster::{RasterSource, StackedSource};
use crate::core::types::{SourceBundle, SourceSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn is_tiff(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
        .unwrap_or(false)
}

fn is_pattern(entry: &str) -> bool {
    entry.contains(['*', '?', '['])
}

/// Open one raster file.
pub fn open_raster(path: impl AsRef<Path>) -> Result<Arc<dyn RasterSource>, RasterError> {
    let path = path.as_ref();
    if is_tiff(path) {
        Ok(Arc::new(TiffSource::open(path)?))
    } else {
        Ok(Arc::new(open_image(path)?))
    }
}

/// Expand an image list, replacing glob patterns with their sorted matches.
pub fn expand_image_list(entries: &[String]) -> Result<Vec<PathBuf>, RasterError> {
    let mut paths = Vec::new();
    for entry in entries {
        if !is_pattern(entry) {
            paths.push(PathBuf::from(entry));
            continue;
        }

        let pattern = glob::glob(entry).map_err(|e| RasterError::Invalid(format!("bad pattern '{}': {}", entry, e)))?;
        let mut matches = Vec::new();
        for path in pattern {
            matches.push(path.map_err(|e| RasterError::Io(e.into_error()))?);
        }
        if matches.is_empty() {
            return Err(RasterError::Invalid(format!("pattern '{}' matches no file", entry)));
        }
        matches.sort();
        paths.extend(matches);
    }
    Ok(paths)
}

/// Open every image of a source and stack them band-wise.
pub fn open_source(config: &SourceConfig) -> ServeResult<SourceBundle> {
    let paths = expand_image_list(&config.images)?;
    let mut layers = Vec::with_capacity(paths.len());
    for path in &paths {
        layers.push(open_raster(path)?);
    }

    let image: Arc<dyn RasterSource> = match layers.len() {
        1 => layers.remove(0),
        _ => Arc::new(StackedSource::new(layers)?),
    };
    log::info!(
        "Source '{}': {} ({} image(s), patch {})",
        config.placeholder,
        image.description(),
        paths.len(),
        config.patch
    );
    Ok(SourceBundle::new(image, config.patch, config.placeholder.clone()))
}

/// Open all configured sources, in order.
pub fn open_sources(configs: &[SourceConfig]) -> ServeResult<SourceSet> {
    let mut sources = SourceSet::new();
    for config in configs {
        sources.push(open_source(config)?);
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::raster::MemoryRaster;
    use crate::core::region::{ImageRegion, Size2D};
    use crate::core::sink::RasterSink;

    fn write_tiff(path: &Path, raster: &MemoryRaster) {
        let info = *raster.info();
        let mut sink = TiffSink::new(path);
        sink.initialize(&info).unwrap();
        sink.write_tile(&raster.read_region(info.extent()).unwrap()).unwrap();
        sink.finalize().unwrap();
    }

    #[test]
    fn test_expand_image_list_sorts_matches() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.tif", "a.tif", "c.png"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let pattern = dir.path().join("*.tif").display().to_string();
        let literal = dir.path().join("c.png").display().to_string();

        let paths = expand_image_list(&[literal.clone(), pattern]).unwrap();
        let names: Vec<_> = paths.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, vec!["c.png", "a.tif", "b.tif"]);

        let none = dir.path().join("*.jpg").display().to_string();
        assert!(expand_image_list(&[none]).is_err());
    }

    #[test]
    fn test_open_source_stacks_images() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.tif");
        let b = dir.path().join("b.tif");
        write_tiff(&a, &MemoryRaster::from_fn(8, 8, 1, |x, _, _| x as f32));
        write_tiff(&b, &MemoryRaster::from_fn(8, 8, 2, |_, y, band| (y * 10) as f32 + band as f32));

        let config = SourceConfig {
            images: vec![dir.path().join("*.tif").display().to_string()],
            patch: Size2D::square(4),
            placeholder: "x".to_string(),
        };
        let sources = open_sources(&[config]).unwrap();
        let bundle = sources.iter().next().unwrap().1;
        assert_eq!(bundle.channels(), 3);

        let block = bundle.image.read_region(ImageRegion::new(3, 2, 1, 1)).unwrap();
        assert_eq!(block.pixel(0, 0), &[3.0, 20.0, 21.0]);
    }

    #[test]
    fn test_open_raster_dispatches_on_extension() {
        assert!(is_tiff(Path::new("scene.TIF")));
        assert!(!is_tiff(Path::new("scene.png")));
        assert!(matches!(open_raster("/nonexistent/scene.tif"), Err(RasterError::Io(_))));
    }
}
