//! Lazy GeoTIFF reading and strip-spooled GeoTIFF writing.
//!
//! [`TiffSource`] decodes strips or tiles on demand and keeps the most
//! recently used ones in an LRU cache, so a source never has to fit in
//! memory. [`TiffSink`] spools tiles to an anonymous temporary file and only
//! writes the output raster on `finalize`.

use crate::core::error::RasterError;
use crate::core::raster::{check_region, GeoTransform, RasterInfo, RasterSource, RegionBuffer};
use crate::core::region::ImageRegion;
use crate::core::sink::{check_tile, RasterSink};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

/// GeoTIFF ModelPixelScaleTag.
const GEOTIFF_MODEL_PIXEL_SCALE: u16 = 33550;
/// GeoTIFF ModelTiepointTag.
const GEOTIFF_MODEL_TIEPOINT: u16 = 33922;

/// Decoded chunks kept per source.
pub const DEFAULT_CHUNK_CACHE: usize = 64;

/// Target size of one output strip.
const STRIP_BYTES: usize = 1 << 20;

fn tiff_error(path: &Path, e: tiff::TiffError) -> RasterError {
    RasterError::Tiff(format!("{}: {}", path.display(), e))
}

/// Read the GeoTIFF pixel scale and tiepoint, if both are present.
fn read_geo<R: Read + Seek>(decoder: &mut Decoder<R>) -> tiff::TiffResult<Option<GeoTransform>> {
    let scale = decoder.find_tag(Tag::from_u16_exhaustive(GEOTIFF_MODEL_PIXEL_SCALE))?;
    let tiepoint = decoder.find_tag(Tag::from_u16_exhaustive(GEOTIFF_MODEL_TIEPOINT))?;
    let (Some(scale), Some(tiepoint)) = (scale, tiepoint) else {
        return Ok(None);
    };
    let scale = scale.into_f64_vec()?;
    let tiepoint = tiepoint.into_f64_vec()?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Ok(None);
    }

    // Tiepoint ties raster (i, j) to model (x, y); north-up rasters grow
    // downwards, hence the negative y spacing.
    let (sx, sy) = (scale[0], scale[1]);
    Ok(Some(GeoTransform::new(
        tiepoint[3] - tiepoint[0] * sx,
        tiepoint[4] + tiepoint[1] * sy,
        sx,
        -sy,
    )))
}

fn into_f32(result: DecodingResult) -> Vec<f32> {
    match result {
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::F16(v) => v.into_iter().map(|x| x.to_f32()).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
    }
}

/// A decoded strip or tile.
struct Chunk {
    /// Pixels per stored row; tiles on the right edge may be padded.
    stride: usize,
    data: Vec<f32>,
}

struct ChunkReader {
    decoder: Decoder<BufReader<File>>,
    cache: LruCache<u32, Arc<Chunk>>,
}

/// Lazily decoded TIFF or GeoTIFF raster.
pub struct TiffSource {
    path: PathBuf,
    info: RasterInfo,
    chunk_width: u32,
    chunk_height: u32,
    chunks_across: u32,
    reader: Mutex<ChunkReader>,
}

impl TiffSource {
    /// Open a TIFF file with the default chunk cache.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RasterError> {
        Self::open_with_cache(path, DEFAULT_CHUNK_CACHE)
    }

    /// Open a TIFF file, caching up to `chunks` decoded strips or tiles.
    pub fn open_with_cache(path: impl AsRef<Path>, chunks: usize) -> Result<Self, RasterError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| tiff_error(&path, e))?;

        let (width, height) = decoder.dimensions().map_err(|e| tiff_error(&path, e))?;
        let bands = match decoder.find_tag(Tag::SamplesPerPixel).map_err(|e| tiff_error(&path, e))? {
            Some(value) => value.into_u32().map_err(|e| tiff_error(&path, e))? as usize,
            None => 1,
        };
        let planar = match decoder.find_tag(Tag::PlanarConfiguration).map_err(|e| tiff_error(&path, e))? {
            Some(value) => value.into_u32().map_err(|e| tiff_error(&path, e))?,
            None => 1,
        };
        if planar != 1 {
            return Err(RasterError::Unsupported {
                path: path.display().to_string(),
                reason: "only chunky (pixel-interleaved) TIFF files are supported".to_string(),
            });
        }

        let geo = read_geo(&mut decoder).map_err(|e| tiff_error(&path, e))?.unwrap_or_default();
        let (chunk_width, chunk_height) = decoder.chunk_dimensions();
        if chunk_width == 0 || chunk_height == 0 {
            return Err(RasterError::Unsupported {
                path: path.display().to_string(),
                reason: "empty strip or tile layout".to_string(),
            });
        }

        let info = RasterInfo::new(width, height, bands).with_geo(geo);
        log::debug!(
            "Opened {} ({}x{}, {} band(s), {}x{} chunks)",
            path.display(),
            width,
            height,
            bands,
            chunk_width,
            chunk_height
        );

        let capacity = NonZeroUsize::new(chunks).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            path,
            info,
            chunk_width,
            chunk_height,
            chunks_across: width.div_ceil(chunk_width),
            reader: Mutex::new(ChunkReader {
                decoder,
                cache: LruCache::new(capacity),
            }),
        })
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn chunk(&self, index: u32) -> Result<Arc<Chunk>, RasterError> {
        let mut reader = self.reader.lock();
        if let Some(chunk) = reader.cache.get(&index) {
            return Ok(chunk.clone());
        }

        let (data_width, data_height) = reader.decoder.chunk_data_dimensions(index);
        let data = into_f32(reader.decoder.read_chunk(index).map_err(|e| tiff_error(&self.path, e))?);

        let bands = self.info.bands;
        let stride = if data.len() == data_width as usize * data_height as usize * bands {
            data_width as usize
        } else if data.len() % (self.chunk_width as usize * bands) == 0 {
            self.chunk_width as usize
        } else {
            return Err(RasterError::Tiff(format!(
                "{}: chunk {} holds {} samples, which matches no row layout",
                self.path.display(),
                index,
                data.len()
            )));
        };

        let chunk = Arc::new(Chunk { stride, data });
        reader.cache.put(index, chunk.clone());
        Ok(chunk)
    }
}

impl RasterSource for TiffSource {
    fn info(&self) -> &RasterInfo {
        &self.info
    }

    fn read_region(&self, region: ImageRegion) -> Result<RegionBuffer, RasterError> {
        check_region(&self.info, region)?;
        let bands = self.info.bands;
        let mut out = RegionBuffer::new(region, bands);

        let (cw, ch) = (self.chunk_width, self.chunk_height);
        for cy in region.y / ch..=(region.bottom() - 1) / ch {
            for cx in region.x / cw..=(region.right() - 1) / cw {
                let chunk = self.chunk(cy * self.chunks_across + cx)?;
                let bounds = ImageRegion::new(cx * cw, cy * ch, cw, ch);
                let Some(overlap) = region.intersection(&bounds) else {
                    continue;
                };

                let row_len = overlap.width as usize * bands;
                for y in overlap.y..overlap.bottom() {
                    let src = ((y - bounds.y) as usize * chunk.stride + (overlap.x - bounds.x) as usize) * bands;
                    let dst = ((y - region.y) as usize * region.width as usize + (overlap.x - region.x) as usize) * bands;
                    let line = chunk.data.get(src..src + row_len).ok_or_else(|| {
                        RasterError::Tiff(format!("{}: chunk {} is truncated", self.path.display(), cy * self.chunks_across + cx))
                    })?;
                    out.data_mut()[dst..dst + row_len].copy_from_slice(line);
                }
            }
        }
        Ok(out)
    }

    fn description(&self) -> String {
        format!(
            "{} ({}x{}, {} band(s))",
            self.path.display(),
            self.info.width,
            self.info.height,
            self.info.bands
        )
    }
}

/// Multi-band float GeoTIFF writer.
///
/// Nothing is created at `path` before `finalize`; an interrupted pass leaves
/// no partial raster behind.
pub struct TiffSink {
    path: PathBuf,
    info: Option<RasterInfo>,
    spool: Option<File>,
    tiles_written: usize,
}

impl TiffSink {
    /// Create a sink writing to `path` on finalize.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            info: None,
            spool: None,
            tiles_written: 0,
        }
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of tiles received so far.
    pub fn tiles_written(&self) -> usize {
        self.tiles_written
    }

    fn write_tiff(&self, info: &RasterInfo, spool: &mut File) -> Result<(), RasterError> {
        let bands = info.bands;
        let row_samples = info.width as usize * bands;
        let rows_per_strip = (STRIP_BYTES / (row_samples * 4)).clamp(1, info.height as usize) as u32;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut output = tempfile::NamedTempFile::new_in(dir)?;
        let mut writer = BufWriter::new(output.as_file_mut());
        {
            let mut encoder = TiffEncoder::new(&mut writer)?;
            let mut directory = encoder.image_directory()?;

            directory.write_tag(Tag::ImageWidth, info.width)?;
            directory.write_tag(Tag::ImageLength, info.height)?;
            directory.write_tag(Tag::BitsPerSample, vec![32u16; bands].as_slice())?;
            directory.write_tag(Tag::Compression, 1u16)?;
            directory.write_tag(Tag::PhotometricInterpretation, 1u16)?;
            directory.write_tag(Tag::SamplesPerPixel, bands as u16)?;
            directory.write_tag(Tag::SampleFormat, vec![3u16; bands].as_slice())?;
            directory.write_tag(Tag::PlanarConfiguration, 1u16)?;
            directory.write_tag(Tag::RowsPerStrip, rows_per_strip)?;
            if bands > 1 {
                directory.write_tag(Tag::ExtraSamples, vec![0u16; bands - 1].as_slice())?;
            }
            if info.geo.spacing_y < 0.0 {
                let geo = info.geo;
                let scale = [geo.spacing_x, -geo.spacing_y, 0.0];
                let tiepoint = [0.0, 0.0, 0.0, geo.origin_x, geo.origin_y, 0.0];
                directory.write_tag(Tag::from_u16_exhaustive(GEOTIFF_MODEL_PIXEL_SCALE), &scale[..])?;
                directory.write_tag(Tag::from_u16_exhaustive(GEOTIFF_MODEL_TIEPOINT), &tiepoint[..])?;
            }

            spool.seek(SeekFrom::Start(0))?;
            let mut offsets = Vec::new();
            let mut byte_counts = Vec::new();
            let mut bytes = Vec::new();
            let mut row = 0;
            while row < info.height {
                let rows = rows_per_strip.min(info.height - row);
                bytes.resize(rows as usize * row_samples * 4, 0);
                spool.read_exact(&mut bytes)?;
                let samples: Vec<f32> = bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();

                let offset = directory.write_data(samples.as_slice())?;
                offsets.push(u32::try_from(offset).map_err(|_| {
                    RasterError::Invalid("output exceeds the 4 GiB limit of classic TIFF".to_string())
                })?);
                byte_counts.push(bytes.len() as u32);
                row += rows;
            }
            directory.write_tag(Tag::StripOffsets, offsets.as_slice())?;
            directory.write_tag(Tag::StripByteCounts, byte_counts.as_slice())?;
            directory.finish()?;
        }
        writer.flush()?;
        drop(writer);
        output.persist(&self.path).map_err(|e| RasterError::Io(e.error))?;
        Ok(())
    }
}

impl RasterSink for TiffSink {
    fn initialize(&mut self, info: &RasterInfo) -> Result<(), RasterError> {
        if info.bands == 0 || info.bands > u16::MAX as usize {
            return Err(RasterError::Invalid(format!("cannot write {} bands", info.bands)));
        }
        let spool = tempfile::tempfile()?;
        spool.set_len(info.width as u64 * info.height as u64 * info.bands as u64 * 4)?;
        self.spool = Some(spool);
        self.info = Some(*info);
        self.tiles_written = 0;
        Ok(())
    }

    fn write_tile(&mut self, tile: &RegionBuffer) -> Result<(), RasterError> {
        let (Some(info), Some(spool)) = (self.info.as_ref(), self.spool.as_mut()) else {
            return Err(RasterError::Invalid("sink is not initialized".to_string()));
        };
        check_tile(info, tile)?;

        let region = tile.region();
        let mut bytes = Vec::with_capacity(region.width as usize * info.bands * 4);
        for y in 0..region.height {
            bytes.clear();
            bytes.extend(tile.row(y).iter().flat_map(|v| v.to_ne_bytes()));
            let pixel = (region.y + y) as u64 * info.width as u64 + region.x as u64;
            spool.seek(SeekFrom::Start(pixel * info.bands as u64 * 4))?;
            spool.write_all(&bytes)?;
        }
        self.tiles_written += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), RasterError> {
        let (Some(info), Some(mut spool)) = (self.info, self.spool.take()) else {
            return Err(RasterError::Invalid("sink is not initialized".to_string()));
        };
        self.write_tiff(&info, &mut spool)?;
        log::info!(
            "Wrote {} ({}x{}, {} band(s))",
            self.path.display(),
            info.width,
            info.height,
            info.bands
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::raster::MemoryRaster;

    fn write(path: &Path, raster: &MemoryRaster, tile: u32) {
        let info = *raster.info();
        let mut sink = TiffSink::new(path);
        sink.initialize(&info).unwrap();
        for y in (0..info.height).step_by(tile as usize) {
            for x in (0..info.width).step_by(tile as usize) {
                let region = ImageRegion::new(x, y, tile.min(info.width - x), tile.min(info.height - y));
                sink.write_tile(&raster.read_region(region).unwrap()).unwrap();
            }
        }
        assert!(!path.exists());
        sink.finalize().unwrap();
    }

    #[test]
    fn test_multiband_round_trip_with_geo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tif");
        let geo = GeoTransform::new(500000.0, 4200000.0, 10.0, -10.0);
        let raster = MemoryRaster::from_fn(37, 23, 3, |x, y, b| (y * 100 + x) as f32 + b as f32 * 0.25).with_geo(geo);
        write(&path, &raster, 8);

        let source = TiffSource::open(&path).unwrap();
        assert_eq!(source.info().size(), raster.info().size());
        assert_eq!(source.info().bands, 3);
        assert_eq!(source.info().geo, geo);

        let region = ImageRegion::new(5, 17, 30, 6);
        assert_eq!(source.read_region(region).unwrap(), raster.read_region(region).unwrap());
    }

    #[test]
    fn test_opens_four_band_float_geotiff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bands.tif");
        let (width, height, bands) = (5u32, 3u32, 4usize);
        let samples: Vec<f32> = (0..width * height * bands as u32).map(|i| i as f32 * 0.5).collect();
        {
            let mut file = File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(&mut file).unwrap();
            let mut directory = encoder.image_directory().unwrap();
            directory.write_tag(Tag::ImageWidth, width).unwrap();
            directory.write_tag(Tag::ImageLength, height).unwrap();
            directory.write_tag(Tag::BitsPerSample, &[32u16; 4][..]).unwrap();
            directory.write_tag(Tag::Compression, 1u16).unwrap();
            directory.write_tag(Tag::PhotometricInterpretation, 1u16).unwrap();
            directory.write_tag(Tag::SamplesPerPixel, 4u16).unwrap();
            directory.write_tag(Tag::SampleFormat, &[3u16; 4][..]).unwrap();
            directory.write_tag(Tag::ExtraSamples, &[0u16; 3][..]).unwrap();
            directory.write_tag(Tag::RowsPerStrip, height).unwrap();
            directory
                .write_tag(Tag::from_u16_exhaustive(GEOTIFF_MODEL_PIXEL_SCALE), &[2.0f64, 2.0, 0.0][..])
                .unwrap();
            directory
                .write_tag(
                    Tag::from_u16_exhaustive(GEOTIFF_MODEL_TIEPOINT),
                    &[0.0f64, 0.0, 0.0, 100.0, 50.0, 0.0][..],
                )
                .unwrap();
            let offset = directory.write_data(samples.as_slice()).unwrap();
            directory.write_tag(Tag::StripOffsets, offset as u32).unwrap();
            directory.write_tag(Tag::StripByteCounts, (samples.len() * 4) as u32).unwrap();
            directory.finish().unwrap();
        }

        let source = TiffSource::open(&path).unwrap();
        assert_eq!(source.info().bands, 4);
        assert_eq!(source.info().geo, GeoTransform::new(100.0, 50.0, 2.0, -2.0));

        let buffer = source.read_region(ImageRegion::new(1, 1, 3, 2)).unwrap();
        // Pixel (2, 2) starts at sample (2 * 5 + 2) * 4.
        assert_eq!(buffer.get(1, 1, 0), 24.0);
        assert_eq!(buffer.get(1, 1, 3), 25.5);
    }

    #[test]
    fn test_reads_tiles_spanning_strips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.tif");
        // Rows of 20000 floats give 13 rows per strip.
        let raster = MemoryRaster::from_fn(20000, 40, 1, |x, y, _| (x % 1000 + y) as f32);
        write(&path, &raster, 256);

        let source = TiffSource::open_with_cache(&path, 2).unwrap();
        let region = ImageRegion::new(19990, 10, 10, 20);
        assert_eq!(source.read_region(region).unwrap(), raster.read_region(region).unwrap());
        assert!(source.read_region(ImageRegion::new(19990, 30, 11, 1)).is_err());
    }

    #[test]
    fn test_finalize_requires_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.tif");
        let mut sink = TiffSink::new(&path);
        assert!(sink.finalize().is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_rejects_mismatched_tile() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TiffSink::new(dir.path().join("out.tif"));
        sink.initialize(&RasterInfo::new(4, 4, 2)).unwrap();
        let tile = RegionBuffer::new(ImageRegion::new(0, 0, 2, 2), 1);
        assert!(sink.write_tile(&tile).is_err());
    }
}
