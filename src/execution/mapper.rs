//! Output-to-input region mapping.
//!
//! All geometry is expressed in pixels of the reference grid, the grid of the
//! first source. Per axis, with `S = foe × spacing_scale` input pixels per
//! output block and `P` the largest patch:
//!
//! - every source is centred in the common receptive field with an in-field
//!   offset `c = (P - patch) / 2`
//! - the common extent `[L, R)` is the intersection of all source extents
//! - the output holds `n = (R - L - P) / S + 1` blocks of `foe` pixels
//!
//! A tile covering blocks `[b0, b1)` reads, from source `s` at offset `d`,
//! the input span starting at `L - d + b0·S + c` of length
//! `(b1 - b0 - 1)·S + patch`.

use crate::core::error::{ConfigError, ConfigResult, ExecutionError, ExecutionResult, SourceIndex};
use crate::core::raster::{GeoTransform, RasterInfo};
use crate::core::region::{ImageRegion, Size2D};
use crate::core::types::{InferenceMode, OutputSpec, SourceSet};
use serde::Serialize;

/// Tolerance used for whole-pixel checks.
const PIXEL_TOLERANCE: f64 = 1e-6;

/// How patches are cut out of one mapped input region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtractionPlan {
    /// Patch size, in source pixels.
    pub patch: Size2D,
    /// Distance between consecutive patches, in source pixels.
    pub step: Size2D,
    /// Number of patch positions expected along x and y.
    pub positions: Size2D,
}

impl ExtractionPlan {
    /// Total number of patches expected.
    pub fn expected_patches(&self) -> u64 {
        self.positions.area()
    }
}

/// Input region of one source for one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InputRegion {
    /// Source the region belongs to.
    pub source_index: SourceIndex,
    /// Region in the source's own pixel grid, clipped to its extent.
    pub region: ImageRegion,
    /// Patch layout inside the region.
    pub plan: ExtractionPlan,
}

/// Everything needed to compute one output tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileMapping {
    /// Requested output tile.
    pub tile: ImageRegion,
    /// Tile enlarged to whole FOE blocks.
    pub aligned: ImageRegion,
    /// FOE blocks covered along x and y.
    pub blocks: Size2D,
    /// Inference mode the plans were built for.
    pub mode: InferenceMode,
    /// Per-source input regions, in source order.
    pub inputs: Vec<InputRegion>,
}

/// Placement of one source relative to the reference grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourcePlacement {
    /// Source index.
    pub source_index: SourceIndex,
    /// Origin of the source, in reference pixels.
    pub offset: (i64, i64),
    /// Patch size.
    pub patch: Size2D,
    /// In-field offset inside the common receptive field.
    pub centre: (u32, u32),
    /// Source raster size.
    pub extent: Size2D,
}

/// Geometry of a serving pass, fixed at setup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServeGeometry {
    /// Inference mode.
    pub mode: InferenceMode,
    /// Field of expression, in output pixels.
    pub foe: Size2D,
    /// Input pixels per FOE block.
    pub step: Size2D,
    /// Largest patch, the common receptive field.
    pub receptive_field: Size2D,
    /// Start of the common extent, in reference pixels.
    pub origin: (i64, i64),
    /// Number of FOE blocks in the full output.
    pub blocks: Size2D,
    /// Full output size, in output pixels.
    pub output_size: Size2D,
    /// Georeferencing of the output grid.
    pub output_geo: GeoTransform,
    /// Source placements, in source order.
    pub sources: Vec<SourcePlacement>,
}

impl ServeGeometry {
    /// The full output as a region.
    pub fn output_region(&self) -> ImageRegion {
        ImageRegion::from_size(self.output_size)
    }

    /// Output raster metadata for a given band count.
    pub fn output_info(&self, bands: usize) -> RasterInfo {
        RasterInfo::new(self.output_size.width, self.output_size.height, bands).with_geo(self.output_geo)
    }
}

fn integral_step(foe: u32, scale: f64, axis: &str) -> ConfigResult<u32> {
    let step = foe as f64 * scale;
    let rounded = step.round();
    if rounded < 1.0 || (step - rounded).abs() > PIXEL_TOLERANCE {
        return Err(ConfigError::Alignment {
            context: format!("output {} axis", axis),
            reason: format!(
                "field of expression {} times spacing scale {} is {} input pixels, not a positive whole number",
                foe, scale, step
            ),
        });
    }
    Ok(rounded as u32)
}

fn integral_offset(offset: f64, source_index: SourceIndex, axis: &str) -> ConfigResult<i64> {
    let rounded = offset.round();
    if (offset - rounded).abs() > PIXEL_TOLERANCE {
        return Err(ConfigError::GridMismatch {
            source_index,
            reason: format!("origin is {} reference pixels away along {}", offset, axis),
        });
    }
    Ok(rounded as i64)
}

/// Per-axis extent computation shared by x and y.
struct Axis {
    origin: i64,
    blocks: u32,
}

fn common_axis(spans: &[(i64, u32)], receptive: u32, step: u32, axis: &str) -> ConfigResult<Axis> {
    let left = spans.iter().map(|(d, _)| *d).max().unwrap_or(0);
    let right = spans.iter().map(|(d, size)| d + *size as i64).min().unwrap_or(0);
    let available = right - left;
    if available < receptive as i64 {
        return Err(ConfigError::EmptyOutput {
            reason: format!(
                "sources overlap on {} pixels along {}, less than the {} pixel receptive field",
                available.max(0),
                axis,
                receptive
            ),
        });
    }
    let blocks = (available - receptive as i64) / step as i64 + 1;
    Ok(Axis {
        origin: left,
        blocks: blocks as u32,
    })
}

/// Compute the serving geometry of `sources` for `spec`.
///
/// In patch mode every patch must span at least one output block, measured
/// in input pixels (`foe * spacing_scale`), not in output pixels.
pub fn compute_geometry(sources: &SourceSet, spec: &OutputSpec) -> ConfigResult<ServeGeometry> {
    let (_, reference) = sources.iter().next().ok_or(ConfigError::NoSources)?;
    if spec.foe.is_empty() {
        return Err(ConfigError::InvalidParameter {
            parameter: "output.foe".to_string(),
            reason: "must be at least 1x1".to_string(),
        });
    }
    if !(spec.spacing_scale.is_finite() && spec.spacing_scale > 0.0) {
        return Err(ConfigError::InvalidParameter {
            parameter: "output.spacing_scale".to_string(),
            reason: "must be strictly positive".to_string(),
        });
    }

    let step = Size2D::new(
        integral_step(spec.foe.width, spec.spacing_scale, "x")?,
        integral_step(spec.foe.height, spec.spacing_scale, "y")?,
    );

    let ref_geo = reference.image.info().geo;
    let mut receptive = Size2D::default();
    let mut offsets = Vec::with_capacity(sources.len());
    for (index, bundle) in sources.iter() {
        let info = bundle.image.info();
        if !ref_geo.same_spacing(&info.geo, PIXEL_TOLERANCE) {
            return Err(ConfigError::GridMismatch {
                source_index: index,
                reason: format!(
                    "pixel spacing {}x{} differs from the reference {}x{}",
                    info.geo.spacing_x, info.geo.spacing_y, ref_geo.spacing_x, ref_geo.spacing_y
                ),
            });
        }
        if bundle.patch_size.is_empty() {
            return Err(ConfigError::InvalidParameter {
                parameter: format!("{}.patch", index),
                reason: "must be at least 1x1".to_string(),
            });
        }
        let (dx, dy) = ref_geo.pixel_offset_of(&info.geo);
        offsets.push((integral_offset(dx, index, "x")?, integral_offset(dy, index, "y")?));

        if spec.mode == InferenceMode::PatchBased
            && (bundle.patch_size.width < step.width || bundle.patch_size.height < step.height)
        {
            return Err(ConfigError::Alignment {
                context: index.to_string(),
                reason: format!(
                    "patch {} is smaller than the {} input pixels covered by one output block",
                    bundle.patch_size, step
                ),
            });
        }
        receptive.width = receptive.width.max(bundle.patch_size.width);
        receptive.height = receptive.height.max(bundle.patch_size.height);
    }

    let spans_x: Vec<_> = sources.iter().zip(&offsets).map(|((_, b), o)| (o.0, b.image.info().width)).collect();
    let spans_y: Vec<_> = sources.iter().zip(&offsets).map(|((_, b), o)| (o.1, b.image.info().height)).collect();
    let axis_x = common_axis(&spans_x, receptive.width, step.width, "x")?;
    let axis_y = common_axis(&spans_y, receptive.height, step.height, "y")?;

    let placements = sources
        .iter()
        .zip(&offsets)
        .map(|((index, bundle), offset)| SourcePlacement {
            source_index: index,
            offset: *offset,
            patch: bundle.patch_size,
            centre: (
                (receptive.width - bundle.patch_size.width) / 2,
                (receptive.height - bundle.patch_size.height) / 2,
            ),
            extent: bundle.image.info().size(),
        })
        .collect();

    let blocks = Size2D::new(axis_x.blocks, axis_y.blocks);
    let shift = |origin: i64, field: u32, step: u32| origin as f64 + field as f64 / 2.0 - step as f64 / 2.0;
    let output_geo = ref_geo
        .shifted(
            shift(axis_x.origin, receptive.width, step.width),
            shift(axis_y.origin, receptive.height, step.height),
        )
        .scaled(spec.spacing_scale, spec.spacing_scale);

    Ok(ServeGeometry {
        mode: spec.mode,
        foe: spec.foe,
        step,
        receptive_field: receptive,
        origin: (axis_x.origin, axis_y.origin),
        blocks,
        output_size: Size2D::new(blocks.width * spec.foe.width, blocks.height * spec.foe.height),
        output_geo,
        sources: placements,
    })
}

/// Clip the span `[start, start + len)` to `[0, limit)`.
fn clip_span(start: i64, len: i64, limit: u32) -> Option<(u32, u32)> {
    let lo = start.max(0);
    let hi = (start + len).min(limit as i64);
    if hi <= lo {
        return None;
    }
    Some((lo as u32, (hi - lo) as u32))
}

/// Map an output tile to the input region of every source.
pub fn map_output_to_inputs(geometry: &ServeGeometry, tile: ImageRegion) -> ExecutionResult<TileMapping> {
    if tile.is_empty() {
        return Err(ExecutionError::Splitting(format!("cannot map empty tile {}", tile)));
    }

    let foe = geometry.foe;
    let b0 = (tile.x / foe.width, tile.y / foe.height);
    let b1 = (tile.right().div_ceil(foe.width), tile.bottom().div_ceil(foe.height));
    let blocks = Size2D::new(b1.0 - b0.0, b1.1 - b0.1);
    let aligned = ImageRegion::new(
        b0.0 * foe.width,
        b0.1 * foe.height,
        blocks.width * foe.width,
        blocks.height * foe.height,
    );

    let step = geometry.step;
    let mut inputs = Vec::with_capacity(geometry.sources.len());
    for source in &geometry.sources {
        let x = geometry.origin.0 - source.offset.0 + (b0.0 as i64) * step.width as i64 + source.centre.0 as i64;
        let y = geometry.origin.1 - source.offset.1 + (b0.1 as i64) * step.height as i64 + source.centre.1 as i64;
        let w = (blocks.width as i64 - 1) * step.width as i64 + source.patch.width as i64;
        let h = (blocks.height as i64 - 1) * step.height as i64 + source.patch.height as i64;

        let clipped = clip_span(x, w, source.extent.width).zip(clip_span(y, h, source.extent.height));
        let ((rx, rw), (ry, rh)) = clipped.ok_or_else(|| ExecutionError::OutOfBounds {
            source_index: source.source_index,
            region: ImageRegion::new(x.max(0) as u32, y.max(0) as u32, w as u32, h as u32),
            extent: source.extent,
        })?;
        let region = ImageRegion::new(rx, ry, rw, rh);

        let plan = match geometry.mode {
            InferenceMode::PatchBased => ExtractionPlan {
                patch: source.patch,
                step,
                positions: blocks,
            },
            InferenceMode::FullyConvolutional => ExtractionPlan {
                patch: region.size(),
                step: region.size(),
                positions: Size2D::square(1),
            },
        };

        inputs.push(InputRegion {
            source_index: source.source_index,
            region,
            plan,
        });
    }

    Ok(TileMapping {
        tile,
        aligned,
        blocks,
        mode: geometry.mode,
        inputs,
    })
}

/// Pure output-to-input mapper over a fixed geometry.
#[derive(Debug, Clone)]
pub struct RegionMapper {
    geometry: ServeGeometry,
}

impl RegionMapper {
    /// Build the mapper, validating the geometry of `sources` against `spec`.
    pub fn new(sources: &SourceSet, spec: &OutputSpec) -> ConfigResult<Self> {
        let geometry = compute_geometry(sources, spec)?;
        log::debug!(
            "Output grid {} ({} blocks of {}), receptive field {}, step {}",
            geometry.output_size,
            geometry.blocks,
            geometry.foe,
            geometry.receptive_field,
            geometry.step
        );
        Ok(Self { geometry })
    }

    /// Geometry the mapper was built with.
    pub fn geometry(&self) -> &ServeGeometry {
        &self.geometry
    }

    /// The full output region.
    pub fn output_region(&self) -> ImageRegion {
        self.geometry.output_region()
    }

    /// Map an output tile to its per-source input regions.
    pub fn map(&self, tile: ImageRegion) -> ExecutionResult<TileMapping> {
        map_output_to_inputs(&self.geometry, tile)
    }
}
