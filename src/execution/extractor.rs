//! Patch extraction and batching.
//!
//! Each source's mapped region is read once, then cut into patches laid out
//! row-major in a single NHWC batch.

use crate::core::error::{ExecutionError, ExecutionResult, SourceIndex};
use crate::core::raster::RegionBuffer;
use crate::core::region::{ImageRegion, Size2D};
use crate::core::types::{PatchBatch, SourceBundle, SourceSet};
use crate::execution::mapper::{ExtractionPlan, InputRegion, TileMapping};
use ndarray::Array4;

/// Number of patch positions along one axis: `ceil((len - patch) / step) + 1`.
fn positions(len: u32, patch: u32, step: u32) -> u64 {
    ((len - patch) as u64).div_ceil(step as u64) + 1
}

/// Number of patches a region of size `region` yields under `plan`.
///
/// Returns `None` when the region is smaller than one patch.
pub fn patch_count(region: Size2D, plan: &ExtractionPlan) -> Option<u64> {
    if region.width < plan.patch.width || region.height < plan.patch.height {
        return None;
    }
    let x = positions(region.width, plan.patch.width, plan.step.width.max(1));
    let y = positions(region.height, plan.patch.height, plan.step.height.max(1));
    Some(x * y)
}

/// Cuts mapped input regions into patch batches.
pub struct PatchExtractor<'a> {
    sources: &'a SourceSet,
}

impl<'a> PatchExtractor<'a> {
    /// Create an extractor over `sources`.
    pub fn new(sources: &'a SourceSet) -> Self {
        Self { sources }
    }

    /// Extract one batch per source, in source order.
    pub fn extract(&self, mapping: &TileMapping) -> ExecutionResult<Vec<PatchBatch>> {
        mapping.inputs.iter().map(|input| self.extract_one(input)).collect()
    }

    /// Extract the batch of a single source.
    pub fn extract_one(&self, input: &InputRegion) -> ExecutionResult<PatchBatch> {
        let index = input.source_index;
        let bundle = self.sources.get(index).ok_or_else(|| ExecutionError::ReadBounds {
            source_index: index,
            region: input.region,
            reason: "source is not configured".to_string(),
        })?;
        extract_patches(index, bundle, input)
    }
}

/// Read `input.region` from `bundle` and batch its patches.
pub fn extract_patches(index: SourceIndex, bundle: &SourceBundle, input: &InputRegion) -> ExecutionResult<PatchBatch> {
    let region = input.region;
    let plan = &input.plan;
    let read_error = |reason: String| ExecutionError::ReadBounds {
        source_index: index,
        region,
        reason,
    };

    let actual = patch_count(region.size(), plan)
        .ok_or_else(|| read_error(format!("region is smaller than the {} patch", plan.patch)))?;
    let expected = plan.expected_patches();
    if actual != expected {
        return Err(ExecutionError::PatchCountMismatch {
            source_index: index,
            expected,
            actual,
        });
    }

    let buffer = bundle
        .image
        .read_region(region)
        .map_err(|e| read_error(e.to_string()))?;

    let data = batch_patches(&buffer, plan).map_err(read_error)?;
    Ok(PatchBatch {
        source_index: index,
        placeholder: bundle.placeholder.clone(),
        data,
    })
}

/// Copy every patch of `plan` out of `buffer` into an NHWC array.
fn batch_patches(buffer: &RegionBuffer, plan: &ExtractionPlan) -> Result<Array4<f32>, String> {
    let region = buffer.region();
    let bands = buffer.bands();
    let (pw, ph) = (plan.patch.width, plan.patch.height);
    let (nx, ny) = (plan.positions.width, plan.positions.height);

    let mut data = Vec::with_capacity(plan.expected_patches() as usize * (pw * ph) as usize * bands);
    for j in 0..ny {
        for i in 0..nx {
            let patch = ImageRegion::new(
                region.x + i * plan.step.width,
                region.y + j * plan.step.height,
                pw,
                ph,
            );
            if !region.contains_region(&patch) {
                return Err(format!("patch {} overruns the region", patch));
            }
            let local_x = (patch.x - region.x) as usize * bands;
            let row_len = pw as usize * bands;
            for row in 0..ph {
                let line = buffer.row(patch.y - region.y + row);
                data.extend_from_slice(&line[local_x..local_x + row_len]);
            }
        }
    }

    Array4::from_shape_vec((nx as usize * ny as usize, ph as usize, pw as usize, bands), data)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::raster::{MemoryRaster, RasterSource};
    use crate::core::types::OutputSpec;
    use crate::execution::mapper::RegionMapper;
    use std::sync::Arc;

    fn bundle(width: u32, height: u32, bands: usize, patch: u32) -> SourceBundle {
        let image: Arc<dyn RasterSource> = Arc::new(MemoryRaster::from_fn(width, height, bands, |x, y, b| {
            (y * 1000 + x) as f32 + b as f32 * 0.1
        }));
        SourceBundle::new(image, Size2D::square(patch), "x")
    }

    fn input(region: ImageRegion, patch: u32, step: u32, positions: u32) -> InputRegion {
        InputRegion {
            source_index: SourceIndex(0),
            region,
            plan: ExtractionPlan {
                patch: Size2D::square(patch),
                step: Size2D::square(step),
                positions: Size2D::square(positions),
            },
        }
    }

    #[test]
    fn test_patch_count_formula() {
        let plan = input(ImageRegion::default(), 16, 1, 8).plan;
        assert_eq!(patch_count(Size2D::square(23), &plan), Some(64));
        assert_eq!(patch_count(Size2D::new(23, 16), &plan), Some(8));
        assert_eq!(patch_count(Size2D::square(15), &plan), None);

        let plan = input(ImageRegion::default(), 4, 3, 3).plan;
        assert_eq!(patch_count(Size2D::square(10), &plan), Some(9));
        assert_eq!(patch_count(Size2D::square(11), &plan), Some(16));
    }

    #[test]
    fn test_extract_row_major_nhwc() {
        let source = bundle(10, 10, 2, 3);
        let batch = extract_patches(SourceIndex(0), &source, &input(ImageRegion::new(2, 1, 5, 5), 3, 2, 2)).unwrap();

        assert_eq!(batch.data.shape(), &[4, 3, 3, 2]);
        assert_eq!(batch.placeholder, "x");
        // Second patch starts two pixels right of the first.
        assert_eq!(batch.data[[1, 0, 0, 0]], 1004.0);
        assert_eq!(batch.data[[2, 0, 0, 0]], 3002.0);
        assert_eq!(batch.data[[3, 2, 1, 1]], 5005.1);
    }

    #[test]
    fn test_count_mismatch() {
        let source = bundle(10, 10, 1, 3);
        let err = extract_patches(SourceIndex(0), &source, &input(ImageRegion::new(0, 0, 6, 6), 3, 1, 3)).unwrap_err();
        assert_eq!(
            err,
            ExecutionError::PatchCountMismatch {
                source_index: SourceIndex(0),
                expected: 9,
                actual: 16,
            }
        );
    }

    #[test]
    fn test_overrunning_patch_is_read_error() {
        let source = bundle(20, 20, 1, 4);
        // ceil((12 - 4) / 3) + 1 = 4 positions; the last one ends at 13 > 12.
        let err = extract_patches(SourceIndex(0), &source, &input(ImageRegion::new(0, 0, 12, 12), 4, 3, 4)).unwrap_err();
        assert!(matches!(err, ExecutionError::ReadBounds { .. }));
    }

    #[test]
    fn test_region_outside_raster_is_read_error() {
        let source = bundle(8, 8, 1, 4);
        let err = extract_patches(SourceIndex(0), &source, &input(ImageRegion::new(6, 6, 4, 4), 4, 1, 1)).unwrap_err();
        assert!(matches!(err, ExecutionError::ReadBounds { .. }));
    }

    #[test]
    fn test_extract_from_mapping() {
        let sources = SourceSet::new().with_source(bundle(31, 31, 1, 16)).with_source(bundle(31, 31, 3, 8));
        let spec = OutputSpec::new(["out"]).with_foe(4, 4).with_spacing_scale(0.25);
        let mapper = RegionMapper::new(&sources, &spec).unwrap();
        let mapping = mapper.map(ImageRegion::new(0, 32, 32, 32)).unwrap();

        let batches = PatchExtractor::new(&sources).extract(&mapping).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].data.shape(), &[64, 16, 16, 1]);
        assert_eq!(batches[1].data.shape(), &[64, 8, 8, 3]);
        assert_eq!(batches[1].source_index, SourceIndex(1));
    }
}
