//! De-batching of graph outputs into output tiles.
//!
//! Every output tensor is brought to `[N, block_h, block_w, C]`:
//!
//! | rank | layout        | becomes            |
//! |------|---------------|--------------------|
//! | 1    | `[N]`         | `[N, 1, 1, 1]`     |
//! | 2    | `[N, C]`      | `[N, 1, 1, C]`     |
//! | 3    | `[N, H, W]`   | `[N, H, W, 1]`     |
//! | 4    | `[N, H, W, C]`| unchanged          |
//!
//! Blocks are laid out row-major over the FOE-aligned region and cropped to
//! the requested tile. Bands follow the output name order, then channel order.

use crate::core::error::{ExecutionError, ExecutionResult};
use crate::core::raster::RegionBuffer;
use crate::core::region::Size2D;
use crate::core::types::InferenceMode;
use crate::execution::mapper::TileMapping;
use indexmap::IndexMap;
use ndarray::{ArrayD, ArrayView4, Axis, Ix1, Ix2, Ix3, Ix4};

/// Assembles output tiles from named output tensors.
#[derive(Debug, Clone, Copy)]
pub struct OutputAssembler {
    foe: Size2D,
    mode: InferenceMode,
}

fn shape_mismatch(name: &str, expected: String, tensor: &ArrayD<f32>) -> ExecutionError {
    ExecutionError::ShapeMismatch {
        name: name.to_string(),
        expected,
        actual: format!("{:?}", tensor.shape()),
    }
}

/// Bring a tensor to NHWC.
fn normalise<'t>(name: &str, tensor: &'t ArrayD<f32>) -> ExecutionResult<ArrayView4<'t, f32>> {
    let view = tensor.view();
    let bad_rank = || shape_mismatch(name, "a tensor of rank 1 to 4".to_string(), tensor);
    let normalised = match tensor.ndim() {
        1 => view
            .into_dimensionality::<Ix1>()
            .map(|v| v.insert_axis(Axis(1)).insert_axis(Axis(2)).insert_axis(Axis(3))),
        2 => view
            .into_dimensionality::<Ix2>()
            .map(|v| v.insert_axis(Axis(1)).insert_axis(Axis(1))),
        3 => view.into_dimensionality::<Ix3>().map(|v| v.insert_axis(Axis(3))),
        4 => view.into_dimensionality::<Ix4>(),
        _ => return Err(bad_rank()),
    };
    normalised.map_err(|_| bad_rank())
}

/// Fail when a tile's band count differs from the one fixed by the first tile.
pub fn check_band_count(expected: usize, actual: usize) -> ExecutionResult<()> {
    if expected != actual {
        return Err(ExecutionError::ChannelMismatch { expected, actual });
    }
    Ok(())
}

impl OutputAssembler {
    /// Create an assembler for the given field of expression and mode.
    pub fn new(foe: Size2D, mode: InferenceMode) -> Self {
        Self { foe, mode }
    }

    /// Expected `(N, block height, block width)` for a mapping.
    pub fn expected_layout(&self, mapping: &TileMapping) -> (usize, usize, usize) {
        match self.mode {
            InferenceMode::PatchBased => (
                mapping.blocks.area() as usize,
                self.foe.height as usize,
                self.foe.width as usize,
            ),
            InferenceMode::FullyConvolutional => (
                1,
                mapping.aligned.height as usize,
                mapping.aligned.width as usize,
            ),
        }
    }

    /// Build the output tile of `mapping` from the graph outputs.
    pub fn assemble(&self, mapping: &TileMapping, outputs: &IndexMap<String, ArrayD<f32>>) -> ExecutionResult<RegionBuffer> {
        let (n, bh, bw) = self.expected_layout(mapping);

        let mut views = Vec::with_capacity(outputs.len());
        let mut bands = 0;
        for (name, tensor) in outputs {
            let view = normalise(name, tensor)?;
            let shape = view.shape();
            if shape[0] != n || shape[1] != bh || shape[2] != bw {
                return Err(shape_mismatch(name, format!("[{}, {}, {}, C]", n, bh, bw), tensor));
            }
            bands += shape[3];
            views.push(view);
        }

        let tile = mapping.tile;
        let aligned = mapping.aligned;
        let blocks_x = mapping.blocks.width as usize;
        let mut out = RegionBuffer::new(tile, bands);

        for ty in 0..tile.height {
            let ay = (tile.y + ty - aligned.y) as usize;
            for tx in 0..tile.width {
                let ax = (tile.x + tx - aligned.x) as usize;
                let (block, py, px) = match self.mode {
                    InferenceMode::PatchBased => ((ay / bh) * blocks_x + ax / bw, ay % bh, ax % bw),
                    InferenceMode::FullyConvolutional => (0, ay, ax),
                };

                let pixel = out.pixel_mut(tx, ty);
                let mut band = 0;
                for view in &views {
                    for c in 0..view.shape()[3] {
                        pixel[band] = view[[block, py, px, c]];
                        band += 1;
                    }
                }
            }
        }

        Ok(out)
    }
}
