//! Core value types of a serving pass.
//!
//! Sources, constants and the output specification are built once at setup
//! and stay read-only while tiles stream. Patch batches are transient: one per
//! source and tile, consumed by the inference runner and dropped.

use crate::core::error::SourceIndex;
use crate::core::raster::RasterSource;
use crate::core::region::Size2D;
use indexmap::IndexMap;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One input source: a stacked raster, its field of view, and the graph
/// placeholder its patches are fed to.
#[derive(Clone)]
pub struct SourceBundle {
    /// Region-addressed raster (possibly a band stack).
    pub image: Arc<dyn RasterSource>,
    /// Field of view, in source pixels.
    pub patch_size: Size2D,
    /// Name of the graph input tensor.
    pub placeholder: String,
}

impl SourceBundle {
    /// Create a new bundle.
    pub fn new(image: Arc<dyn RasterSource>, patch_size: Size2D, placeholder: impl Into<String>) -> Self {
        Self {
            image,
            patch_size,
            placeholder: placeholder.into(),
        }
    }

    /// Number of bands the source feeds per pixel.
    pub fn channels(&self) -> usize {
        self.image.info().bands
    }
}

impl fmt::Debug for SourceBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceBundle")
            .field("image", &self.image.description())
            .field("patch_size", &self.patch_size)
            .field("placeholder", &self.placeholder)
            .finish()
    }
}

/// Ordered mapping from source index to bundle.
///
/// Every per-tile step iterates this mapping in index order, which keeps
/// placeholder binding deterministic.
#[derive(Debug, Clone, Default)]
pub struct SourceSet {
    bundles: IndexMap<SourceIndex, SourceBundle>,
}

impl SourceSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a bundle and return its index.
    pub fn push(&mut self, bundle: SourceBundle) -> SourceIndex {
        let index = SourceIndex(self.bundles.len());
        self.bundles.insert(index, bundle);
        index
    }

    /// Builder-style append.
    pub fn with_source(mut self, bundle: SourceBundle) -> Self {
        self.push(bundle);
        self
    }

    /// Get a bundle by index.
    pub fn get(&self, index: SourceIndex) -> Option<&SourceBundle> {
        self.bundles.get(&index)
    }

    /// Iterate bundles in index order.
    pub fn iter(&self) -> impl Iterator<Item = (SourceIndex, &SourceBundle)> {
        self.bundles.iter().map(|(index, bundle)| (*index, bundle))
    }

    /// Number of sources.
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Check if no source is configured.
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

/// How one graph invocation relates input patches to output pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    /// Each patch produces exactly one FOE-sized output block.
    #[default]
    PatchBased,
    /// One pass consumes a whole input region and yields the whole output region.
    FullyConvolutional,
}

impl InferenceMode {
    /// Mode from the `fully convolutional` flag.
    pub fn from_flag(fully_convolutional: bool) -> Self {
        if fully_convolutional {
            InferenceMode::FullyConvolutional
        } else {
            InferenceMode::PatchBased
        }
    }
}

/// What to fetch from the graph and how it maps onto the output grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Output tensor names; their order is the output band order.
    pub names: Vec<String>,
    /// Output pixel size divided by input pixel size.
    pub spacing_scale: f64,
    /// Output pixels produced per graph invocation (field of expression).
    pub foe: Size2D,
    /// Patch-based or fully convolutional inference.
    pub mode: InferenceMode,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            spacing_scale: 1.0,
            foe: Size2D::square(1),
            mode: InferenceMode::PatchBased,
        }
    }
}

impl OutputSpec {
    /// Spec fetching the given tensors with default geometry.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the spacing scale.
    pub fn with_spacing_scale(mut self, scale: f64) -> Self {
        self.spacing_scale = scale;
        self
    }

    /// Set the field of expression.
    pub fn with_foe(mut self, width: u32, height: u32) -> Self {
        self.foe = Size2D::new(width, height);
        self
    }

    /// Set the inference mode.
    pub fn with_mode(mut self, mode: InferenceMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Declared type of a user placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    /// 32-bit signed integer.
    Int,
    /// 32-bit float.
    Float,
    /// Boolean.
    Bool,
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::Int => "int",
            ScalarType::Float => "float",
            ScalarType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// A single scalar value fed to a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ScalarValue {
    /// Integer value.
    Int(i32),
    /// Float value.
    Float(f32),
    /// Boolean value.
    Bool(bool),
}

impl ScalarValue {
    /// Declared type of the value.
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarValue::Int(_) => ScalarType::Int,
            ScalarValue::Float(_) => ScalarType::Float,
            ScalarValue::Bool(_) => ScalarType::Bool,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Int(v) => write!(f, "{} (int)", v),
            ScalarValue::Float(v) => write!(f, "{} (float)", v),
            ScalarValue::Bool(v) => write!(f, "{} (bool)", v),
        }
    }
}

/// A constant placeholder, identical for every tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantPlaceholder {
    /// Graph input tensor name.
    pub name: String,
    /// Value bound to it.
    pub value: ScalarValue,
}

impl ConstantPlaceholder {
    /// Create a new constant.
    pub fn new(name: impl Into<String>, value: ScalarValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Patches extracted from one source for one tile, in NHWC layout.
#[derive(Debug, Clone)]
pub struct PatchBatch {
    /// Source the patches come from.
    pub source_index: SourceIndex,
    /// Placeholder the batch is bound to.
    pub placeholder: String,
    /// `[patches, patch_height, patch_width, channels]`.
    pub data: Array4<f32>,
}

impl PatchBatch {
    /// Number of patches in the batch.
    pub fn len(&self) -> usize {
        self.data.shape()[0]
    }

    /// Check if the batch holds no patch.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape of a single patch as `(height, width, channels)`.
    pub fn patch_shape(&self) -> (usize, usize, usize) {
        let shape = self.data.shape();
        (shape[1], shape[2], shape[3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::raster::MemoryRaster;

    fn bundle(name: &str) -> SourceBundle {
        SourceBundle::new(
            Arc::new(MemoryRaster::from_fn(8, 8, 3, |_, _, _| 0.0)),
            Size2D::square(4),
            name,
        )
    }

    #[test]
    fn test_source_set_indices_follow_insertion_order() {
        let mut sources = SourceSet::new();
        assert_eq!(sources.push(bundle("x1")), SourceIndex(0));
        assert_eq!(sources.push(bundle("x2")), SourceIndex(1));

        let names: Vec<_> = sources.iter().map(|(i, b)| (i.0, b.placeholder.clone())).collect();
        assert_eq!(names, vec![(0, "x1".to_string()), (1, "x2".to_string())]);
        assert_eq!(sources.get(SourceIndex(1)).unwrap().channels(), 3);
    }

    #[test]
    fn test_output_spec_builder() {
        let spec = OutputSpec::new(["a", "b"])
            .with_spacing_scale(0.5)
            .with_foe(2, 4)
            .with_mode(InferenceMode::from_flag(true));

        assert_eq!(spec.names, vec!["a", "b"]);
        assert_eq!(spec.foe, Size2D::new(2, 4));
        assert_eq!(spec.mode, InferenceMode::FullyConvolutional);
    }

    #[test]
    fn test_scalar_value_types() {
        assert_eq!(ScalarValue::Int(3).scalar_type(), ScalarType::Int);
        assert_eq!(ScalarValue::Bool(false).to_string(), "false (bool)");
    }
}
