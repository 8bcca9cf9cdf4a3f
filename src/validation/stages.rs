//! Individual validation stages.
//!
//! Each stage checks for a specific category of setup errors.

use crate::core::error::{ConfigError, SourceIndex, ValidationWarning};
use crate::core::types::{ConstantPlaceholder, InferenceMode, OutputSpec, SourceSet};
use crate::execution::mapper::compute_geometry;
use crate::execution::runner::probe_all;
use crate::model::GraphInfo;
use std::collections::HashSet;

/// Everything a serving pass is set up from.
#[derive(Debug, Clone, Copy)]
pub struct ServeSetup<'a> {
    /// Input sources.
    pub sources: &'a SourceSet,
    /// User constants.
    pub constants: &'a [ConstantPlaceholder],
    /// Requested output.
    pub spec: &'a OutputSpec,
    /// Inputs and outputs of the loaded graph.
    pub graph: &'a GraphInfo,
}

/// Trait for validation stages.
pub trait ValidationStage: Send + Sync {
    /// Name of this validation stage.
    fn name(&self) -> &str;

    /// Validate the setup.
    ///
    /// Returns Ok with warnings, or Err with errors.
    fn validate(&self, setup: &ServeSetup<'_>) -> Result<Vec<ValidationWarning>, Vec<ConfigError>>;
}

fn finish(errors: Vec<ConfigError>, warnings: Vec<ValidationWarning>) -> Result<Vec<ValidationWarning>, Vec<ConfigError>> {
    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(errors)
    }
}

/// Placeholder validation - checks the bindings themselves.
///
/// Verifies:
/// - At least one source and one output are configured
/// - Every placeholder name is non-empty and bound once
/// - No output is requested twice
pub struct PlaceholderValidation;

impl ValidationStage for PlaceholderValidation {
    fn name(&self) -> &str {
        "Placeholder Validation"
    }

    fn validate(&self, setup: &ServeSetup<'_>) -> Result<Vec<ValidationWarning>, Vec<ConfigError>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if setup.sources.is_empty() {
            errors.push(ConfigError::NoSources);
        }
        if setup.spec.names.is_empty() {
            errors.push(ConfigError::NoOutputs);
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        for (index, bundle) in setup.sources.iter() {
            if bundle.placeholder.trim().is_empty() {
                errors.push(ConfigError::InvalidParameter {
                    parameter: format!("{}.placeholder", index),
                    reason: "must not be empty".to_string(),
                });
            }
            if bundle.channels() == 0 {
                warnings.push(ValidationWarning {
                    message: format!("{} has no bands", index),
                    source_index: Some(index),
                    suggestion: Some("Check the image list of this source".to_string()),
                });
            }
        }

        let mut bound = HashSet::new();
        let names = setup
            .sources
            .iter()
            .map(|(_, b)| b.placeholder.as_str())
            .chain(setup.constants.iter().map(|c| c.name.as_str()));
        for name in names {
            if !bound.insert(name) {
                errors.push(ConfigError::DuplicatePlaceholder { name: name.to_string() });
            }
        }

        let mut requested = HashSet::new();
        for name in &setup.spec.names {
            if !requested.insert(name.as_str()) {
                errors.push(ConfigError::InvalidParameter {
                    parameter: "output.names".to_string(),
                    reason: format!("'{}' is requested more than once", name),
                });
            }
        }

        finish(errors, warnings)
    }
}

/// Geometry validation - checks that the sources and output grid line up.
///
/// Verifies:
/// - Sources share the reference spacing and sit on whole-pixel offsets
/// - The field of expression maps onto whole input pixels
/// - The sources overlap on at least one receptive field
pub struct GeometryValidation;

impl ValidationStage for GeometryValidation {
    fn name(&self) -> &str {
        "Geometry Validation"
    }

    fn validate(&self, setup: &ServeSetup<'_>) -> Result<Vec<ValidationWarning>, Vec<ConfigError>> {
        let geometry = compute_geometry(setup.sources, setup.spec).map_err(|e| vec![e])?;
        let mut warnings = Vec::new();

        let field = geometry.receptive_field;
        for placement in &geometry.sources {
            let odd_x = (field.width - placement.patch.width) % 2 == 1;
            let odd_y = (field.height - placement.patch.height) % 2 == 1;
            if odd_x || odd_y {
                warnings.push(ValidationWarning {
                    message: format!(
                        "{} patch {} cannot be exactly centred in the {} receptive field",
                        placement.source_index, placement.patch, field
                    ),
                    source_index: Some(placement.source_index),
                    suggestion: Some(
                        "Use patch sizes with the same parity; the patch is shifted half a pixel up-left"
                            .to_string(),
                    ),
                });
            }
        }

        if geometry.mode == InferenceMode::FullyConvolutional && setup.spec.foe.area() > 1 {
            warnings.push(ValidationWarning {
                message: format!(
                    "Field of expression {} only aligns tiles in fully convolutional mode",
                    geometry.foe
                ),
                source_index: None,
                suggestion: None,
            });
        }

        Ok(warnings)
    }
}

/// Tensor validation - checks every name against the loaded graph.
///
/// Verifies:
/// - Source placeholders, constants and outputs exist in the graph
///
/// Warns about graph inputs nobody feeds and about fixed input dimensions
/// that disagree with the configured patches.
pub struct TensorValidation;

impl ValidationStage for TensorValidation {
    fn name(&self) -> &str {
        "Tensor Validation"
    }

    fn validate(&self, setup: &ServeSetup<'_>) -> Result<Vec<ValidationWarning>, Vec<ConfigError>> {
        let errors: Vec<_> = probe_all(setup.graph, setup.sources, setup.constants, &setup.spec.names)
            .into_iter()
            // Reported by the placeholder stage.
            .filter(|e| {
                !matches!(
                    e,
                    ConfigError::DuplicatePlaceholder { .. } | ConfigError::InvalidParameter { .. }
                )
            })
            .collect();
        let mut warnings = Vec::new();

        let fed: HashSet<&str> = setup
            .sources
            .iter()
            .map(|(_, b)| b.placeholder.as_str())
            .chain(setup.constants.iter().map(|c| c.name.as_str()))
            .collect();
        for input in &setup.graph.inputs {
            if !fed.contains(input.name.as_str()) {
                warnings.push(ValidationWarning {
                    message: format!("Graph input '{}' is not fed", input.name),
                    source_index: None,
                    suggestion: Some(format!("Bind '{}' to a source or a constant", input.name)),
                });
            }
        }

        for (index, bundle) in setup.sources.iter() {
            let Some(input) = setup.graph.input(&bundle.placeholder) else {
                continue;
            };
            if let Some(reason) = shape_disagreement(setup, index, &input.shape) {
                warnings.push(ValidationWarning {
                    message: format!("Placeholder '{}' {}", input.name, reason),
                    source_index: Some(index),
                    suggestion: None,
                });
            }
        }

        finish(errors, warnings)
    }
}

/// Compare fixed NHWC dimensions of a source placeholder with its patches.
fn shape_disagreement(setup: &ServeSetup<'_>, index: SourceIndex, shape: &[Option<usize>]) -> Option<String> {
    if shape.len() != 4 {
        return Some(format!("has rank {}, patches are fed as rank 4", shape.len()));
    }
    let bundle = setup.sources.get(index)?;
    // Fully convolutional passes feed whole tiles, so only channels are fixed.
    let spatial = setup.spec.mode == InferenceMode::PatchBased;
    let expected = [
        (1, bundle.patch_size.height as usize, "height", spatial),
        (2, bundle.patch_size.width as usize, "width", spatial),
        (3, bundle.channels(), "channel count", true),
    ];
    for (axis, value, what, checked) in expected {
        match shape[axis] {
            Some(dim) if checked && dim != value => {
                return Some(format!("expects {} {} but {} provides {}", what, dim, index, value));
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::raster::{MemoryRaster, RasterSource};
    use crate::core::region::Size2D;
    use crate::core::types::{ScalarValue, SourceBundle};
    use crate::model::TensorInfo;
    use std::sync::Arc;

    fn graph() -> GraphInfo {
        GraphInfo {
            inputs: vec![
                TensorInfo::new("x1", vec![None, Some(16), Some(16), Some(1)]),
                TensorInfo::new("x2", vec![None, Some(8), Some(8), Some(1)]),
                TensorInfo::new("training", vec![]),
            ],
            outputs: vec![TensorInfo::new("out", vec![None, Some(4), Some(4), Some(1)])],
        }
    }

    fn sources(second_patch: u32) -> SourceSet {
        let image = || -> Arc<dyn RasterSource> { Arc::new(MemoryRaster::from_fn(31, 31, 1, |_, _, _| 0.0)) };
        SourceSet::new()
            .with_source(SourceBundle::new(image(), Size2D::square(16), "x1"))
            .with_source(SourceBundle::new(image(), Size2D::square(second_patch), "x2"))
    }

    fn spec() -> OutputSpec {
        OutputSpec::new(["out"]).with_foe(4, 4).with_spacing_scale(0.25)
    }

    #[test]
    fn test_placeholder_validation_missing_outputs() {
        let sources = sources(8);
        let spec = OutputSpec::new(Vec::<String>::new());
        let graph = graph();
        let setup = ServeSetup {
            sources: &sources,
            constants: &[],
            spec: &spec,
            graph: &graph,
        };
        let errors = PlaceholderValidation.validate(&setup).unwrap_err();
        assert_eq!(errors, vec![ConfigError::NoOutputs]);
    }

    #[test]
    fn test_placeholder_validation_duplicates() {
        let sources = sources(8);
        let constants = vec![ConstantPlaceholder::new("x2", ScalarValue::Bool(false))];
        let spec = OutputSpec::new(["out", "out"]);
        let graph = graph();
        let setup = ServeSetup {
            sources: &sources,
            constants: &constants,
            spec: &spec,
            graph: &graph,
        };
        let errors = PlaceholderValidation.validate(&setup).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], ConfigError::DuplicatePlaceholder { name: "x2".to_string() });
        assert!(matches!(errors[1], ConfigError::InvalidParameter { ref parameter, .. } if parameter == "output.names"));
    }

    #[test]
    fn test_geometry_validation_parity_warning() {
        let spec = spec();
        let graph = graph();
        let even = sources(8);
        let setup = ServeSetup {
            sources: &even,
            constants: &[],
            spec: &spec,
            graph: &graph,
        };
        assert!(GeometryValidation.validate(&setup).unwrap().is_empty());

        let odd = sources(7);
        let setup = ServeSetup { sources: &odd, ..setup };
        let warnings = GeometryValidation.validate(&setup).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].source_index, Some(SourceIndex(1)));
    }

    #[test]
    fn test_geometry_validation_alignment_error() {
        let sources = sources(8);
        let spec = OutputSpec::new(["out"]).with_foe(3, 3).with_spacing_scale(0.5);
        let graph = graph();
        let setup = ServeSetup {
            sources: &sources,
            constants: &[],
            spec: &spec,
            graph: &graph,
        };
        let errors = GeometryValidation.validate(&setup).unwrap_err();
        assert!(matches!(errors[0], ConfigError::Alignment { .. }));
    }

    #[test]
    fn test_tensor_validation() {
        let sources = sources(8);
        let spec = spec();
        let graph = graph();
        let setup = ServeSetup {
            sources: &sources,
            constants: &[],
            spec: &spec,
            graph: &graph,
        };
        let warnings = TensorValidation.validate(&setup).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("training"));

        let wrong = OutputSpec::new(["logits"]).with_foe(4, 4).with_spacing_scale(0.25);
        let setup = ServeSetup { spec: &wrong, ..setup };
        let errors = TensorValidation.validate(&setup).unwrap_err();
        assert!(matches!(errors[0], ConfigError::UnknownTensor { ref name, .. } if name == "logits"));
    }

    #[test]
    fn test_tensor_validation_shape_warning() {
        let sources = sources(6);
        let spec = OutputSpec::new(["out"]);
        let graph = graph();
        let constants = vec![ConstantPlaceholder::new("training", ScalarValue::Bool(false))];
        let setup = ServeSetup {
            sources: &sources,
            constants: &constants,
            spec: &spec,
            graph: &graph,
        };
        let warnings = TensorValidation.validate(&setup).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("expects height 8"));
    }
}
