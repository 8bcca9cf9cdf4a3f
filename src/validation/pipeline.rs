//! Validation pipeline implementation.

use crate::core::error::ValidationReport;
use crate::validation::stages::{
    GeometryValidation, PlaceholderValidation, ServeSetup, TensorValidation, ValidationStage,
};
use std::time::Instant;

/// Multi-stage validation pipeline.
///
/// Runs a series of validation stages on a serving setup to catch errors
/// before the first tile is processed.
pub struct ValidationPipeline {
    stages: Vec<Box<dyn ValidationStage>>,
}

impl ValidationPipeline {
    /// Create a new pipeline with the given stages.
    pub fn new(stages: Vec<Box<dyn ValidationStage>>) -> Self {
        Self { stages }
    }

    /// Create the default validation pipeline with all standard stages.
    pub fn default_pipeline() -> Self {
        Self {
            stages: vec![
                Box::new(PlaceholderValidation),
                Box::new(GeometryValidation),
                Box::new(TensorValidation),
            ],
        }
    }

    /// Create a minimal pipeline (bindings and tensor names only).
    pub fn minimal_pipeline() -> Self {
        Self {
            stages: vec![Box::new(PlaceholderValidation), Box::new(TensorValidation)],
        }
    }

    /// Add a custom validation stage.
    pub fn add_stage(&mut self, stage: Box<dyn ValidationStage>) {
        self.stages.push(stage);
    }

    /// Names of the stages, in run order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Validate a setup through all stages.
    pub fn validate(&self, setup: &ServeSetup<'_>) -> ValidationReport {
        let start = Instant::now();
        let mut report = ValidationReport::new();

        for stage in &self.stages {
            match stage.validate(setup) {
                Ok(warnings) => {
                    for warning in warnings {
                        report.add_warning(warning);
                    }
                }
                Err(errors) => {
                    for error in errors {
                        let is_fatal = error.is_fatal();
                        report.add_error(error);

                        // Later stages assume sources and outputs exist
                        if is_fatal {
                            log::debug!("{} stopped the pipeline", stage.name());
                            report.duration_ms = start.elapsed().as_millis() as u64;
                            return report;
                        }
                    }
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        report
    }

    /// Quick validation - just check if streaming may start.
    pub fn can_execute(&self, setup: &ServeSetup<'_>) -> bool {
        self.validate(setup).can_execute()
    }
}

impl Default for ValidationPipeline {
    fn default() -> Self {
        Self::default_pipeline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ConfigError;
    use crate::core::raster::{MemoryRaster, RasterSource};
    use crate::core::region::Size2D;
    use crate::core::types::{OutputSpec, SourceBundle, SourceSet};
    use crate::model::{GraphInfo, TensorInfo};
    use std::sync::Arc;

    fn graph() -> GraphInfo {
        GraphInfo {
            inputs: vec![TensorInfo::new("x", vec![None, Some(5), Some(5), Some(2)])],
            outputs: vec![TensorInfo::new("y", vec![None, Some(1)])],
        }
    }

    fn sources(size: u32) -> SourceSet {
        let image: Arc<dyn RasterSource> = Arc::new(MemoryRaster::from_fn(size, size, 2, |_, _, _| 1.0));
        SourceSet::new().with_source(SourceBundle::new(image, Size2D::square(5), "x"))
    }

    #[test]
    fn test_valid_setup() {
        let sources = sources(20);
        let spec = OutputSpec::new(["y"]);
        let graph = graph();
        let setup = ServeSetup {
            sources: &sources,
            constants: &[],
            spec: &spec,
            graph: &graph,
        };

        let pipeline = ValidationPipeline::default_pipeline();
        let report = pipeline.validate(&setup);
        assert!(report.can_execute(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
        assert_eq!(
            pipeline.stage_names(),
            vec!["Placeholder Validation", "Geometry Validation", "Tensor Validation"]
        );
    }

    #[test]
    fn test_fatal_error_stops_pipeline() {
        let sources = SourceSet::new();
        let spec = OutputSpec::new(["missing"]);
        let graph = graph();
        let setup = ServeSetup {
            sources: &sources,
            constants: &[],
            spec: &spec,
            graph: &graph,
        };

        let report = ValidationPipeline::default_pipeline().validate(&setup);
        assert_eq!(report.errors, vec![ConfigError::NoSources]);
    }

    #[test]
    fn test_errors_from_several_stages_are_collected() {
        let sources = sources(20);
        let spec = OutputSpec::new(["y", "z"]).with_foe(3, 3).with_spacing_scale(0.5);
        let graph = graph();
        let setup = ServeSetup {
            sources: &sources,
            constants: &[],
            spec: &spec,
            graph: &graph,
        };

        let report = ValidationPipeline::default_pipeline().validate(&setup);
        assert!(!report.can_execute());
        assert_eq!(report.errors.len(), 2);
        assert!(matches!(report.errors[0], ConfigError::Alignment { .. }));
        assert!(matches!(report.errors[1], ConfigError::UnknownTensor { .. }));

        let minimal = ValidationPipeline::minimal_pipeline().validate(&setup);
        assert_eq!(minimal.errors.len(), 1);
    }

    #[test]
    fn test_empty_output_is_fatal() {
        let sources = sources(4);
        let spec = OutputSpec::new(["y"]);
        let graph = graph();
        let setup = ServeSetup {
            sources: &sources,
            constants: &[],
            spec: &spec,
            graph: &graph,
        };
        let report = ValidationPipeline::default_pipeline().validate(&setup);
        assert!(matches!(report.errors.as_slice(), [ConfigError::EmptyOutput { .. }]));
    }
}
