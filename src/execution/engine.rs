//! Serving facade.
//!
//! A [`ModelServer`] owns a loaded graph session and a serving setup. It
//! validates the setup, then streams tiles into a sink.

use crate::core::config::ServeConfig;
use crate::core::error::{ServeError, ServeResult, ValidationReport};
use crate::core::raster::RegionBuffer;
use crate::core::sink::{MemorySink, RasterSink};
use crate::core::types::{ConstantPlaceholder, OutputSpec, SourceSet};
use crate::execution::mapper::{compute_geometry, ServeGeometry};
use crate::execution::streaming::{StreamReport, StreamingController, StreamingOptions};
use crate::model::{GraphInfo, GraphSession, GraphSessionHost};
use crate::validation::{ServeSetup, ValidationPipeline};

/// A loaded model bound to its sources, constants and outputs.
pub struct ModelServer {
    session: Box<dyn GraphSession>,
    sources: SourceSet,
    constants: Vec<ConstantPlaceholder>,
    spec: OutputSpec,
    options: StreamingOptions,
    pipeline: ValidationPipeline,
}

impl std::fmt::Debug for ModelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelServer")
            .field("sources", &self.sources)
            .field("constants", &self.constants)
            .field("spec", &self.spec)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ModelServer {
    /// Create a server with default streaming options.
    pub fn new(session: Box<dyn GraphSession>, sources: SourceSet, spec: OutputSpec) -> Self {
        Self {
            session,
            sources,
            constants: Vec::new(),
            spec,
            options: StreamingOptions::default(),
            pipeline: ValidationPipeline::default_pipeline(),
        }
    }

    /// Build a server from a configuration, loading the model through `host`.
    pub fn from_config(config: &ServeConfig, host: &dyn GraphSessionHost) -> ServeResult<Self> {
        config.check()?;
        let constants = config.constant_placeholders()?;
        let sources = crate::io::open_sources(&config.sources)?;
        let session = host.load_model(&config.model)?;
        log::info!(
            "Loaded {} ({} input(s), {} output(s))",
            config.model.display(),
            session.info().inputs.len(),
            session.info().outputs.len()
        );

        Ok(Self::new(session, sources, config.output_spec())
            .with_constants(constants)
            .with_options(StreamingOptions::from(&config.tiling)))
    }

    /// Set the constant placeholders.
    pub fn with_constants(mut self, constants: Vec<ConstantPlaceholder>) -> Self {
        self.constants = constants;
        self
    }

    /// Add one constant placeholder.
    pub fn with_constant(mut self, constant: ConstantPlaceholder) -> Self {
        self.constants.push(constant);
        self
    }

    /// Set streaming options.
    pub fn with_options(mut self, options: StreamingOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the validation pipeline.
    pub fn with_pipeline(mut self, pipeline: ValidationPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Inputs and outputs of the loaded graph.
    pub fn graph_info(&self) -> &GraphInfo {
        self.session.info()
    }

    /// Configured sources.
    pub fn sources(&self) -> &SourceSet {
        &self.sources
    }

    /// Requested output.
    pub fn spec(&self) -> &OutputSpec {
        &self.spec
    }

    /// Streaming options.
    pub fn options(&self) -> &StreamingOptions {
        &self.options
    }

    fn setup(&self) -> ServeSetup<'_> {
        ServeSetup {
            sources: &self.sources,
            constants: &self.constants,
            spec: &self.spec,
            graph: self.session.info(),
        }
    }

    /// Run every validation stage and collect all problems.
    pub fn validate(&self) -> ValidationReport {
        self.pipeline.validate(&self.setup())
    }

    /// Output geometry of this setup.
    pub fn geometry(&self) -> ServeResult<ServeGeometry> {
        Ok(compute_geometry(&self.sources, &self.spec)?)
    }

    /// Validate, then build a controller for step-by-step streaming.
    pub fn controller(&self) -> ServeResult<StreamingController<'_>> {
        let report = self.validate();
        for warning in &report.warnings {
            log::warn!("{}", warning.message);
        }
        if !report.can_execute() {
            for line in report.detailed_errors() {
                log::error!("{}", line);
            }
        }
        report.into_result().map_err(ServeError::Config)?;
        self.controller_unchecked()
    }

    /// Build a controller without running the validation pipeline, for
    /// callers that already checked [`validate`](Self::validate). Tensor
    /// names and geometry are still checked.
    pub fn controller_unchecked(&self) -> ServeResult<StreamingController<'_>> {
        StreamingController::new(
            &self.sources,
            self.session.as_ref(),
            &self.constants,
            &self.spec,
            self.options.clone(),
        )
    }

    /// Stream the whole output into `sink`.
    pub fn serve(&self, sink: &mut dyn RasterSink) -> ServeResult<StreamReport> {
        self.controller()?.run(sink)
    }

    /// Stream the whole output into `sink`, skipping the validation pipeline.
    pub fn serve_unchecked(&self, sink: &mut dyn RasterSink) -> ServeResult<StreamReport> {
        self.controller_unchecked()?.run(sink)
    }

    /// Stream the whole output into memory.
    pub fn serve_to_memory(&self) -> ServeResult<(StreamReport, RegionBuffer)> {
        let mut sink = MemorySink::new();
        let report = self.serve(&mut sink)?;
        let buffer = sink
            .into_buffer()
            .ok_or_else(|| ServeError::Other("no tile was written".to_string()))?;
        Ok((report, buffer))
    }
}
