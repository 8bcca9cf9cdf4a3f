//! Error types for patchserve.
//!
//! Uses thiserror for structured errors with context. Errors are split by the
//! moment they can occur:
//! - [`ConfigError`]: detected at setup, before any tile is processed
//! - [`ExecutionError`]: raised while streaming, always fatal for the whole pass
//! - [`ModelLoadError`], [`ExpressionError`], [`RasterError`]: collaborator failures
//!
//! [`ServeError`] wraps all of them and tags execution failures with the
//! pipeline [`Stage`] and the tile that was being processed.

use crate::core::region::{ImageRegion, Size2D};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Explicit index of an input source, in configuration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceIndex(pub usize);

impl fmt::Display for SourceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Sources are numbered from 1 on the command line.
        write!(f, "source{}", self.0 + 1)
    }
}

/// Pipeline stage that produced an execution error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Output tile to input region translation.
    Mapping,
    /// Patch extraction and batching.
    Extraction,
    /// Graph execution.
    Inference,
    /// De-batching into the output tile.
    Assembly,
    /// Tile grid computation.
    Splitting,
    /// Writing a finished tile to the sink.
    Writing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Mapping => "mapping",
            Stage::Extraction => "extraction",
            Stage::Inference => "inference",
            Stage::Assembly => "assembly",
            Stage::Splitting => "splitting",
            Stage::Writing => "writing",
        };
        f.write_str(name)
    }
}

/// What a configured tensor name is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorRole {
    /// Placeholder fed with patches from a source.
    SourcePlaceholder,
    /// Placeholder fed with a user constant.
    UserPlaceholder,
    /// Requested output tensor.
    Output,
}

impl fmt::Display for TensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TensorRole::SourcePlaceholder => "source placeholder",
            TensorRole::UserPlaceholder => "user placeholder",
            TensorRole::Output => "output tensor",
        };
        f.write_str(name)
    }
}

/// Top-level error type for patchserve.
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Model error: {0}")]
    Model(#[from] ModelLoadError),

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Raster error: {0}")]
    Raster(#[from] RasterError),

    #[error("{stage} failed on tile {tile}: {error}")]
    Tile {
        stage: Stage,
        tile: ImageRegion,
        #[source]
        error: ExecutionError,
    },

    #[error("Streaming cancelled after {completed}/{total} tiles")]
    Cancelled { completed: usize, total: usize },

    #[error("Invalid configuration file: {0}")]
    ConfigFile(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors detected while setting up a serving pass.
///
/// These are always fatal and are reported before any tile is processed.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("No input source configured")]
    NoSources,

    #[error("No output tensor requested")]
    NoOutputs,

    #[error("Tensor '{name}' ({role}) does not exist in the loaded graph")]
    UnknownTensor { name: String, role: TensorRole },

    #[error("Placeholder name '{name}' is bound more than once")]
    DuplicatePlaceholder { name: String },

    #[error("Alignment error on {context}: {reason}")]
    Alignment { context: String, reason: String },

    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter { parameter: String, reason: String },

    #[error("{source_index} is not on the reference grid: {reason}")]
    GridMismatch {
        source_index: SourceIndex,
        reason: String,
    },

    #[error("Sources cannot produce any output pixel: {reason}")]
    EmptyOutput { reason: String },
}

/// Errors raised while streaming tiles.
///
/// Graph execution is assumed deterministic, so none of these is retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("input region {region} of {source_index} lies outside its {extent} extent")]
    OutOfBounds {
        source_index: SourceIndex,
        region: ImageRegion,
        extent: Size2D,
    },

    #[error("cannot read region {region} from {source_index}: {reason}")]
    ReadBounds {
        source_index: SourceIndex,
        region: ImageRegion,
        reason: String,
    },

    #[error("{source_index} yields {actual} patches but {expected} output positions are expected")]
    PatchCountMismatch {
        source_index: SourceIndex,
        expected: u64,
        actual: u64,
    },

    #[error("graph execution failed: {0}")]
    GraphExecution(String),

    #[error("graph did not return output tensor '{name}'")]
    MissingOutput { name: String },

    #[error("output tensor '{name}' has shape {actual}, expected {expected}")]
    ShapeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("tile produced {actual} bands but the output raster has {expected}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("{0}")]
    Splitting(String),

    #[error("output sink failure: {0}")]
    Sink(String),
}

/// Errors from the graph session host.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelLoadError {
    #[error("Model not found at {path}")]
    NotFound { path: String },

    #[error("Failed to load model from {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("{0}")]
    Unsupported(String),
}

/// Errors from the user placeholder expression parser.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("Malformed placeholder expression '{expression}': {reason}")]
    Syntax { expression: String, reason: String },
}

/// Errors from raster sources and sinks.
#[derive(Error, Debug)]
pub enum RasterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("TIFF error: {0}")]
    Tiff(String),

    #[error("Unsupported raster '{path}': {reason}")]
    Unsupported { path: String, reason: String },

    #[error("Region {region} is outside the {extent} raster")]
    OutOfBounds { region: ImageRegion, extent: Size2D },

    #[error("{0}")]
    Invalid(String),
}

impl From<tiff::TiffError> for RasterError {
    fn from(e: tiff::TiffError) -> Self {
        Self::Tiff(e.to_string())
    }
}

// ============================================================================
// Error Utilities
// ============================================================================

impl ConfigError {
    /// Check if this error makes further validation pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConfigError::NoSources | ConfigError::NoOutputs | ConfigError::EmptyOutput { .. }
        )
    }

    /// Get suggestion for fixing this error.
    pub fn suggested_fix(&self) -> Option<String> {
        match self {
            ConfigError::UnknownTensor { name, role } => Some(format!(
                "Check the {} name '{}' against `patchserve inspect --model <path>`",
                role, name
            )),
            ConfigError::DuplicatePlaceholder { name } => {
                Some(format!("Give each source and constant a distinct name instead of '{}'", name))
            }
            ConfigError::Alignment { .. } => Some(
                "Use a patch size at least as large as the field of expression, and a spacing scale \
                 that maps the field of expression onto a whole number of input pixels"
                    .to_string(),
            ),
            ConfigError::EmptyOutput { .. } => {
                Some("Use smaller patches or sources that overlap on a larger area".to_string())
            }
            ConfigError::NoOutputs => Some("Name at least one output tensor".to_string()),
            _ => None,
        }
    }
}

impl ExecutionError {
    /// Get the source that caused this error, if applicable.
    pub fn source_index(&self) -> Option<SourceIndex> {
        match self {
            ExecutionError::OutOfBounds { source_index, .. }
            | ExecutionError::ReadBounds { source_index, .. }
            | ExecutionError::PatchCountMismatch { source_index, .. } => Some(*source_index),
            _ => None,
        }
    }

    /// Attach the stage and tile to this error.
    pub fn at(self, stage: Stage, tile: ImageRegion) -> ServeError {
        ServeError::Tile {
            stage,
            tile,
            error: self,
        }
    }
}

impl ServeError {
    /// Stage of the pipeline that failed, for tile errors.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ServeError::Tile { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The execution error behind a tile failure.
    pub fn execution_error(&self) -> Option<&ExecutionError> {
        match self {
            ServeError::Tile { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Result type alias for patchserve operations.
pub type ServeResult<T> = Result<T, ServeError>;

/// Result type alias for setup operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type alias for streaming operations.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

// ============================================================================
// Validation Report
// ============================================================================

/// Comprehensive validation report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Whether validation passed without errors.
    pub success: bool,
    /// List of errors found.
    pub errors: Vec<ConfigError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<ValidationWarning>,
    /// Time taken for validation in milliseconds.
    pub duration_ms: u64,
}

/// Non-fatal validation warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    /// Warning message.
    pub message: String,
    /// Source that triggered the warning, if applicable.
    pub source_index: Option<SourceIndex>,
    /// Suggestion for addressing the warning.
    pub suggestion: Option<String>,
}

impl ValidationReport {
    /// Create a new empty report (success).
    pub fn new() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Add an error to the report.
    pub fn add_error(&mut self, error: ConfigError) {
        self.success = false;
        self.errors.push(error);
    }

    /// Add a warning to the report.
    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Check if streaming may start.
    pub fn can_execute(&self) -> bool {
        self.success
    }

    /// First error, if any, as a result.
    pub fn into_result(self) -> ConfigResult<Vec<ValidationWarning>> {
        match self.errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(self.warnings),
        }
    }

    /// Get a human-readable summary.
    pub fn summary(&self) -> String {
        if self.success {
            if self.warnings.is_empty() {
                "Configuration is valid and ready to stream".to_string()
            } else {
                format!("Configuration is valid with {} warning(s)", self.warnings.len())
            }
        } else {
            format!("Validation failed with {} error(s)", self.errors.len())
        }
    }

    /// Get detailed error messages with suggestions.
    pub fn detailed_errors(&self) -> Vec<String> {
        self.errors
            .iter()
            .enumerate()
            .map(|(i, error)| {
                let mut msg = format!("{}. {}", i + 1, error);
                if let Some(fix) = error.suggested_fix() {
                    msg.push_str(&format!("\n   -> Suggestion: {}", fix));
                }
                msg
            })
            .collect()
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}
