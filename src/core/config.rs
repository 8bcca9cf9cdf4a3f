//! Serving configuration.
//!
//! A [`ServeConfig`] describes one complete serving pass: the model, the
//! input sources, the constants, the requested outputs and the streaming
//! parameters. It can be deserialised from TOML or built from command-line
//! flags; both paths end in the same structure.
//!
//! ```toml
//! model = "models/classifier.onnx"
//! constants = ["is_training=false", "dropout=0.0"]
//!
//! [[sources]]
//! images = ["scenes/spot6_*.tif"]
//! patch = { width = 16, height = 16 }
//! placeholder = "x1"
//!
//! [output]
//! path = "classif.tif"
//! names = ["prediction"]
//! spacing_scale = 1.0
//! foe = { width = 1, height = 1 }
//!
//! [tiling]
//! tile_size = 64
//! ```

use crate::core::error::{ConfigError, ConfigResult, ServeError, ServeResult};
use crate::core::expression::parse_expressions;
use crate::core::region::Size2D;
use crate::core::types::{ConstantPlaceholder, InferenceMode, OutputSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default tile side, in output pixels.
pub const DEFAULT_TILE_SIZE: u32 = 16;

/// One input source as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Image files or glob patterns, stacked band-wise in order.
    pub images: Vec<String>,
    /// Field of view, in source pixels.
    pub patch: Size2D,
    /// Graph placeholder fed with this source's patches.
    pub placeholder: String,
}

/// Output parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output raster path.
    pub path: PathBuf,
    /// Output tensor names, in band order.
    pub names: Vec<String>,
    /// Output pixel size divided by input pixel size.
    pub spacing_scale: f64,
    /// Field of expression, in output pixels.
    pub foe: Size2D,
    /// Run the graph once per tile instead of once per patch.
    pub fully_convolutional: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("output.tif"),
            names: Vec::new(),
            spacing_scale: 1.0,
            foe: Size2D::square(1),
            fully_convolutional: false,
        }
    }
}

/// Streaming parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    /// Stream square tiles; when disabled the whole output is one tile.
    pub enabled: bool,
    /// Tile side, in output pixels.
    pub tile_size: u32,
    /// Independent tiles processed concurrently.
    pub tiles_in_flight: usize,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tile_size: DEFAULT_TILE_SIZE,
            tiles_in_flight: 1,
        }
    }
}

/// Complete configuration of a serving pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServeConfig {
    /// Model file or directory.
    pub model: PathBuf,
    /// Constant placeholders as `name=value` expressions.
    #[serde(default)]
    pub constants: Vec<String>,
    /// Input sources, in placeholder binding order.
    pub sources: Vec<SourceConfig>,
    /// Output parameters.
    #[serde(default)]
    pub output: OutputConfig,
    /// Streaming parameters.
    #[serde(default)]
    pub tiling: TilingConfig,
}

impl ServeConfig {
    /// Create a configuration for `model` with no sources.
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            constants: Vec::new(),
            sources: Vec::new(),
            output: OutputConfig::default(),
            tiling: TilingConfig::default(),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> ServeResult<Self> {
        let config: ServeConfig = toml::from_str(text)?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ServeResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Serialise back to TOML.
    pub fn to_toml_string(&self) -> ServeResult<String> {
        toml::to_string_pretty(self).map_err(|e| ServeError::Other(e.to_string()))
    }

    /// Append a source.
    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.sources.push(source);
        self
    }

    /// Append a constant expression.
    pub fn with_constant(mut self, expression: impl Into<String>) -> Self {
        self.constants.push(expression.into());
        self
    }

    /// Replace the output parameters.
    pub fn with_output(mut self, output: OutputConfig) -> Self {
        self.output = output;
        self
    }

    /// Replace the streaming parameters.
    pub fn with_tiling(mut self, tiling: TilingConfig) -> Self {
        self.tiling = tiling;
        self
    }

    /// Check parameter ranges. Geometry and graph checks happen later, once
    /// the rasters and the model are open.
    pub fn check(&self) -> ConfigResult<()> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        if self.output.names.is_empty() {
            return Err(ConfigError::NoOutputs);
        }

        let invalid = |parameter: String, reason: &str| ConfigError::InvalidParameter {
            parameter,
            reason: reason.to_string(),
        };

        for (i, source) in self.sources.iter().enumerate() {
            let key = format!("source{}", i + 1);
            if source.images.is_empty() {
                return Err(invalid(format!("{}.images", key), "at least one image is required"));
            }
            if source.patch.is_empty() {
                return Err(invalid(format!("{}.patch", key), "must be at least 1x1"));
            }
            if source.placeholder.trim().is_empty() {
                return Err(invalid(format!("{}.placeholder", key), "must not be empty"));
            }
        }

        if !(self.output.spacing_scale.is_finite() && self.output.spacing_scale > 0.0) {
            return Err(invalid("output.spacing_scale".to_string(), "must be strictly positive"));
        }
        if self.output.foe.is_empty() {
            return Err(invalid("output.foe".to_string(), "must be at least 1x1"));
        }
        if self.tiling.tile_size == 0 {
            return Err(invalid("tiling.tile_size".to_string(), "must be at least 1"));
        }
        if self.tiling.tiles_in_flight == 0 {
            return Err(invalid("tiling.tiles_in_flight".to_string(), "must be at least 1"));
        }
        Ok(())
    }

    /// The output specification.
    pub fn output_spec(&self) -> OutputSpec {
        OutputSpec::new(self.output.names.iter().cloned())
            .with_spacing_scale(self.output.spacing_scale)
            .with_foe(self.output.foe.width, self.output.foe.height)
            .with_mode(InferenceMode::from_flag(self.output.fully_convolutional))
    }

    /// Parsed constant placeholders.
    pub fn constant_placeholders(&self) -> ServeResult<Vec<ConstantPlaceholder>> {
        Ok(parse_expressions(&self.constants)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
model = "model.onnx"
constants = ["is_training=false"]

[[sources]]
images = ["a.tif", "b.tif"]
patch = { width = 16, height = 16 }
placeholder = "x1"

[[sources]]
images = ["c.tif"]
patch = { width = 8, height = 8 }
placeholder = "x2"

[output]
names = ["prediction"]
spacing_scale = 0.25
foe = { width = 4, height = 4 }
"#;

    #[test]
    fn test_parse_toml_with_defaults() {
        let config = ServeConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[1].patch, Size2D::square(8));
        assert_eq!(config.output.path, PathBuf::from("output.tif"));
        assert!(!config.output.fully_convolutional);
        assert!(config.tiling.enabled);
        assert_eq!(config.tiling.tile_size, DEFAULT_TILE_SIZE);
        assert_eq!(config.tiling.tiles_in_flight, 1);
        config.check().unwrap();

        let spec = config.output_spec();
        assert_eq!(spec.foe, Size2D::square(4));
        assert_eq!(spec.mode, InferenceMode::PatchBased);
        assert_eq!(config.constant_placeholders().unwrap().len(), 1);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ServeConfig::from_toml_str(SAMPLE).unwrap();
        let text = config.to_toml_string().unwrap();
        assert_eq!(ServeConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_check_rejects_bad_parameters() {
        let base = ServeConfig::from_toml_str(SAMPLE).unwrap();

        let mut config = base.clone();
        config.output.spacing_scale = 0.0;
        assert!(matches!(config.check(), Err(ConfigError::InvalidParameter { .. })));

        let mut config = base.clone();
        config.tiling.tile_size = 0;
        assert!(matches!(config.check(), Err(ConfigError::InvalidParameter { .. })));

        let mut config = base.clone();
        config.output.names.clear();
        assert_eq!(config.check(), Err(ConfigError::NoOutputs));

        let config = ServeConfig::new("model.onnx");
        assert_eq!(config.check(), Err(ConfigError::NoSources));
    }

    #[test]
    fn test_bad_constant_is_reported() {
        let config = ServeConfig::from_toml_str(SAMPLE).unwrap().with_constant("oops");
        assert!(matches!(config.constant_placeholders(), Err(ServeError::Expression(_))));
    }
}
