//! Graph session capability.
//!
//! The serving core never loads or owns a model. It talks to an opaque
//! [`GraphSession`] that can describe its inputs and outputs and execute
//! one feed/fetch round. A [`GraphSessionHost`] turns a model path into a
//! session; the ONNX host lives behind the `onnx` feature.

#[cfg(feature = "onnx")]
pub mod tract;

use crate::core::error::ModelLoadError;
use crate::core::types::ScalarValue;
use indexmap::IndexMap;
use ndarray::{ArrayD, ArrayView4};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Name and (partially known) shape of a graph tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    /// Tensor name.
    pub name: String,
    /// Dimensions; `None` for dimensions only known at run time.
    pub shape: Vec<Option<usize>>,
}

impl TensorInfo {
    /// Create a new tensor description.
    pub fn new(name: impl Into<String>, shape: Vec<Option<usize>>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    /// Rank of the tensor.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

/// Inputs and outputs declared by a graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphInfo {
    /// Graph input tensors (placeholders).
    pub inputs: Vec<TensorInfo>,
    /// Graph output tensors.
    pub outputs: Vec<TensorInfo>,
}

impl GraphInfo {
    /// Look up an input by name.
    pub fn input(&self, name: &str) -> Option<&TensorInfo> {
        self.inputs.iter().find(|t| t.name == name)
    }

    /// Look up an output by name.
    pub fn output(&self, name: &str) -> Option<&TensorInfo> {
        self.outputs.iter().find(|t| t.name == name)
    }

    /// Whether the graph declares an input called `name`.
    pub fn has_input(&self, name: &str) -> bool {
        self.input(name).is_some()
    }

    /// Whether the graph declares an output called `name`.
    pub fn has_output(&self, name: &str) -> bool {
        self.output(name).is_some()
    }
}

/// A value bound to a graph input for one run.
#[derive(Debug, Clone)]
pub enum FeedValue<'a> {
    /// NHWC patch batch.
    Batch(ArrayView4<'a, f32>),
    /// Single scalar.
    Scalar(ScalarValue),
}

/// Failure reported by a session.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct SessionError(pub String);

/// Named output tensors returned by a run.
pub type SessionOutputs = IndexMap<String, ArrayD<f32>>;

/// An executable graph.
pub trait GraphSession: Send + Sync {
    /// Declared inputs and outputs.
    fn info(&self) -> &GraphInfo;

    /// Execute the graph once.
    ///
    /// Returns the fetched tensors by name. A session may omit a fetched
    /// tensor it could not produce; callers treat that as a failure.
    fn run(&self, feeds: &[(&str, FeedValue<'_>)], fetches: &[&str]) -> Result<SessionOutputs, SessionError>;

    /// Whether `run` may be called from several threads at once.
    fn supports_concurrent_runs(&self) -> bool {
        false
    }
}

/// Loader turning a model path into a session.
pub trait GraphSessionHost {
    /// Load the model at `path`.
    fn load_model(&self, path: &Path) -> Result<Box<dyn GraphSession>, ModelLoadError>;
}

/// The host compiled into this build.
#[cfg(feature = "onnx")]
pub fn default_host() -> Result<Box<dyn GraphSessionHost>, ModelLoadError> {
    Ok(Box::new(tract::TractHost::new()))
}

/// The host compiled into this build.
#[cfg(not(feature = "onnx"))]
pub fn default_host() -> Result<Box<dyn GraphSessionHost>, ModelLoadError> {
    Err(ModelLoadError::Unsupported(
        "this build has no model backend; rebuild with `--features onnx` to serve ONNX graphs"
            .to_string(),
    ))
}
