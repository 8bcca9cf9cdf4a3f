//! Graph execution for one tile.

use crate::core::error::{ConfigError, ConfigResult, ExecutionError, ExecutionResult, TensorRole};
use crate::core::types::{ConstantPlaceholder, PatchBatch, SourceSet};
use crate::model::{FeedValue, GraphInfo, GraphSession};
use indexmap::IndexMap;
use ndarray::ArrayD;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Check every configured tensor name against the graph.
///
/// Returns all problems found, in configuration order: duplicate placeholder
/// bindings first, then unknown source placeholders, constants and outputs.
pub fn probe_all(
    info: &GraphInfo,
    sources: &SourceSet,
    constants: &[ConstantPlaceholder],
    outputs: &[String],
) -> Vec<ConfigError> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    let bound = sources
        .iter()
        .map(|(_, b)| b.placeholder.as_str())
        .chain(constants.iter().map(|c| c.name.as_str()));
    for name in bound {
        if !seen.insert(name) {
            errors.push(ConfigError::DuplicatePlaceholder { name: name.to_string() });
        }
    }

    let unknown = |name: &str, role| ConfigError::UnknownTensor {
        name: name.to_string(),
        role,
    };
    for (_, bundle) in sources.iter() {
        if !info.has_input(&bundle.placeholder) {
            errors.push(unknown(&bundle.placeholder, TensorRole::SourcePlaceholder));
        }
    }
    for constant in constants {
        if !info.has_input(&constant.name) {
            errors.push(unknown(&constant.name, TensorRole::UserPlaceholder));
        }
    }
    let mut requested = HashSet::new();
    for name in outputs {
        if !info.has_output(name) {
            errors.push(unknown(name, TensorRole::Output));
        }
        if !requested.insert(name.as_str()) {
            errors.push(ConfigError::InvalidParameter {
                parameter: "output.names".to_string(),
                reason: format!("'{}' is requested more than once", name),
            });
        }
    }
    errors
}

/// Check every configured tensor name against the graph, failing on the
/// first problem.
pub fn probe(
    info: &GraphInfo,
    sources: &SourceSet,
    constants: &[ConstantPlaceholder],
    outputs: &[String],
) -> ConfigResult<()> {
    match probe_all(info, sources, constants, outputs).into_iter().next() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Binds batches and constants to a session and fetches the outputs.
pub struct InferenceRunner<'a> {
    session: &'a dyn GraphSession,
    constants: &'a [ConstantPlaceholder],
    outputs: &'a [String],
    lock: Mutex<()>,
}

impl<'a> InferenceRunner<'a> {
    /// Create a runner over a borrowed session.
    pub fn new(session: &'a dyn GraphSession, constants: &'a [ConstantPlaceholder], outputs: &'a [String]) -> Self {
        Self {
            session,
            constants,
            outputs,
            lock: Mutex::new(()),
        }
    }

    /// Requested output names, in band order.
    pub fn outputs(&self) -> &[String] {
        self.outputs
    }

    /// Run the graph on one tile's batches.
    ///
    /// The result holds exactly the requested outputs, in request order.
    pub fn run(&self, batches: &[PatchBatch]) -> ExecutionResult<IndexMap<String, ArrayD<f32>>> {
        let mut feeds: Vec<(&str, FeedValue<'_>)> = Vec::with_capacity(batches.len() + self.constants.len());
        for batch in batches {
            feeds.push((batch.placeholder.as_str(), FeedValue::Batch(batch.data.view())));
        }
        for constant in self.constants {
            feeds.push((constant.name.as_str(), FeedValue::Scalar(constant.value)));
        }
        let fetches: Vec<&str> = self.outputs.iter().map(String::as_str).collect();

        let mut results = if self.session.supports_concurrent_runs() {
            self.session.run(&feeds, &fetches)
        } else {
            let _guard = self.lock.lock();
            self.session.run(&feeds, &fetches)
        }
        .map_err(|e| ExecutionError::GraphExecution(e.to_string()))?;

        let mut ordered = IndexMap::with_capacity(self.outputs.len());
        for name in self.outputs {
            let tensor = results
                .shift_remove(name)
                .ok_or_else(|| ExecutionError::MissingOutput { name: name.clone() })?;
            ordered.insert(name.clone(), tensor);
        }
        Ok(ordered)
    }
}
