//! ONNX graph sessions backed by tract.
//!
//! tract specialises a model for concrete input shapes, so the session keeps
//! one optimised plan per distinct feed shape. Tile sizes repeat (interior
//! tiles, edge tiles), which keeps that cache small.

use crate::core::error::ModelLoadError;
use crate::core::types::ScalarValue;
use crate::model::{FeedValue, GraphInfo, GraphSession, GraphSessionHost, SessionError, SessionOutputs, TensorInfo};
use ndarray::{ArrayD, IxDyn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tract_onnx::prelude::*;
use tract_onnx::tract_hir::infer::GenericFactoid;

type Plan = TypedRunnableModel<TypedModel>;

/// File name looked up when a model path is a directory.
pub const MODEL_FILE_NAME: &str = "model.onnx";

/// Shape and type of one feed, part of the plan cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FeedKind {
    Batch(Vec<usize>),
    Int,
    Float,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PlanKey {
    feeds: Vec<FeedKind>,
    fetches: Vec<String>,
}

/// Host loading `.onnx` files with tract.
#[derive(Debug, Default, Clone, Copy)]
pub struct TractHost;

impl TractHost {
    /// Create a new host.
    pub fn new() -> Self {
        Self
    }
}

impl GraphSessionHost for TractHost {
    fn load_model(&self, path: &Path) -> Result<Box<dyn GraphSession>, ModelLoadError> {
        Ok(Box::new(TractSession::load(path)?))
    }
}

/// A loaded ONNX model.
pub struct TractSession {
    path: PathBuf,
    model: InferenceModel,
    info: GraphInfo,
    plans: Mutex<HashMap<PlanKey, Arc<Plan>>>,
}

fn resolve_model_file(path: &Path) -> Result<PathBuf, ModelLoadError> {
    let file = if path.is_dir() {
        path.join(MODEL_FILE_NAME)
    } else {
        path.to_path_buf()
    };
    if !file.is_file() {
        return Err(ModelLoadError::NotFound {
            path: path.display().to_string(),
        });
    }
    Ok(file)
}

fn fact_shape(fact: &InferenceFact) -> Vec<Option<usize>> {
    fact.shape
        .dims()
        .map(|dim| match dim {
            GenericFactoid::Only(d) => d.to_usize().ok(),
            _ => None,
        })
        .collect()
}

impl TractSession {
    /// Load and describe the model at `path`.
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let file = resolve_model_file(path)?;
        let corrupt = |e: TractError| ModelLoadError::Corrupt {
            path: file.display().to_string(),
            reason: e.to_string(),
        };

        let model = tract_onnx::onnx().model_for_path(&file).map_err(corrupt)?;
        let info = Self::describe(&model).map_err(corrupt)?;
        log::debug!("Parsed {} with tract", file.display());

        Ok(Self {
            path: file,
            model,
            info,
            plans: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the loaded model file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn describe(model: &InferenceModel) -> TractResult<GraphInfo> {
        let describe = |outlets: &[OutletId]| -> TractResult<Vec<TensorInfo>> {
            outlets
                .iter()
                .map(|outlet| {
                    // ONNX tensor names live on outlet labels; node names are only a fallback.
                    let name = model
                        .outlet_label(*outlet)
                        .map(str::to_string)
                        .unwrap_or_else(|| model.node(outlet.node).name.clone());
                    let fact = model.outlet_fact(*outlet)?;
                    Ok(TensorInfo::new(name, fact_shape(fact)))
                })
                .collect()
        };

        Ok(GraphInfo {
            inputs: describe(model.input_outlets()?)?,
            outputs: describe(model.output_outlets()?)?,
        })
    }

    /// Find the feed bound to each graph input, in graph input order.
    fn ordered_feeds<'f, 'a>(
        &self,
        feeds: &'f [(&str, FeedValue<'a>)],
    ) -> Result<Vec<&'f FeedValue<'a>>, SessionError> {
        self.info
            .inputs
            .iter()
            .map(|input| {
                feeds
                    .iter()
                    .find(|(name, _)| *name == input.name)
                    .map(|(_, value)| value)
                    .ok_or_else(|| SessionError(format!("graph input '{}' is not fed", input.name)))
            })
            .collect()
    }

    fn plan(&self, key: &PlanKey) -> Result<Arc<Plan>, SessionError> {
        if let Some(plan) = self.plans.lock().get(key) {
            return Ok(plan.clone());
        }

        let build = || -> TractResult<Plan> {
            let mut model = self.model.clone();
            for (i, kind) in key.feeds.iter().enumerate() {
                let fact: InferenceFact = match kind {
                    FeedKind::Batch(shape) => f32::fact(shape.clone()).into(),
                    FeedKind::Int => i32::fact(Vec::<usize>::new()).into(),
                    FeedKind::Float => f32::fact(Vec::<usize>::new()).into(),
                    FeedKind::Bool => bool::fact(Vec::<usize>::new()).into(),
                };
                model = model.with_input_fact(i, fact)?;
            }
            model.set_output_names(&key.fetches)?;
            model.into_optimized()?.into_runnable()
        };

        let plan = Arc::new(build().map_err(|e| SessionError(format!("cannot prepare graph: {}", e)))?);
        log::debug!("Prepared plan for feeds {:?}", key.feeds);
        self.plans.lock().insert(key.clone(), plan.clone());
        Ok(plan)
    }
}

fn to_tensor(value: &FeedValue<'_>) -> TractResult<Tensor> {
    Ok(match value {
        FeedValue::Batch(view) => {
            let data: Vec<f32> = view.iter().copied().collect();
            Tensor::from_shape(view.shape(), &data)?
        }
        FeedValue::Scalar(ScalarValue::Int(v)) => tensor0(*v),
        FeedValue::Scalar(ScalarValue::Float(v)) => tensor0(*v),
        FeedValue::Scalar(ScalarValue::Bool(v)) => tensor0(*v),
    })
}

impl GraphSession for TractSession {
    fn info(&self) -> &GraphInfo {
        &self.info
    }

    fn run(&self, feeds: &[(&str, FeedValue<'_>)], fetches: &[&str]) -> Result<SessionOutputs, SessionError> {
        let ordered = self.ordered_feeds(feeds)?;
        let key = PlanKey {
            feeds: ordered
                .iter()
                .map(|value| match value {
                    FeedValue::Batch(view) => FeedKind::Batch(view.shape().to_vec()),
                    FeedValue::Scalar(ScalarValue::Int(_)) => FeedKind::Int,
                    FeedValue::Scalar(ScalarValue::Float(_)) => FeedKind::Float,
                    FeedValue::Scalar(ScalarValue::Bool(_)) => FeedKind::Bool,
                })
                .collect(),
            fetches: fetches.iter().map(|s| s.to_string()).collect(),
        };
        let plan = self.plan(&key)?;

        let session_error = |e: TractError| SessionError(e.to_string());
        let mut inputs: TVec<TValue> = tvec!();
        for value in ordered {
            inputs.push(to_tensor(value).map_err(session_error)?.into());
        }

        let results = plan.run(inputs).map_err(session_error)?;

        let mut outputs = SessionOutputs::new();
        for (name, value) in fetches.iter().zip(results.iter()) {
            let cast = value.cast_to::<f32>().map_err(session_error)?;
            let data = cast.as_slice::<f32>().map_err(session_error)?.to_vec();
            let array = ArrayD::from_shape_vec(IxDyn(cast.shape()), data)
                .map_err(|e| SessionError(format!("output '{}': {}", name, e)))?;
            outputs.insert(name.to_string(), array);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = TractSession::load(dir.path()).err().unwrap();
        assert!(matches!(err, ModelLoadError::NotFound { .. }));
    }

    fn tensor_value(name: &str) -> tract_onnx::pb::ValueInfoProto {
        use tract_onnx::pb::type_proto::{Tensor, Value};
        tract_onnx::pb::ValueInfoProto {
            name: name.to_string(),
            r#type: Some(tract_onnx::pb::TypeProto {
                value: Some(Value::TensorType(Tensor {
                    elem_type: 1,
                    shape: None,
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_outputs_are_named_by_tensor() {
        use tract_onnx::pb::{GraphProto, ModelProto, NodeProto, OperatorSetIdProto};
        let proto = ModelProto {
            ir_version: 7,
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: 13,
            }],
            graph: Some(GraphProto {
                name: "head".to_string(),
                node: vec![NodeProto {
                    name: "/head/Relu".to_string(),
                    op_type: "Relu".to_string(),
                    input: vec!["image".to_string()],
                    output: vec!["scores".to_string()],
                    ..Default::default()
                }],
                input: vec![tensor_value("image")],
                output: vec![tensor_value("scores")],
                ..Default::default()
            }),
            ..Default::default()
        };
        let model = tract_onnx::onnx().model_for_proto_model(&proto).unwrap();
        let info = TractSession::describe(&model).unwrap();
        assert!(info.has_input("image"));
        assert!(info.has_output("scores"));
        assert!(!info.has_output("/head/Relu"));
    }

    #[test]
    fn test_garbage_model_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MODEL_FILE_NAME), b"not a protobuf").unwrap();
        let err = TractHost::new().load_model(dir.path()).err().unwrap();
        assert!(matches!(err, ModelLoadError::Corrupt { .. }));
    }
}
