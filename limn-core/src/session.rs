use std::collections::{HashMap, HashSet};
use std::path::Path;

use candle_core::{DType, Tensor};
use candle_onnx::onnx::tensor_proto::DataType;
use candle_onnx::onnx::{self, ModelProto};
use tracing::debug;

use crate::{Error, Result};

/// Declared metadata for one graph input or output.
///
/// `dims` holds the declared shape with `None` for symbolic dimensions
/// (batch size, spatial extents) that are only fixed at call time.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: Option<DType>,
    pub dims: Vec<Option<usize>>,
}

/// A loaded ONNX graph plus the input/output metadata it declares.
///
/// Graph initializers (weights) also appear in the proto's input list; they
/// are filtered out here so `inputs()` only lists the tensors a caller must
/// feed.
#[derive(Debug)]
pub struct OnnxSession {
    model: ModelProto,
    inputs: Vec<TensorInfo>,
    outputs: Vec<TensorInfo>,
}

impl OnnxSession {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading onnx graph");
        let model = candle_onnx::read_file(path)?;
        Self::from_proto(model)
    }

    pub fn from_proto(model: ModelProto) -> Result<Self> {
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| Error::MalformedModel("no graph defined in proto".into()))?;
        let initializers: HashSet<&str> = graph
            .initializer
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        let inputs = graph
            .input
            .iter()
            .filter(|vi| !initializers.contains(vi.name.as_str()))
            .map(tensor_info)
            .collect();
        let outputs = graph.output.iter().map(tensor_info).collect();
        Ok(Self {
            model,
            inputs,
            outputs,
        })
    }

    pub fn inputs(&self) -> &[TensorInfo] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorInfo] {
        &self.outputs
    }

    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|i| i.name.clone()).collect()
    }

    /// Picks the graph input to bind for a given role, trying `candidates`
    /// in order against the declared input names.
    pub fn resolve_input(&self, role: &'static str, candidates: &[&str]) -> Result<&TensorInfo> {
        for candidate in candidates {
            if let Some(info) = self.inputs.iter().find(|i| i.name == *candidate) {
                return Ok(info);
            }
        }
        Err(Error::UnresolvedTensorName {
            role,
            candidates: candidates.iter().map(|c| c.to_string()).collect(),
            declared: self.input_names(),
        })
    }

    pub fn primary_output(&self) -> Result<&TensorInfo> {
        self.outputs
            .first()
            .ok_or_else(|| Error::MalformedModel("graph declares no outputs".into()))
    }

    /// Evaluates the graph and returns its first declared output.
    pub fn run(&self, inputs: HashMap<String, Tensor>) -> Result<Tensor> {
        let output_name = self.primary_output()?.name.clone();
        let mut outputs = candle_onnx::simple_eval(&self.model, inputs)?;
        outputs.remove(&output_name).ok_or_else(|| {
            Error::MalformedModel(format!("evaluation produced no output named {output_name}"))
        })
    }
}

fn tensor_info(vi: &onnx::ValueInfoProto) -> TensorInfo {
    let tensor_type = vi.r#type.as_ref().and_then(|t| match &t.value {
        Some(onnx::type_proto::Value::TensorType(tt)) => Some(tt),
        _ => None,
    });
    let dtype = tensor_type
        .and_then(|tt| DataType::try_from(tt.elem_type).ok())
        .and_then(candle_onnx::dtype);
    let dims = tensor_type
        .and_then(|tt| tt.shape.as_ref())
        .map(|shape| {
            shape
                .dim
                .iter()
                .map(|d| match &d.value {
                    Some(onnx::tensor_shape_proto::dimension::Value::DimValue(v)) if *v > 0 => {
                        Some(*v as usize)
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    TensorInfo {
        name: vi.name.clone(),
        dtype,
        dims,
    }
}
