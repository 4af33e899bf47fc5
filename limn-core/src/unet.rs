use std::collections::HashMap;

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::session::OnnxSession;
use crate::Result;

const LATENT_CANDIDATES: &[&str] = &["sample", "latent_model_input", "x"];
const TIMESTEP_CANDIDATES: &[&str] = &["timestep", "t", "timesteps"];
const CONTEXT_CANDIDATES: &[&str] = &["encoder_hidden_states", "context", "text_embeds"];

const FALLBACK_LATENT_CHANNELS: usize = 4;

/// One denoising pass over a latent batch.
pub trait Denoiser: Send + Sync {
    /// Number of channels the latent tensor must carry.
    fn latent_channels(&self) -> usize;

    /// Predicts the noise residual for `latents` at `timestep`, conditioned
    /// on the text encoder's hidden states.
    fn denoise(&self, latents: &Tensor, timestep: usize, context: &Tensor) -> Result<Tensor>;
}

/// U-Net denoiser backed by an ONNX graph.
///
/// The timestep tensor is shaped to whatever rank and dtype the graph
/// declares, since exported models disagree on whether it is a scalar or a
/// length-one vector, and on whether it is integral or floating point.
#[derive(Debug)]
pub struct UnetDenoiser {
    session: OnnxSession,
    latent_name: String,
    timestep_name: String,
    context_name: String,
    timestep_dtype: DType,
    timestep_is_scalar: bool,
    latent_channels: usize,
}

impl UnetDenoiser {
    pub fn new(session: OnnxSession) -> Result<Self> {
        let latent = session.resolve_input("denoiser latents", LATENT_CANDIDATES)?;
        let latent_name = latent.name.clone();
        let latent_channels = latent
            .dims
            .get(1)
            .copied()
            .flatten()
            .unwrap_or(FALLBACK_LATENT_CHANNELS);
        let timestep = session.resolve_input("denoiser timestep", TIMESTEP_CANDIDATES)?;
        let timestep_name = timestep.name.clone();
        let timestep_dtype = timestep.dtype.unwrap_or(DType::I64);
        let timestep_is_scalar = timestep.dims.is_empty();
        let context = session.resolve_input("denoiser context", CONTEXT_CANDIDATES)?;
        let context_name = context.name.clone();
        debug!(
            latent = %latent_name,
            timestep = %timestep_name,
            context = %context_name,
            latent_channels,
            "denoiser ready"
        );
        Ok(Self {
            session,
            latent_name,
            timestep_name,
            context_name,
            timestep_dtype,
            timestep_is_scalar,
            latent_channels,
        })
    }

    fn timestep_tensor(&self, timestep: usize, device: &candle_core::Device) -> Result<Tensor> {
        let t = if self.timestep_is_scalar {
            Tensor::new(timestep as i64, device)?
        } else {
            Tensor::from_vec(vec![timestep as i64], 1, device)?
        };
        Ok(t.to_dtype(self.timestep_dtype)?)
    }
}

impl Denoiser for UnetDenoiser {
    fn latent_channels(&self) -> usize {
        self.latent_channels
    }

    fn denoise(&self, latents: &Tensor, timestep: usize, context: &Tensor) -> Result<Tensor> {
        let mut inputs = HashMap::new();
        inputs.insert(self.latent_name.clone(), latents.clone());
        inputs.insert(
            self.timestep_name.clone(),
            self.timestep_tensor(timestep, latents.device())?,
        );
        inputs.insert(self.context_name.clone(), context.clone());
        self.session.run(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_onnx::onnx::tensor_shape_proto::{dimension, Dimension};
    use candle_onnx::onnx::{
        tensor_proto, type_proto, GraphProto, ModelProto, NodeProto, TensorShapeProto, TypeProto,
        ValueInfoProto,
    };

    fn dim(value: dimension::Value) -> Dimension {
        Dimension {
            denotation: "".to_string(),
            value: Some(value),
        }
    }

    fn tensor_input(
        name: &str,
        elem_type: tensor_proto::DataType,
        dims: Vec<Dimension>,
    ) -> ValueInfoProto {
        ValueInfoProto {
            name: name.to_string(),
            doc_string: "".to_string(),
            r#type: Some(TypeProto {
                denotation: "".to_string(),
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: elem_type as i32,
                    shape: Some(TensorShapeProto { dim: dims }),
                })),
            }),
        }
    }

    fn unet_model() -> ModelProto {
        use dimension::Value::{DimParam, DimValue};
        ModelProto {
            metadata_props: vec![],
            training_info: vec![],
            functions: vec![],
            ir_version: 0,
            opset_import: vec![],
            producer_name: "".to_string(),
            producer_version: "".to_string(),
            domain: "".to_string(),
            model_version: 0,
            doc_string: "".to_string(),
            graph: Some(GraphProto {
                node: vec![NodeProto {
                    op_type: "Identity".to_string(),
                    domain: "".to_string(),
                    attribute: vec![],
                    input: vec!["sample".to_string()],
                    output: vec!["out_sample".to_string()],
                    name: "".to_string(),
                    doc_string: "".to_string(),
                }],
                name: "".to_string(),
                initializer: vec![],
                input: vec![
                    tensor_input(
                        "sample",
                        tensor_proto::DataType::Float,
                        vec![
                            dim(DimParam("batch".to_string())),
                            dim(DimValue(4)),
                            dim(DimParam("h".to_string())),
                            dim(DimParam("w".to_string())),
                        ],
                    ),
                    tensor_input(
                        "timestep",
                        tensor_proto::DataType::Int64,
                        vec![dim(DimValue(1))],
                    ),
                    tensor_input(
                        "encoder_hidden_states",
                        tensor_proto::DataType::Float,
                        vec![
                            dim(DimParam("batch".to_string())),
                            dim(DimParam("sequence".to_string())),
                            dim(DimParam("hidden".to_string())),
                        ],
                    ),
                ],
                output: vec![ValueInfoProto {
                    name: "out_sample".to_string(),
                    doc_string: "".to_string(),
                    r#type: None,
                }],
                value_info: vec![],
                doc_string: "".to_string(),
                sparse_initializer: vec![],
                quantization_annotation: vec![],
            }),
        }
    }

    #[test]
    fn latent_channels_come_from_the_declared_shape() {
        let session = OnnxSession::from_proto(unet_model()).unwrap();
        let denoiser = UnetDenoiser::new(session).unwrap();
        assert_eq!(denoiser.latent_channels(), 4);
    }

    #[test]
    fn denoise_preserves_the_latent_shape() {
        let session = OnnxSession::from_proto(unet_model()).unwrap();
        let denoiser = UnetDenoiser::new(session).unwrap();
        let device = Device::Cpu;
        let latents = Tensor::zeros((2, 4, 8, 8), DType::F32, &device).unwrap();
        let context = Tensor::zeros((2, 77, 16), DType::F32, &device).unwrap();
        let out = denoiser.denoise(&latents, 999, &context).unwrap();
        assert_eq!(out.dims(), latents.dims());
    }

    #[test]
    fn missing_timestep_input_fails_at_load() {
        let mut model = unet_model();
        model.graph.as_mut().unwrap().input[1].name = "step_count".to_string();
        let session = OnnxSession::from_proto(model).unwrap();
        let err = UnetDenoiser::new(session).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::UnresolvedTensorName { role, .. } if role == "denoiser timestep"
        ));
    }
}
