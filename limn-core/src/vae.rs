use std::collections::HashMap;

use candle_core::{DType, IndexOp, Tensor};
use tracing::debug;

use crate::session::OnnxSession;
use crate::Result;

const LATENT_CANDIDATES: &[&str] = &["latent_sample", "latent", "z", "sample"];

/// Scaling applied to latents before they were encoded during training.
const LATENT_SCALE_FACTOR: f64 = 0.18215;

/// Turns a single latent into pixels.
pub trait LatentDecoder: Send + Sync {
    /// Decodes a (1, c, h/8, w/8) latent into a (3, h, w) u8 image tensor.
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
}

/// VAE decoder backed by an ONNX graph.
#[derive(Debug)]
pub struct VaeDecoder {
    session: OnnxSession,
    latent_name: String,
}

impl VaeDecoder {
    pub fn new(session: OnnxSession) -> Result<Self> {
        let latent = session.resolve_input("decoder latents", LATENT_CANDIDATES)?;
        let latent_name = latent.name.clone();
        debug!(latent = %latent_name, "decoder ready");
        Ok(Self {
            session,
            latent_name,
        })
    }
}

impl LatentDecoder for VaeDecoder {
    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let scaled = (latents * (1. / LATENT_SCALE_FACTOR))?;
        let mut inputs = HashMap::new();
        inputs.insert(self.latent_name.clone(), scaled);
        let decoded = self.session.run(inputs)?;
        let image = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
        Ok(image.to_dtype(DType::U8)?.i(0)?)
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

    fn decoder_model() -> ModelProto {
        let dim = |value: Option<dimension::Value>| Dimension {
            denotation: "".to_string(),
            value,
        };
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
                    input: vec!["latent_sample".to_string()],
                    output: vec!["sample".to_string()],
                    name: "".to_string(),
                    doc_string: "".to_string(),
                }],
                name: "".to_string(),
                initializer: vec![],
                input: vec![ValueInfoProto {
                    name: "latent_sample".to_string(),
                    doc_string: "".to_string(),
                    r#type: Some(TypeProto {
                        denotation: "".to_string(),
                        value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                            elem_type: tensor_proto::DataType::Float as i32,
                            shape: Some(TensorShapeProto {
                                dim: vec![
                                    dim(Some(dimension::Value::DimParam("batch".to_string()))),
                                    dim(Some(dimension::Value::DimValue(3))),
                                    dim(Some(dimension::Value::DimParam("h".to_string()))),
                                    dim(Some(dimension::Value::DimParam("w".to_string()))),
                                ],
                            }),
                        })),
                    }),
                }],
                output: vec![ValueInfoProto {
                    name: "sample".to_string(),
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
    fn decode_scales_and_quantizes() {
        let session = OnnxSession::from_proto(decoder_model()).unwrap();
        let decoder = VaeDecoder::new(session).unwrap();
        // A latent of scale-factor magnitude maps to 1.0 inside the graph,
        // which lands on pixel value 255 after the [-1, 1] -> [0, 255] map.
        let latents =
            Tensor::full(LATENT_SCALE_FACTOR as f32, (1, 3, 4, 4), &Device::Cpu).unwrap();
        let image = decoder.decode(&latents).unwrap();
        assert_eq!(image.dims(), &[3, 4, 4]);
        let pixels = image.flatten_all().unwrap().to_vec1::<u8>().unwrap();
        assert!(pixels.iter().all(|&p| p == 255));
    }

    #[test]
    fn unresolvable_latent_input_is_reported() {
        let mut model = decoder_model();
        model.graph.as_mut().unwrap().input[0].name = "weirdly_named".to_string();
        model.graph.as_mut().unwrap().node[0].input[0] = "weirdly_named".to_string();
        let session = OnnxSession::from_proto(model).unwrap();
        let err = VaeDecoder::new(session).unwrap_err();
        assert!(matches!(err, crate::Error::UnresolvedTensorName { .. }));
    }
}
