use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tokenizers::Tokenizer;
use tracing::debug;

use crate::session::OnnxSession;
use crate::{Error, Result};

/// Names CLIP text models commonly declare for their token input.
const TOKEN_INPUT_CANDIDATES: &[&str] = &["input_ids", "tokens", "text"];

const FALLBACK_MAX_LENGTH: usize = 77;
const END_OF_TEXT: &str = "<|endoftext|>";

/// Turns prompt text into conditioning for the denoiser.
pub trait TextEncoder: Send + Sync {
    /// Encodes the prompt into a batch of hidden states.
    ///
    /// With a negative prompt the result has batch size 2 with the negative
    /// (unconditional) row first and the positive row second; the guidance
    /// combine downstream relies on that ordering. Without one, batch size 1.
    fn encode(&self, prompt: &str, negative_prompt: Option<&str>) -> Result<Tensor>;
}

/// CLIP text encoder backed by an ONNX graph.
pub struct ClipTextEncoder {
    session: OnnxSession,
    tokenizer: Tokenizer,
    input_name: String,
    input_dtype: DType,
    max_length: usize,
    pad_id: u32,
    batch_fixed_to_one: bool,
    device: Device,
}

impl ClipTextEncoder {
    pub fn new<P: AsRef<Path>>(
        session: OnnxSession,
        tokenizer_path: P,
        device: Device,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path.as_ref())
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        let info = session.resolve_input("text encoder tokens", TOKEN_INPUT_CANDIDATES)?;
        let input_name = info.name.clone();
        let input_dtype = info.dtype.unwrap_or(DType::I64);
        let max_length = info
            .dims
            .get(1)
            .copied()
            .flatten()
            .unwrap_or(FALLBACK_MAX_LENGTH);
        let batch_fixed_to_one = info.dims.first().copied().flatten() == Some(1);
        let pad_id = tokenizer.token_to_id(END_OF_TEXT).unwrap_or(49407);
        debug!(
            input = %input_name,
            max_length,
            batch_fixed_to_one,
            "text encoder ready"
        );
        Ok(Self {
            session,
            tokenizer,
            input_name,
            input_dtype,
            max_length,
            pad_id,
            batch_fixed_to_one,
            device,
        })
    }

    fn token_ids(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(pad_or_truncate(
            encoding.get_ids(),
            self.max_length,
            self.pad_id,
        ))
    }

    fn run_tokens(&self, ids: Vec<i64>, batch: usize) -> Result<Tensor> {
        let tokens = Tensor::from_vec(ids, (batch, self.max_length), &self.device)?
            .to_dtype(self.input_dtype)?;
        let mut inputs = HashMap::new();
        inputs.insert(self.input_name.clone(), tokens);
        self.session.run(inputs)
    }
}

impl TextEncoder for ClipTextEncoder {
    fn encode(&self, prompt: &str, negative_prompt: Option<&str>) -> Result<Tensor> {
        let positive = self.token_ids(prompt)?;
        let Some(negative_prompt) = negative_prompt else {
            return self.run_tokens(positive, 1);
        };
        let negative = self.token_ids(negative_prompt)?;
        if self.batch_fixed_to_one {
            // The graph pins its batch dimension to 1, so the two prompts
            // take separate passes.
            let uncond = self.run_tokens(negative, 1)?;
            let cond = self.run_tokens(positive, 1)?;
            Ok(Tensor::cat(&[&uncond, &cond], 0)?)
        } else {
            let mut ids = negative;
            ids.extend(positive);
            self.run_tokens(ids, 2)
        }
    }
}

fn pad_or_truncate(ids: &[u32], max_length: usize, pad_id: u32) -> Vec<i64> {
    let mut out: Vec<i64> = ids
        .iter()
        .take(max_length)
        .map(|&id| id as i64)
        .collect();
    out.resize(max_length, pad_id as i64);
    out
}
