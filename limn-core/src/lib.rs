pub mod device_map;
mod error;
mod model;
mod pipeline;
mod scheduler;
mod session;
mod text_encoder;
mod unet;
mod util;
mod vae;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use device_map::*;
pub use error::{Error, Result};
pub use model::{ModelDefinition, ModelFiles, TextToImageModel, WarmupStatus};
pub use pipeline::LcmPipeline;
pub use scheduler::{LcmScheduler, LcmSchedulerConfig};
pub use session::{OnnxSession, TensorInfo};
pub use text_encoder::{ClipTextEncoder, TextEncoder};
pub use unet::{Denoiser, UnetDenoiser};
pub use vae::{LatentDecoder, VaeDecoder};

use serde::{Deserialize, Serialize};

/// Caller-visible knobs for one generation call.
///
/// Zero-valued `steps`/`guidance` are placeholders filled from the loaded
/// model's [`ModelDefinition`] before sampling; an unset `seed` draws a fresh
/// process-random one. Width and height must be non-zero multiples of 8.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct GenerationOptions {
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub seed: Option<u64>,
    pub previews: bool,
    #[serde(skip)]
    pub cancel: CancelToken,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            negative_prompt: None,
            width: 512,
            height: 512,
            steps: 0,
            guidance: 0.0,
            seed: None,
            previews: false,
            cancel: CancelToken::new(),
        }
    }
}

/// Cooperative cancellation flag, checked once per denoising iteration.
///
/// Cancelling aborts the in-flight call with [`Error::Cancelled`]; the
/// pipeline and its loaded sessions stay usable for subsequent calls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Final artifact of a generation call: PNG bytes plus the metadata needed
/// to reproduce the image.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image_data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub seed: u64,
    pub steps: usize,
    pub prompt: String,
    pub elapsed: Duration,
}

/// One unit of streaming output.
///
/// Non-final steps carry `preview` bytes when previews were requested; the
/// final step carries the finished image instead.
#[derive(Debug, Clone)]
pub struct GenerationStep {
    pub step: usize,
    pub total_steps: usize,
    pub preview: Option<Vec<u8>>,
    pub image: Option<GeneratedImage>,
    pub elapsed: Duration,
}
