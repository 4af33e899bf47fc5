use std::sync::{Arc, Mutex};
use std::time::Instant;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::scheduler::{LcmScheduler, LcmSchedulerConfig};
use crate::text_encoder::TextEncoder;
use crate::unet::Denoiser;
use crate::util::{encode_png, tensor_to_image};
use crate::vae::LatentDecoder;
use crate::{
    Error, GeneratedImage, GenerationOptions, GenerationStep, ModelDefinition, Result,
};

/// Options with model defaults and a concrete seed filled in.
#[derive(Debug, Clone)]
struct ResolvedOptions {
    negative_prompt: String,
    width: usize,
    height: usize,
    steps: usize,
    guidance: f64,
    seed: u64,
    previews: bool,
    cancel: crate::CancelToken,
}

type StepSink<'a> = &'a mut dyn FnMut(GenerationStep) -> bool;

/// Latent-consistency text-to-image pipeline.
///
/// Each call runs text encoding, the consistency sampling loop with
/// classifier-free guidance, and latent decoding. Calls are serialized with
/// an internal lock so the underlying sessions are never evaluated
/// concurrently; clones share the same loaded model.
#[derive(Clone)]
pub struct LcmPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    encoder: Box<dyn TextEncoder>,
    denoiser: Box<dyn Denoiser>,
    decoder: Box<dyn LatentDecoder>,
    scheduler_config: LcmSchedulerConfig,
    definition: ModelDefinition,
    device: Device,
    gate: Mutex<()>,
}

impl LcmPipeline {
    pub fn new(
        encoder: Box<dyn TextEncoder>,
        denoiser: Box<dyn Denoiser>,
        decoder: Box<dyn LatentDecoder>,
        scheduler_config: LcmSchedulerConfig,
        definition: ModelDefinition,
        device: Device,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                encoder,
                denoiser,
                decoder,
                scheduler_config,
                definition,
                device,
                gate: Mutex::new(()),
            }),
        }
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.inner.definition
    }

    /// Generates a single image.
    pub fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GeneratedImage> {
        let resolved = self.inner.resolve(prompt, options)?;
        self.inner.run(prompt, resolved, None)
    }

    /// Generates `count` images for one prompt.
    ///
    /// Image `i` uses seed `base_seed + i`, so a batch is reproducible from
    /// its first seed and any single image can be regenerated alone.
    pub fn generate_batch(
        &self,
        prompt: &str,
        count: usize,
        options: &GenerationOptions,
    ) -> Result<Vec<GeneratedImage>> {
        let resolved = self.inner.resolve(prompt, options)?;
        let mut images = Vec::with_capacity(count);
        for i in 0..count {
            if resolved.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let mut per_image = resolved.clone();
            per_image.seed = resolved.seed.wrapping_add(i as u64);
            images.push(self.inner.run(prompt, per_image, None)?);
        }
        Ok(images)
    }

    /// Generates one image, yielding a [`GenerationStep`] per denoising step.
    ///
    /// The stream is pull-based with a bounded buffer: once the buffer fills,
    /// sampling pauses until the consumer catches up. Dropping the stream
    /// aborts the generation. Options are validated before this returns, so
    /// a bad request fails here rather than on the stream.
    pub fn generate_streaming(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<ReceiverStream<Result<GenerationStep>>> {
        let resolved = self.inner.resolve(prompt, options)?;
        let (tx, rx) = mpsc::channel(resolved.steps.max(1));
        let inner = Arc::clone(&self.inner);
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            let mut forward = |step: GenerationStep| tx.blocking_send(Ok(step)).is_ok();
            if let Err(err) = inner.run(&prompt, resolved, Some(&mut forward)) {
                let _ = tx.blocking_send(Err(err));
            }
        });
        Ok(ReceiverStream::new(rx))
    }
}

impl PipelineInner {
    fn resolve(&self, prompt: &str, options: &GenerationOptions) -> Result<ResolvedOptions> {
        if prompt.trim().is_empty() {
            return Err(Error::InvalidOptions("prompt must not be empty".into()));
        }
        let (width, height) = (options.width, options.height);
        if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
            return Err(Error::InvalidOptions(format!(
                "width and height must be non-zero multiples of 8, got {width}x{height}"
            )));
        }
        let steps = if options.steps == 0 {
            self.definition.default_steps
        } else {
            options.steps
        };
        let guidance = if options.guidance == 0.0 {
            self.definition.default_guidance
        } else {
            options.guidance
        };
        if guidance < 0.0 {
            return Err(Error::InvalidOptions(format!(
                "guidance must be non-negative, got {guidance}"
            )));
        }
        // Validates the step count against the distillation ladder.
        LcmScheduler::new(steps, self.scheduler_config)?;
        let seed = options.seed.unwrap_or_else(|| rand::rng().random());
        Ok(ResolvedOptions {
            negative_prompt: options.negative_prompt.clone().unwrap_or_default(),
            width,
            height,
            steps,
            guidance,
            seed,
            previews: options.previews,
            cancel: options.cancel.clone(),
        })
    }

    fn run(
        &self,
        prompt: &str,
        opts: ResolvedOptions,
        mut sink: Option<StepSink>,
    ) -> Result<GeneratedImage> {
        let _guard = self
            .gate
            .lock()
            .map_err(|_| Error::Task("pipeline lock poisoned".into()))?;
        let start = Instant::now();
        let scheduler = LcmScheduler::new(opts.steps, self.scheduler_config)?;
        if opts.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        debug!(
            seed = opts.seed,
            steps = opts.steps,
            guidance = opts.guidance,
            "encoding prompts"
        );
        // Guidance at or below 1 degenerates to the conditional prediction
        // alone, so the unconditional half of the batch is skipped entirely.
        let cfg = opts.guidance > 1.0;
        let context = if cfg {
            self.encoder
                .encode(prompt, Some(opts.negative_prompt.as_str()))?
        } else {
            self.encoder.encode(prompt, None)?
        };

        let mut rng = StdRng::seed_from_u64(opts.seed);
        let latent_shape = [
            1,
            self.denoiser.latent_channels(),
            opts.height / 8,
            opts.width / 8,
        ];
        let mut latents = scheduler.create_noise(&mut rng, &latent_shape, &self.device)?;

        let timesteps = scheduler.timesteps().to_vec();
        let total_steps = timesteps.len();
        for (index, &timestep) in timesteps.iter().enumerate() {
            if opts.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            // Doubled batch under guidance: unconditional first, conditional
            // second, matching the conditioning rows.
            let latent_input = if cfg {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let noise_pred = self.denoiser.denoise(&latent_input, timestep, &context)?;
            let guided = if cfg {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * opts.guidance)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&guided, timestep, &latents, &mut rng)?;
            debug!(step = index + 1, total_steps, timestep, "denoised");

            let last = index + 1 == total_steps;
            if last {
                break;
            }
            if let Some(sink) = sink.as_mut() {
                let preview = if opts.previews {
                    let image = tensor_to_image(&self.decoder.decode(&latents)?)?;
                    Some(encode_png(&image)?)
                } else {
                    None
                };
                let delivered = sink(GenerationStep {
                    step: index + 1,
                    total_steps,
                    preview,
                    image: None,
                    elapsed: start.elapsed(),
                });
                if !delivered {
                    return Err(Error::Cancelled);
                }
            }
        }

        let decoded = self.decoder.decode(&latents)?;
        let (_, decoded_h, decoded_w) = decoded.dims3()?;
        if (decoded_w, decoded_h) != (opts.width, opts.height) {
            return Err(Error::MalformedModel(format!(
                "decoder produced a {decoded_w}x{decoded_h} image for a {}x{} request",
                opts.width, opts.height
            )));
        }
        let image = tensor_to_image(&decoded)?;
        let generated = GeneratedImage {
            image_data: encode_png(&image)?,
            width: opts.width,
            height: opts.height,
            seed: opts.seed,
            steps: total_steps,
            prompt: prompt.to_string(),
            elapsed: start.elapsed(),
        };
        if let Some(sink) = sink.as_mut() {
            sink(GenerationStep {
                step: total_steps,
                total_steps,
                preview: None,
                image: Some(generated.clone()),
                elapsed: generated.elapsed,
            });
        }
        info!(
            seed = opts.seed,
            steps = total_steps,
            elapsed_ms = generated.elapsed.as_millis() as u64,
            "image generated"
        );
        Ok(generated)
    }
}
