use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::device_map::{select_best_device, DeviceMap};
use crate::pipeline::LcmPipeline;
use crate::scheduler::LcmSchedulerConfig;
use crate::session::OnnxSession;
use crate::text_encoder::ClipTextEncoder;
use crate::unet::UnetDenoiser;
use crate::vae::VaeDecoder;
use crate::{
    Error, GeneratedImage, GenerationOptions, GenerationStep, Result,
};

/// Identity and sampling defaults for a loadable model.
///
/// Injected at load time; a zero `steps`/`guidance` in a request falls back
/// to the values here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    pub default_steps: usize,
    pub default_guidance: f64,
}

impl ModelDefinition {
    /// The LCM distillation of DreamShaper v7, the model this engine is
    /// tuned for. Four steps with a guidance of 8 is its sweet spot.
    pub fn lcm_dreamshaper_v7() -> Self {
        Self {
            name: "lcm-dreamshaper-v7".to_string(),
            default_steps: 4,
            default_guidance: 8.0,
        }
    }
}

const TEXT_ENCODER_CANDIDATES: &[&str] = &["text_encoder/model.onnx", "text_encoder.onnx"];
const UNET_CANDIDATES: &[&str] = &["unet/model.onnx", "unet.onnx"];
const VAE_DECODER_CANDIDATES: &[&str] = &[
    "vae_decoder/model.onnx",
    "vae_decoder.onnx",
    "vae/decoder.onnx",
];
const TOKENIZER_CANDIDATES: &[&str] = &["tokenizer/tokenizer.json", "tokenizer.json"];

const SCHEDULER_CONFIG_CANDIDATES: &[&str] =
    &["scheduler/scheduler_config.json", "scheduler_config.json"];

/// Resolved on-disk layout of one exported model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub text_encoder: PathBuf,
    pub unet: PathBuf,
    pub vae_decoder: PathBuf,
    pub tokenizer: PathBuf,
    /// Optional; exports without one use the built-in LCM schedule.
    pub scheduler_config: Option<PathBuf>,
}

impl ModelFiles {
    /// Locates the component files under `dir`.
    ///
    /// Conventional locations are tried first; failing those, the tree is
    /// walked looking for a matching file name, so repacked exports with
    /// extra nesting still load.
    pub fn discover<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            text_encoder: find_file(dir, "text encoder", TEXT_ENCODER_CANDIDATES)?,
            unet: find_file(dir, "unet", UNET_CANDIDATES)?,
            vae_decoder: find_file(dir, "vae decoder", VAE_DECODER_CANDIDATES)?,
            tokenizer: find_file(dir, "tokenizer", TOKENIZER_CANDIDATES)?,
            scheduler_config: SCHEDULER_CONFIG_CANDIDATES
                .iter()
                .map(|c| dir.join(c))
                .find(|p| p.is_file()),
        })
    }
}

fn find_file(dir: &Path, role: &'static str, candidates: &[&str]) -> Result<PathBuf> {
    for candidate in candidates {
        let path = dir.join(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }
    // "model.onnx" is shared by every component's conventional layout, so
    // only distinctive file names are worth a tree walk.
    let names: Vec<&str> = candidates
        .iter()
        .filter_map(|c| Path::new(c).file_name().and_then(|n| n.to_str()))
        .filter(|n| *n != "model.onnx")
        .collect();
    if let Some(found) = scan_for_names(dir, &names)? {
        return Ok(found);
    }
    Err(Error::ModelFileNotFound {
        role,
        dir: dir.to_path_buf(),
        tried: candidates.iter().map(|c| c.to_string()).collect(),
    })
}

fn scan_for_names(dir: &Path, names: &[&str]) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut subdirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if names.contains(&name) {
                return Ok(Some(path));
            }
        }
    }
    subdirs.sort();
    for subdir in subdirs {
        if let Some(found) = scan_for_names(&subdir, names)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// Outcome of a warm-up pass, kept around so callers can surface it instead
/// of silently eating a slow or broken first generation.
#[derive(Debug, Clone)]
pub enum WarmupStatus {
    Completed { elapsed: Duration },
    Failed { reason: String },
}

/// A loaded text-to-image model.
///
/// Thin facade over [`LcmPipeline`] that owns loading the component ONNX
/// graphs off the async runtime and exposes the generation entry points.
#[derive(Clone)]
pub struct TextToImageModel {
    pipeline: LcmPipeline,
}

impl TextToImageModel {
    /// Loads the model from `dir` without blocking the async runtime.
    pub async fn load<P: AsRef<Path>>(
        dir: P,
        definition: ModelDefinition,
        device_map: DeviceMap,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || Self::load_blocking(&dir, definition, device_map))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    pub fn load_blocking(
        dir: &Path,
        definition: ModelDefinition,
        device_map: DeviceMap,
    ) -> Result<Self> {
        let started = Instant::now();
        let files = ModelFiles::discover(dir)?;
        let device = select_best_device(device_map)?;
        let scheduler_config = match &files.scheduler_config {
            Some(path) => LcmSchedulerConfig::from_json_file(path)?,
            None => LcmSchedulerConfig::default(),
        };
        let encoder = ClipTextEncoder::new(
            OnnxSession::open(&files.text_encoder)?,
            &files.tokenizer,
            device.clone(),
        )?;
        let denoiser = UnetDenoiser::new(OnnxSession::open(&files.unet)?)?;
        let decoder = VaeDecoder::new(OnnxSession::open(&files.vae_decoder)?)?;
        let pipeline = LcmPipeline::new(
            Box::new(encoder),
            Box::new(denoiser),
            Box::new(decoder),
            scheduler_config,
            definition,
            device,
        );
        let model = Self { pipeline };
        info!(
            model = %model.definition().name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );
        Ok(model)
    }

    /// Wraps an already-assembled pipeline.
    pub fn from_pipeline(pipeline: LcmPipeline) -> Self {
        Self { pipeline }
    }

    pub fn definition(&self) -> &ModelDefinition {
        self.pipeline.definition()
    }

    /// Runs a tiny single-step generation to pay one-time evaluation costs
    /// up front. The first real request then runs at steady-state speed.
    pub async fn warm_up(&self) -> WarmupStatus {
        let pipeline = self.pipeline.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let options = GenerationOptions {
                width: 64,
                height: 64,
                steps: 1,
                ..Default::default()
            };
            pipeline
                .generate("warm-up", &options)
                .map(|_| started.elapsed())
        })
        .await;
        match outcome {
            Ok(Ok(elapsed)) => {
                info!(elapsed_ms = elapsed.as_millis() as u64, "warm-up complete");
                WarmupStatus::Completed { elapsed }
            }
            Ok(Err(err)) => WarmupStatus::Failed {
                reason: err.to_string(),
            },
            Err(err) => WarmupStatus::Failed {
                reason: err.to_string(),
            },
        }
    }

    /// Generates one image on a blocking task.
    pub async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GeneratedImage> {
        let pipeline = self.pipeline.clone();
        let prompt = prompt.to_string();
        let options = options.clone();
        tokio::task::spawn_blocking(move || pipeline.generate(&prompt, &options))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    /// Generates `count` images sequentially on a blocking task.
    pub async fn generate_batch(
        &self,
        prompt: &str,
        count: usize,
        options: &GenerationOptions,
    ) -> Result<Vec<GeneratedImage>> {
        let pipeline = self.pipeline.clone();
        let prompt = prompt.to_string();
        let options = options.clone();
        tokio::task::spawn_blocking(move || pipeline.generate_batch(&prompt, count, &options))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    pub fn generate_streaming(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<tokio_stream::wrappers::ReceiverStream<Result<GenerationStep>>> {
        self.pipeline.generate_streaming(prompt, options)
    }
}
