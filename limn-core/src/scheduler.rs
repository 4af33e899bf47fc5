//! Latent Consistency Model sampling.
//!
//! LCM distils a diffusion model so that a handful of consistency steps (four
//! is typical) replace the usual few dozen solver iterations. Each step maps
//! the current noisy latent straight to an estimate of the clean image and,
//! except on the last step, re-noises that estimate down to the next timestep
//! on the schedule.

use std::path::Path;

use candle_core::{Device, Tensor};
use candle_transformers::models::stable_diffusion::schedulers::{BetaSchedule, PredictionType};
use rand::rngs::StdRng;
use serde::Deserialize;

use crate::util::randn;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct LcmSchedulerConfig {
    /// Value of beta at the beginning of training.
    pub beta_start: f64,
    /// Value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// Number of diffusion steps used to train the model.
    pub train_timesteps: usize,
    /// Length of the timestep ladder the consistency model was distilled
    /// against. Inference steps are drawn from this ladder, so requesting
    /// more steps than this is an error.
    pub original_inference_steps: usize,
    /// Multiplier applied to timesteps before computing boundary scalings.
    pub timestep_scaling: f64,
    /// Standard deviation of the data distribution assumed by the
    /// consistency parameterization.
    pub sigma_data: f64,
    pub prediction_type: PredictionType,
}

impl Default for LcmSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            train_timesteps: 1000,
            original_inference_steps: 50,
            timestep_scaling: 10.0,
            sigma_data: 0.5,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

/// Fields of a diffusers-style `scheduler_config.json`. Only the constants
/// this scheduler consumes are read; anything absent falls back to the
/// defaults above.
#[derive(Debug, Deserialize)]
struct RawSchedulerConfig {
    beta_start: Option<f64>,
    beta_end: Option<f64>,
    beta_schedule: Option<String>,
    num_train_timesteps: Option<usize>,
    original_inference_steps: Option<usize>,
    timestep_scaling: Option<f64>,
    prediction_type: Option<String>,
}

impl LcmSchedulerConfig {
    /// Reads schedule constants from the `scheduler_config.json` shipped
    /// with a model export.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let raw: RawSchedulerConfig = serde_json::from_str(&contents)
            .map_err(|e| Error::MalformedModel(format!("bad scheduler config: {e}")))?;
        let defaults = Self::default();
        let beta_schedule = match raw.beta_schedule.as_deref() {
            None => defaults.beta_schedule,
            Some("linear") => BetaSchedule::Linear,
            Some("scaled_linear") => BetaSchedule::ScaledLinear,
            Some("squaredcos_cap_v2") => BetaSchedule::SquaredcosCapV2,
            Some(other) => {
                return Err(Error::MalformedModel(format!(
                    "unknown beta schedule {other:?}"
                )))
            }
        };
        let prediction_type = match raw.prediction_type.as_deref() {
            None => defaults.prediction_type,
            Some("epsilon") => PredictionType::Epsilon,
            Some("v_prediction") => PredictionType::VPrediction,
            Some("sample") => PredictionType::Sample,
            Some(other) => {
                return Err(Error::MalformedModel(format!(
                    "unknown prediction type {other:?}"
                )))
            }
        };
        Ok(Self {
            beta_start: raw.beta_start.unwrap_or(defaults.beta_start),
            beta_end: raw.beta_end.unwrap_or(defaults.beta_end),
            beta_schedule,
            train_timesteps: raw.num_train_timesteps.unwrap_or(defaults.train_timesteps),
            original_inference_steps: raw
                .original_inference_steps
                .unwrap_or(defaults.original_inference_steps),
            timestep_scaling: raw.timestep_scaling.unwrap_or(defaults.timestep_scaling),
            sigma_data: defaults.sigma_data,
            prediction_type,
        })
    }
}

#[derive(Debug)]
pub struct LcmScheduler {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    config: LcmSchedulerConfig,
}

impl LcmScheduler {
    pub fn new(inference_steps: usize, config: LcmSchedulerConfig) -> Result<Self> {
        // The ladder arithmetic below needs at least one train timestep per
        // original inference step.
        if config.train_timesteps == 0
            || config.original_inference_steps == 0
            || config.original_inference_steps > config.train_timesteps
        {
            return Err(Error::MalformedModel(format!(
                "schedule declares {} original inference steps over {} train timesteps",
                config.original_inference_steps, config.train_timesteps
            )));
        }
        if inference_steps == 0 {
            return Err(Error::InvalidOptions("steps must be at least 1".into()));
        }
        if inference_steps > config.original_inference_steps {
            return Err(Error::InvalidOptions(format!(
                "steps must be at most {}, got {inference_steps}",
                config.original_inference_steps
            )));
        }
        let betas = match config.beta_schedule {
            BetaSchedule::ScaledLinear => linspace(
                config.beta_start.sqrt(),
                config.beta_end.sqrt(),
                config.train_timesteps,
            )
            .into_iter()
            .map(|b| b * b)
            .collect::<Vec<_>>(),
            BetaSchedule::Linear => {
                linspace(config.beta_start, config.beta_end, config.train_timesteps)
            }
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(config.train_timesteps, 0.999),
        };
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut product = 1.0;
        for beta in &betas {
            product *= 1.0 - beta;
            alphas_cumprod.push(product);
        }

        // The distilled model only saw timesteps of the form (i + 1) * k - 1
        // where k = train_timesteps / original_inference_steps. Walk that
        // ladder backwards with an even stride.
        let k = config.train_timesteps / config.original_inference_steps;
        let origins: Vec<usize> = (0..config.original_inference_steps)
            .map(|i| (i + 1) * k - 1)
            .collect();
        let stride = config.original_inference_steps / inference_steps;
        let timesteps: Vec<usize> = origins
            .into_iter()
            .rev()
            .step_by(stride.max(1))
            .take(inference_steps)
            .collect();

        Ok(Self {
            timesteps,
            alphas_cumprod,
            config,
        })
    }

    /// Timesteps to iterate over, strictly descending.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Draws the initial unit-variance latent for a generation.
    pub fn create_noise(
        &self,
        rng: &mut StdRng,
        shape: &[usize],
        device: &Device,
    ) -> Result<Tensor> {
        randn(rng, shape, device)
    }

    /// LCM latents feed the denoiser unscaled.
    pub fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> Result<Tensor> {
        Ok(sample)
    }

    /// Consistency-model boundary scalings. At t = 0 the model is pinned to
    /// the identity: c_skip = 1, c_out = 0.
    fn boundary_scalings(&self, timestep: usize) -> (f64, f64) {
        let scaled = timestep as f64 * self.config.timestep_scaling;
        let sigma_sq = self.config.sigma_data * self.config.sigma_data;
        let c_skip = sigma_sq / (scaled * scaled + sigma_sq);
        let c_out = scaled / (scaled * scaled + sigma_sq).sqrt();
        (c_skip, c_out)
    }

    /// Runs one consistency step.
    ///
    /// Returns the latent for the next iteration. On the final timestep the
    /// returned tensor is the denoised estimate itself, with no noise added,
    /// so the caller can decode it directly.
    pub fn step(
        &self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        let step_index = self
            .timesteps
            .iter()
            .position(|&t| t == timestep)
            .ok_or_else(|| {
                Error::InvalidOptions(format!("timestep {timestep} is not on the schedule"))
            })?;

        let alpha_prod_t = self.alphas_cumprod[timestep];
        let beta_prod_t = 1.0 - alpha_prod_t;

        let predicted_original = match self.config.prediction_type {
            PredictionType::Epsilon => {
                ((sample - (model_output * beta_prod_t.sqrt())?)? * (1. / alpha_prod_t.sqrt()))?
            }
            PredictionType::Sample => model_output.clone(),
            PredictionType::VPrediction => ((sample * alpha_prod_t.sqrt())?
                - (model_output * beta_prod_t.sqrt())?)?,
        };

        let (c_skip, c_out) = self.boundary_scalings(timestep);
        let denoised = ((predicted_original * c_out)? + (sample * c_skip)?)?;

        let last = step_index + 1 == self.timesteps.len();
        if last {
            return Ok(denoised);
        }

        let prev_timestep = self.timesteps[step_index + 1];
        let alpha_prod_prev = self.alphas_cumprod[prev_timestep];
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let noise = randn(rng, sample.dims(), sample.device())?;
        Ok(((denoised * alpha_prod_prev.sqrt())? + (noise * beta_prod_prev.sqrt())?)?)
    }
}

fn linspace(start: f64, stop: f64, steps: usize) -> Vec<f64> {
    if steps == 1 {
        return vec![start];
    }
    let delta = (stop - start) / (steps - 1) as f64;
    (0..steps).map(|i| start + i as f64 * delta).collect()
}

fn betas_for_alpha_bar(num_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
    (0..num_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_timesteps as f64;
            let t2 = (i + 1) as f64 / num_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn scheduler(steps: usize) -> LcmScheduler {
        LcmScheduler::new(steps, LcmSchedulerConfig::default()).unwrap()
    }

    #[test]
    fn four_step_schedule_matches_reference() {
        assert_eq!(scheduler(4).timesteps(), &[999, 759, 519, 279]);
    }

    #[test]
    fn one_step_schedule_starts_at_the_top() {
        assert_eq!(scheduler(1).timesteps(), &[999]);
    }

    #[test]
    fn schedules_are_strictly_descending() {
        for steps in [1, 2, 3, 4, 8, 25, 50] {
            let ts = scheduler(steps).timesteps().to_vec();
            assert_eq!(ts.len(), steps);
            for pair in ts.windows(2) {
                assert!(pair[0] > pair[1], "{ts:?} is not strictly descending");
            }
        }
    }

    #[test]
    fn zero_steps_is_rejected() {
        let err = LcmScheduler::new(0, LcmSchedulerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn too_many_steps_is_rejected() {
        let err = LcmScheduler::new(51, LcmSchedulerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn ladder_longer_than_training_is_malformed() {
        // A ladder of 200 origins cannot fit into 100 train timesteps; this
        // must fail cleanly rather than underflow during ladder construction.
        let config = LcmSchedulerConfig {
            train_timesteps: 100,
            original_inference_steps: 200,
            ..Default::default()
        };
        let err = LcmScheduler::new(4, config).unwrap_err();
        assert!(matches!(err, Error::MalformedModel(_)));
    }

    #[test]
    fn degenerate_schedule_constants_are_malformed() {
        for (train, original) in [(0, 50), (1000, 0)] {
            let config = LcmSchedulerConfig {
                train_timesteps: train,
                original_inference_steps: original,
                ..Default::default()
            };
            let err = LcmScheduler::new(1, config).unwrap_err();
            assert!(matches!(err, Error::MalformedModel(_)), "{train}/{original}");
        }
    }

    #[test]
    fn boundary_scalings_pin_identity_at_zero() {
        let s = scheduler(4);
        let (c_skip, c_out) = s.boundary_scalings(0);
        assert!((c_skip - 1.0).abs() < 1e-12);
        assert!(c_out.abs() < 1e-12);
    }

    #[test]
    fn final_step_adds_no_noise() {
        let s = scheduler(4);
        let device = Device::Cpu;
        let sample = Tensor::full(0.5f32, (1, 4, 8, 8), &device).unwrap();
        let output = Tensor::full(0.1f32, (1, 4, 8, 8), &device).unwrap();
        let last = *s.timesteps().last().unwrap();
        let mut rng1 = StdRng::seed_from_u64(1);
        let mut rng2 = StdRng::seed_from_u64(2);
        let a = s.step(&output, last, &sample, &mut rng1).unwrap();
        let b = s.step(&output, last, &sample, &mut rng2).unwrap();
        // Different RNG streams, identical results: no noise on the last step.
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn step_is_deterministic_for_a_seed() {
        let s = scheduler(4);
        let device = Device::Cpu;
        let sample = Tensor::full(0.5f32, (1, 4, 8, 8), &device).unwrap();
        let output = Tensor::full(0.1f32, (1, 4, 8, 8), &device).unwrap();
        let t = s.timesteps()[0];
        let mut rng1 = StdRng::seed_from_u64(9);
        let mut rng2 = StdRng::seed_from_u64(9);
        let a = s.step(&output, t, &sample, &mut rng1).unwrap();
        let b = s.step(&output, t, &sample, &mut rng2).unwrap();
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn config_is_read_from_a_diffusers_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler_config.json");
        std::fs::write(
            &path,
            r#"{
                "_class_name": "LCMScheduler",
                "beta_start": 0.001,
                "beta_end": 0.02,
                "beta_schedule": "linear",
                "num_train_timesteps": 1000,
                "original_inference_steps": 25,
                "prediction_type": "epsilon"
            }"#,
        )
        .unwrap();
        let config = LcmSchedulerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.beta_start, 0.001);
        assert_eq!(config.original_inference_steps, 25);
        assert!(matches!(config.beta_schedule, BetaSchedule::Linear));
        // Unlisted constants keep their defaults.
        assert_eq!(config.timestep_scaling, 10.0);
    }

    #[test]
    fn unknown_beta_schedule_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler_config.json");
        std::fs::write(&path, r#"{"beta_schedule": "cubic"}"#).unwrap();
        let err = LcmSchedulerConfig::from_json_file(&path).unwrap_err();
        assert!(matches!(err, Error::MalformedModel(_)));
    }

    #[test]
    fn off_schedule_timestep_is_rejected() {
        let s = scheduler(4);
        let device = Device::Cpu;
        let sample = Tensor::zeros((1, 4, 8, 8), candle_core::DType::F32, &device).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let err = s.step(&sample, 500, &sample, &mut rng).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }
}
