//! End-to-end SDXL text-to-image pipeline.

use std::path::PathBuf;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use image::RgbImage;
use log::info;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::files::{SdxlWeightFiles, WeightFile, SDXL_BASE_REPO};
use crate::lora::LoraAdapter;
use crate::schedulers::SchedulerKind;
use crate::text_encoders::TextEncoders;
use crate::unet::UNet;
use crate::vae::Vae;

/// Per-image generation options.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

impl GenerationOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: 1024,
            height: 1024,
            num_inference_steps: 30,
            guidance_scale: 5.0,
            seed: None,
        }
    }

    pub fn with_negative_prompt(self, negative_prompt: Option<String>) -> Self {
        Self { negative_prompt, ..self }
    }

    pub fn with_size(self, width: usize, height: usize) -> Self {
        Self { width, height, ..self }
    }

    pub fn with_steps(self, num_inference_steps: usize) -> Self {
        Self { num_inference_steps, ..self }
    }

    pub fn with_guidance_scale(self, guidance_scale: f64) -> Self {
        Self { guidance_scale, ..self }
    }

    pub fn with_seed(self, seed: Option<u64>) -> Self {
        Self { seed, ..self }
    }
}

/// Configuration for building an [`SdxlPipeline`].
pub struct SdxlPipelineBuilder {
    repository: String,
    dtype: DType,
    lora: Option<(PathBuf, f64)>,
    scheduler: SchedulerKind,
    vae_override: Option<WeightFile>,
}

impl Default for SdxlPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SdxlPipelineBuilder {
    pub fn new() -> Self {
        Self {
            repository: SDXL_BASE_REPO.to_string(),
            dtype: DType::F16,
            lora: None,
            scheduler: SchedulerKind::DpmSolverMultistep,
            vae_override: None,
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_lora(mut self, path: impl Into<PathBuf>, strength: f64) -> Self {
        self.lora = Some((path.into(), strength));
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_vae(mut self, vae: WeightFile) -> Self {
        self.vae_override = Some(vae);
        self
    }

    pub fn build(self, device: &Device) -> Result<SdxlPipeline> {
        let config = StableDiffusionConfig::sdxl(None, None, None);
        let mut files = SdxlWeightFiles::from_repository(&self.repository, self.dtype);
        if let Some(vae) = self.vae_override {
            files = files.with_vae(vae);
        }

        let adapter = match &self.lora {
            Some((path, strength)) => Some((LoraAdapter::load(path, device)?, *strength)),
            None => None,
        };
        let lora = adapter.as_ref().map(|(a, s)| (a, *s));

        let text_encoders = TextEncoders::new(&config, &files, lora, device, self.dtype)?;
        let unet = UNet::new(&config, &files.unet, lora, device, self.dtype)?;
        let vae = Vae::new(&config, &files.vae, device, self.dtype)?;

        Ok(SdxlPipeline {
            device: device.clone(),
            dtype: self.dtype,
            scheduler: self.scheduler,
            text_encoders,
            unet,
            vae,
        })
    }
}

/// A ready-to-sample SDXL pipeline, reusable across generations.
pub struct SdxlPipeline {
    device: Device,
    dtype: DType,
    scheduler: SchedulerKind,
    text_encoders: TextEncoders,
    unet: UNet,
    vae: Vae,
}

impl SdxlPipeline {
    /// Render one image. Seeded generations are reproducible regardless of
    /// the compute device.
    pub fn generate(&self, options: &GenerationOptions) -> Result<RgbImage> {
        anyhow::ensure!(
            options.width % 8 == 0 && options.height % 8 == 0,
            "image dimensions must be multiples of 8, got {}x{}",
            options.width,
            options.height
        );

        let mut scheduler = self.scheduler.build(options.num_inference_steps)?;
        let use_guidance = options.guidance_scale > 1.0;

        let text_embeddings = if use_guidance {
            self.text_encoders
                .encode_pair(&options.prompt, options.negative_prompt.as_deref())?
        } else {
            self.text_encoders.encode(&options.prompt)?
        };

        let mut latents = (self.initial_latents(options)? * scheduler.init_noise_sigma())?;

        let timesteps = scheduler.timesteps().to_vec();
        info!(
            "Sampling \"{}\" ({} steps, guidance {})",
            options.prompt,
            timesteps.len(),
            options.guidance_scale
        );
        #[cfg(feature = "progress-bar")]
        let progress = indicatif::ProgressBar::new(timesteps.len() as u64);

        for &timestep in &timesteps {
            let latent_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler
                .scale_model_input(latent_input, timestep)?
                .to_dtype(self.dtype)?;

            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &text_embeddings)?
                .to_dtype(DType::F32)?;

            let noise_pred = if use_guidance {
                let parts = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&parts[0], &parts[1]);
                (uncond + ((cond - uncond)? * options.guidance_scale)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;

            #[cfg(feature = "progress-bar")]
            progress.inc(1);
        }
        #[cfg(feature = "progress-bar")]
        progress.finish_and_clear();

        self.vae.decode_to_image(&latents.to_dtype(self.dtype)?)
    }

    /// Gaussian initial latents, seeded through a host-side generator so the
    /// same seed reproduces the same image on every backend.
    fn initial_latents(&self, options: &GenerationOptions) -> Result<Tensor> {
        let shape = (1usize, 4usize, options.height / 8, options.width / 8);
        match options.seed {
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(seed);
                let count = 4 * (options.height / 8) * (options.width / 8);
                let noise: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
                Ok(Tensor::from_vec(noise, shape, &self.device)?)
            }
            None => Ok(Tensor::randn(0f32, 1f32, shape, &self.device)?),
        }
    }
}
