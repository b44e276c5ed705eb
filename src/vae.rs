//! Autoencoder wrapper: latents in, RGB images out.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::models::stable_diffusion::{vae::AutoEncoderKL, StableDiffusionConfig};
use image::RgbImage;
use log::info;

use crate::files::WeightFile;

/// Latent scaling factor of the SDXL autoencoder.
pub const VAE_SCALE_FACTOR: f64 = 0.13025;

pub struct Vae {
    vae: AutoEncoderKL,
}

impl Vae {
    pub fn new(
        config: &StableDiffusionConfig,
        file: &WeightFile,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let path = file.fetch()?;
        info!("Building the autoencoder from {}", path.display());
        let vae = config.build_vae(path, device, dtype)?;
        Ok(Self { vae })
    }

    /// Decode a `[1, 4, h/8, w/8]` latent into an RGB image.
    pub fn decode_to_image(&self, latents: &Tensor) -> Result<RgbImage> {
        let image = self.vae.decode(&(latents / VAE_SCALE_FACTOR)?)?;
        let image = ((image / 2.)? + 0.5)?
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        let (channels, height, width) = image.dims3()?;
        anyhow::ensure!(channels == 3, "expected 3 output channels, got {channels}");
        let pixels = image.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
        RgbImage::from_raw(width as u32, height as u32, pixels)
            .context("decoded tensor does not fill an image buffer")
    }
}
