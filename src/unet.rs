//! SDXL UNet wrapper with LoRA merging at load time.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::{
    unet_2d::UNet2DConditionModel, StableDiffusionConfig,
};
use log::info;

use crate::files::WeightFile;
use crate::lora::{LoraAdapter, LoraTarget};

const UNET_IN_CHANNELS: usize = 4;

pub struct UNet {
    unet: UNet2DConditionModel,
}

impl UNet {
    /// Build the UNet from a checkpoint. When a LoRA adapter carries UNet
    /// updates they are merged into the weights first; the merged weights are
    /// materialized in the system temp dir and built from there, since
    /// the candle builder loads from a file.
    pub fn new(
        config: &StableDiffusionConfig,
        file: &WeightFile,
        lora: Option<(&LoraAdapter, f64)>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let path = file.fetch()?;
        let path = match lora {
            Some((adapter, strength)) if adapter.has_target(LoraTarget::Unet) => {
                Self::merge_lora(&path, adapter, strength, device)?
            }
            _ => path,
        };
        info!("Building the UNet from {}", path.display());
        let use_flash_attn = cfg!(feature = "flash-attn");
        let unet = config.build_unet(path, device, UNET_IN_CHANNELS, use_flash_attn, dtype)?;
        Ok(Self { unet })
    }

    fn merge_lora(
        path: &Path,
        adapter: &LoraAdapter,
        strength: f64,
        device: &Device,
    ) -> Result<PathBuf> {
        let mut tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let merged = adapter.merge_into(LoraTarget::Unet, &mut tensors, strength)?;
        info!("Applied {merged} LoRA updates to the UNet (strength {strength})");

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unet");
        let merged_path = std::env::temp_dir().join(format!("{stem}-lora-merged.safetensors"));
        candle_core::safetensors::save(&tensors, &merged_path)
            .with_context(|| format!("failed to write {}", merged_path.display()))?;
        Ok(merged_path)
    }

    pub fn forward(
        &self,
        latents: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        Ok(self.unet.forward(latents, timestep, encoder_hidden_states)?)
    }
}
