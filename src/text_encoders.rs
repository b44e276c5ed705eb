//! SDXL text encoding: both CLIP tokenizers and text transformers, with
//! classifier-free-guidance pair encoding.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{
    clip::{self, ClipTextTransformer},
    StableDiffusionConfig,
};
use log::info;

use crate::files::SdxlWeightFiles;
use crate::lora::{LoraAdapter, LoraTarget};

/// CLIP tokenizer with the padding behavior of the SDXL checkpoints.
pub struct PromptTokenizer {
    tokenizer: tokenizers::Tokenizer,
    pad_id: u32,
    max_position_embeddings: usize,
}

impl PromptTokenizer {
    pub fn new(config: &clip::Config, file: impl AsRef<std::path::Path>) -> Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(file).map_err(anyhow::Error::msg)?;
        let vocab = tokenizer.get_vocab(true);
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *vocab
            .get(pad_token)
            .ok_or_else(|| anyhow!("pad token {pad_token} missing from tokenizer vocab"))?;
        Ok(Self {
            tokenizer,
            pad_id,
            max_position_embeddings: config.max_position_embeddings,
        })
    }

    /// Token ids padded to the encoder's context length.
    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(self.max_position_embeddings);
        while tokens.len() < self.max_position_embeddings {
            tokens.push(self.pad_id);
        }
        Ok(tokens)
    }
}

/// Both SDXL text encoders and their tokenizers.
pub struct TextEncoders {
    tokenizer: PromptTokenizer,
    tokenizer2: PromptTokenizer,
    clip: ClipTextTransformer,
    clip2: ClipTextTransformer,
    device: Device,
    dtype: DType,
}

impl TextEncoders {
    pub fn new(
        sd_config: &StableDiffusionConfig,
        files: &SdxlWeightFiles,
        lora: Option<(&LoraAdapter, f64)>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let clip2_config = sd_config
            .clip2
            .as_ref()
            .context("SDXL config is missing the second text encoder")?;

        let tokenizer = PromptTokenizer::new(&sd_config.clip, files.tokenizer.fetch()?)?;
        let tokenizer2 = PromptTokenizer::new(clip2_config, files.tokenizer2.fetch()?)?;

        info!("Building the first text encoder");
        let clip = Self::build_clip(
            &files.clip,
            &sd_config.clip,
            lora,
            LoraTarget::TextEncoder,
            device,
            dtype,
        )?;
        info!("Building the second text encoder");
        let clip2 = Self::build_clip(
            &files.clip2,
            clip2_config,
            lora,
            LoraTarget::TextEncoder2,
            device,
            dtype,
        )?;

        Ok(Self {
            tokenizer,
            tokenizer2,
            clip,
            clip2,
            device: device.clone(),
            dtype,
        })
    }

    fn build_clip(
        file: &crate::files::WeightFile,
        config: &clip::Config,
        lora: Option<(&LoraAdapter, f64)>,
        target: LoraTarget,
        device: &Device,
        dtype: DType,
    ) -> Result<ClipTextTransformer> {
        let path = file.fetch()?;
        let mut tensors = candle_core::safetensors::load(&path, device)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if let Some((adapter, strength)) = lora {
            if adapter.has_target(target) {
                let merged = adapter.merge_into(target, &mut tensors, strength)?;
                info!("Applied {merged} LoRA updates to {target:?}");
            }
        }
        let vb = VarBuilder::from_tensors(tensors, dtype, device);
        Ok(ClipTextTransformer::new(vb, config)?)
    }

    /// Hidden states for a prompt, both encoders concatenated on the feature
    /// dimension: `[1, 77, 2048]`.
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let tokens = Tensor::new(self.tokenizer.tokenize(prompt)?, &self.device)?.unsqueeze(0)?;
        let tokens2 = Tensor::new(self.tokenizer2.tokenize(prompt)?, &self.device)?.unsqueeze(0)?;
        let hidden = self.clip.forward(&tokens)?;
        let hidden2 = self.clip2.forward(&tokens2)?;
        Ok(Tensor::cat(&[hidden, hidden2], 2)?.to_dtype(self.dtype)?)
    }

    /// Embeddings for classifier-free guidance: the unconditional row stacked
    /// before the conditional row, `[2, 77, 2048]`. Without a negative prompt
    /// the empty string is encoded.
    pub fn encode_pair(&self, prompt: &str, negative_prompt: Option<&str>) -> Result<Tensor> {
        let cond = self.encode(prompt)?;
        let uncond = self.encode(negative_prompt.unwrap_or(""))?;
        Ok(Tensor::cat(&[uncond, cond], 0)?)
    }
}
