//! Weight file resolution: local paths or Hugging Face hub downloads.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::DType;
use log::info;

/// Base SDXL checkpoint used when no repository override is given.
pub const SDXL_BASE_REPO: &str = "stabilityai/stable-diffusion-xl-base-1.0";

/// Alternate autoencoder checkpoint whose decoder is numerically stable in f16.
pub const VAE_FP16_FIX_REPO: &str = "madebyollin/sdxl-vae-fp16-fix";

const TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const TOKENIZER_2_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";

/// A weight file, either on disk or inside a hub repository.
#[derive(Debug, Clone)]
pub enum WeightFile {
    Path(PathBuf),
    Repository { repo: String, filename: String },
}

impl WeightFile {
    pub fn repository(repo: impl Into<String>, filename: impl Into<String>) -> Self {
        Self::Repository {
            repo: repo.into(),
            filename: filename.into(),
        }
    }

    /// Resolve to a local path, downloading from the hub if needed.
    /// A repository string that names an existing local directory is treated
    /// as a diffusers-layout checkout and joined instead of downloaded.
    pub fn fetch(&self) -> Result<PathBuf> {
        match self {
            Self::Path(path) => Ok(path.clone()),
            Self::Repository { repo, filename } => {
                let local = Path::new(repo);
                if local.is_dir() {
                    return Ok(local.join(filename));
                }
                info!("Fetching {filename} from {repo}");
                let api = hf_hub::api::sync::Api::new()?;
                api.model(repo.clone())
                    .get(filename)
                    .with_context(|| format!("failed to fetch {filename} from {repo}"))
            }
        }
    }
}

impl From<PathBuf> for WeightFile {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&str> for WeightFile {
    fn from(path: &str) -> Self {
        Self::Path(path.into())
    }
}

/// The full set of files needed to build an SDXL pipeline, laid out the way
/// diffusers repositories are.
#[derive(Debug, Clone)]
pub struct SdxlWeightFiles {
    pub unet: WeightFile,
    pub vae: WeightFile,
    pub clip: WeightFile,
    pub clip2: WeightFile,
    pub tokenizer: WeightFile,
    pub tokenizer2: WeightFile,
}

impl SdxlWeightFiles {
    /// Default file set for a repository, picking fp16 weight variants when
    /// running at half precision. The f16 VAE comes from the fp16-fix
    /// checkpoint since the base SDXL decoder overflows in f16.
    pub fn from_repository(repo: &str, dtype: DType) -> Self {
        let use_f16 = dtype == DType::F16;
        let unet = WeightFile::repository(
            repo,
            if use_f16 {
                "unet/diffusion_pytorch_model.fp16.safetensors"
            } else {
                "unet/diffusion_pytorch_model.safetensors"
            },
        );
        let vae = if use_f16 {
            WeightFile::repository(VAE_FP16_FIX_REPO, "diffusion_pytorch_model.safetensors")
        } else {
            WeightFile::repository(repo, "vae/diffusion_pytorch_model.safetensors")
        };
        let clip = WeightFile::repository(
            repo,
            if use_f16 {
                "text_encoder/model.fp16.safetensors"
            } else {
                "text_encoder/model.safetensors"
            },
        );
        let clip2 = WeightFile::repository(
            repo,
            if use_f16 {
                "text_encoder_2/model.fp16.safetensors"
            } else {
                "text_encoder_2/model.safetensors"
            },
        );
        let tokenizer = WeightFile::repository(TOKENIZER_REPO, "tokenizer.json");
        let tokenizer2 = WeightFile::repository(TOKENIZER_2_REPO, "tokenizer.json");
        Self {
            unet,
            vae,
            clip,
            clip2,
            tokenizer,
            tokenizer2,
        }
    }

    /// Substitute the autoencoder weights.
    pub fn with_vae(self, vae: WeightFile) -> Self {
        Self { vae, ..self }
    }

    /// Substitute the UNet weights.
    pub fn with_unet(self, unet: WeightFile) -> Self {
        Self { unet, ..self }
    }
}
