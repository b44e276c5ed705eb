//! Render the LoRA subject in every profession from the configured list.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use lora_showcase::device::select_device;
use lora_showcase::prompt::{output_filename, showcase_prompt};
use lora_showcase::{load_config, GenerationOptions, SdxlPipelineBuilder, ShowcaseConfig};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Optional YAML config; defaults reproduce the original showcase run.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the LoRA safetensors file from the config.
    #[arg(long)]
    lora: Option<PathBuf>,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    lora_showcase::logging::init_logger();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ShowcaseConfig::default(),
    };
    if let Some(lora) = args.lora {
        config.lora_file = lora;
    }

    let device = select_device(args.cpu)?;
    let pipeline = SdxlPipelineBuilder::new()
        .with_repository(&config.model)
        .with_lora(&config.lora_file, config.lora_strength)
        .with_scheduler(config.scheduler)
        .build(&device)?;

    std::fs::create_dir_all(&config.output_dir)?;
    for profession in &config.professions {
        let options = GenerationOptions::new(showcase_prompt(&config.trigger, profession))
            .with_size(config.width, config.height)
            .with_steps(config.steps)
            .with_guidance_scale(config.guidance_scale)
            .with_seed(Some(config.seed));
        let image = pipeline.generate(&options)?;

        let output = config
            .output_dir
            .join(output_filename(&config.subject, profession));
        info!("Saving {}", output.display());
        image.save(&output)?;
    }

    info!("Showcase complete: {} images", config.professions.len());
    Ok(())
}
