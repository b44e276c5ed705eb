//! Single-prompt SDXL generation.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use lora_showcase::device::select_device;
use lora_showcase::{GenerationOptions, SchedulerKind, SdxlPipelineBuilder};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The prompt to be used for image generation.
    #[arg(long)]
    prompt: String,

    /// The negative prompt for classifier-free guidance.
    #[arg(long)]
    negative_prompt: Option<String>,

    /// The repository or local directory to load the base weights from.
    #[arg(long)]
    repository: Option<String>,

    /// A LoRA safetensors file to merge before sampling.
    #[arg(long)]
    lora: Option<PathBuf>,

    /// Merge strength for the LoRA adapter.
    #[arg(long, default_value_t = 1.0)]
    lora_strength: f64,

    /// The scheduler to sample with.
    #[arg(long, value_enum, default_value = "dpm-solver-multistep")]
    scheduler: SchedulerKind,

    /// The width in pixels of the generated image.
    #[arg(long, default_value_t = 1024)]
    width: usize,

    /// The height in pixels of the generated image.
    #[arg(long, default_value_t = 1024)]
    height: usize,

    /// The number of denoising steps.
    #[arg(long, default_value_t = 30)]
    steps: usize,

    /// The guidance scale.
    #[arg(long, default_value_t = 5.0)]
    guidance_scale: f64,

    /// The seed for reproducible sampling.
    #[arg(long)]
    seed: Option<u64>,

    /// The output file to save the generated image to.
    #[arg(long, default_value = "output.png")]
    output: PathBuf,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    lora_showcase::logging::init_logger();
    let args = Args::parse();

    let device = select_device(args.cpu)?;
    let mut builder = SdxlPipelineBuilder::new().with_scheduler(args.scheduler);
    if let Some(repository) = &args.repository {
        builder = builder.with_repository(repository);
    }
    if let Some(lora) = &args.lora {
        builder = builder.with_lora(lora, args.lora_strength);
    }
    let pipeline = builder.build(&device)?;

    let options = GenerationOptions::new(&args.prompt)
        .with_negative_prompt(args.negative_prompt)
        .with_size(args.width, args.height)
        .with_steps(args.steps)
        .with_guidance_scale(args.guidance_scale)
        .with_seed(args.seed);
    let image = pipeline.generate(&options)?;

    info!("Saving {}", args.output.display());
    image.save(&args.output)?;
    Ok(())
}
