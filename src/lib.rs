pub mod config;
pub mod device;
pub mod files;
pub mod lora;
pub mod pipeline;
pub mod prompt;
pub mod schedulers;
pub mod text_encoders;
pub mod unet;
pub mod vae;

// Re-export common types
pub use config::{load_config, ShowcaseConfig};
pub use pipeline::{GenerationOptions, SdxlPipeline, SdxlPipelineBuilder};
pub use schedulers::SchedulerKind;

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    pub fn init_logger() {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .parse_default_env()
            .init();
    }
}
