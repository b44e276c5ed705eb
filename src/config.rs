//! YAML configuration for the showcase run. Every default matches the
//! original generation script, so running without a config reproduces it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::files::SDXL_BASE_REPO;
use crate::prompt::PROFESSIONS;
use crate::schedulers::SchedulerKind;

#[derive(Debug, Serialize, Deserialize)]
pub struct ShowcaseConfig {
    /// Base checkpoint repository or local diffusers-layout directory.
    #[serde(default = "default_model")]
    pub model: String,
    /// LoRA safetensors file to merge.
    #[serde(default = "default_lora_file")]
    pub lora_file: PathBuf,
    #[serde(default = "default_lora_strength")]
    pub lora_strength: f64,
    #[serde(default = "default_scheduler")]
    pub scheduler: SchedulerKind,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    /// Seed reused for every image in the list.
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_size")]
    pub width: usize,
    #[serde(default = "default_size")]
    pub height: usize,
    /// Subject name used in output filenames.
    #[serde(default = "default_subject")]
    pub subject: String,
    /// Trigger phrase the adapter was trained on, used in prompts.
    #[serde(default = "default_trigger")]
    pub trigger: String,
    #[serde(default = "default_professions")]
    pub professions: Vec<String>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_model() -> String {
    SDXL_BASE_REPO.to_string()
}

fn default_lora_file() -> PathBuf {
    PathBuf::from("../output/bacana(white dog)d8a1.safetensors")
}

fn default_lora_strength() -> f64 {
    0.5
}

fn default_scheduler() -> SchedulerKind {
    SchedulerKind::DpmSolverMultistep
}

fn default_steps() -> usize {
    20
}

fn default_guidance_scale() -> f64 {
    5.0
}

fn default_seed() -> u64 {
    32
}

fn default_size() -> usize {
    1024
}

fn default_subject() -> String {
    "bacana".to_string()
}

fn default_trigger() -> String {
    "bacana white dog".to_string()
}

fn default_professions() -> Vec<String> {
    PROFESSIONS.iter().map(|p| p.to_string()).collect()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ShowcaseConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("defaults always deserialize")
    }
}

pub fn load_config(path: &Path) -> Result<ShowcaseConfig> {
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: ShowcaseConfig =
        serde_yaml::from_str(&config_str).with_context(|| "Failed to parse YAML config")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_original_script() {
        let config = ShowcaseConfig::default();
        assert_eq!(config.model, SDXL_BASE_REPO);
        assert_eq!(config.lora_strength, 0.5);
        assert_eq!(config.scheduler, SchedulerKind::DpmSolverMultistep);
        assert_eq!(config.steps, 20);
        assert_eq!(config.seed, 32);
        assert_eq!(config.trigger, "bacana white dog");
        assert_eq!(config.professions.len(), 8);
        assert_eq!(config.professions[0], "police officer");
    }

    #[test]
    fn partial_yaml_overrides_defaults() {
        let config: ShowcaseConfig = serde_yaml::from_str(
            "steps: 30\nscheduler: ddim\nprofessions:\n  - astronaut\n",
        )
        .unwrap();
        assert_eq!(config.steps, 30);
        assert_eq!(config.scheduler, SchedulerKind::Ddim);
        assert_eq!(config.professions, vec!["astronaut".to_string()]);
        // Untouched fields keep their defaults.
        assert_eq!(config.seed, 32);
        assert_eq!(config.guidance_scale, 5.0);
    }

    #[test]
    fn load_config_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("showcase.yaml");
        std::fs::write(&path, "subject: rex\ntrigger: rex brown dog\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.subject, "rex");
        assert_eq!(config.trigger, "rex brown dog");
    }
}
