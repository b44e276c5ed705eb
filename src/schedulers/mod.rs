//! Noise schedulers for SDXL sampling.
//! The base checkpoint ships a DDIM-style configuration; the showcase swaps
//! in DPM-Solver++ (2M) which converges in far fewer steps.

pub mod ddim;
pub mod dpm_solver;

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

pub use ddim::DdimScheduler;
pub use dpm_solver::DpmSolverMultistepScheduler;

/// Training schedule shared by the SDXL checkpoints.
pub const TRAIN_TIMESTEPS: usize = 1000;
pub const BETA_START: f64 = 0.00085;
pub const BETA_END: f64 = 0.012;

/// Denoising scheduler interface used by the pipeline loop.
pub trait Scheduler {
    /// Descending timestep sequence, one entry per inference step.
    fn timesteps(&self) -> &[usize];

    /// Multiplier applied to the initial gaussian latents.
    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    /// Per-timestep scaling of the UNet input.
    fn scale_model_input(&self, sample: Tensor, timestep: usize) -> Result<Tensor>;

    /// Advance the sample one step given the model's epsilon prediction.
    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor>;
}

/// Selectable scheduler implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    Ddim,
    DpmSolverMultistep,
}

impl SchedulerKind {
    pub fn build(self, num_inference_steps: usize) -> Result<Box<dyn Scheduler>> {
        Ok(match self {
            Self::Ddim => Box::new(DdimScheduler::new(num_inference_steps)?),
            Self::DpmSolverMultistep => {
                Box::new(DpmSolverMultistepScheduler::new(num_inference_steps)?)
            }
        })
    }
}

/// Cumulative alpha products for the scaled-linear beta schedule.
pub(crate) fn alphas_cumprod(
    num_train_timesteps: usize,
    beta_start: f64,
    beta_end: f64,
) -> Vec<f64> {
    let start = beta_start.sqrt();
    let end = beta_end.sqrt();
    let mut cumprod = 1.0;
    (0..num_train_timesteps)
        .map(|i| {
            let beta = start + (end - start) * (i as f64) / (num_train_timesteps as f64 - 1.0);
            cumprod *= 1.0 - beta * beta;
            cumprod
        })
        .collect()
}

/// Evenly spaced descending timesteps ending at 0.
pub(crate) fn spaced_timesteps(num_train_timesteps: usize, num_inference_steps: usize) -> Vec<usize> {
    let step_ratio = num_train_timesteps / num_inference_steps;
    (0..num_inference_steps)
        .map(|i| (num_inference_steps - 1 - i) * step_ratio)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphas_cumprod_is_decreasing_in_unit_interval() {
        let alphas = alphas_cumprod(TRAIN_TIMESTEPS, BETA_START, BETA_END);
        assert_eq!(alphas.len(), TRAIN_TIMESTEPS);
        for pair in alphas.windows(2) {
            assert!(pair[1] < pair[0]);
        }
        assert!(alphas[0] < 1.0 && alphas[0] > 0.99);
        assert!(*alphas.last().unwrap() > 0.0);
    }

    #[test]
    fn timesteps_are_descending_and_end_at_zero() {
        let timesteps = spaced_timesteps(TRAIN_TIMESTEPS, 20);
        assert_eq!(timesteps.len(), 20);
        assert_eq!(timesteps[0], 950);
        assert_eq!(*timesteps.last().unwrap(), 0);
        for pair in timesteps.windows(2) {
            assert!(pair[1] < pair[0]);
        }
    }
}
