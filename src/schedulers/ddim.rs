//! Deterministic DDIM scheduler (eta = 0, epsilon prediction).

use anyhow::Result;
use candle_core::Tensor;

use super::{alphas_cumprod, spaced_timesteps, Scheduler, BETA_END, BETA_START, TRAIN_TIMESTEPS};

pub struct DdimScheduler {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    step_ratio: usize,
}

impl DdimScheduler {
    pub fn new(num_inference_steps: usize) -> Result<Self> {
        anyhow::ensure!(
            num_inference_steps > 0 && num_inference_steps <= TRAIN_TIMESTEPS,
            "inference steps must be in 1..={TRAIN_TIMESTEPS}, got {num_inference_steps}"
        );
        Ok(Self {
            timesteps: spaced_timesteps(TRAIN_TIMESTEPS, num_inference_steps),
            alphas_cumprod: alphas_cumprod(TRAIN_TIMESTEPS, BETA_START, BETA_END),
            step_ratio: TRAIN_TIMESTEPS / num_inference_steps,
        })
    }
}

impl Scheduler for DdimScheduler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> Result<Tensor> {
        // DDIM does not scale the model input.
        Ok(sample)
    }

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        // The last step targets the fully denoised boundary.
        let alpha_prod_prev = if timestep >= self.step_ratio {
            self.alphas_cumprod[timestep - self.step_ratio]
        } else {
            1.0
        };

        let sqrt_alpha = alpha_prod_t.sqrt();
        let sqrt_one_minus_alpha = (1.0 - alpha_prod_t).sqrt();

        // x_0 = (x_t - sqrt(1 - a_t) * eps) / sqrt(a_t)
        let pred_original = ((sample - (model_output * sqrt_one_minus_alpha)?)? / sqrt_alpha)?;

        // x_{t-1} = sqrt(a_prev) * x_0 + sqrt(1 - a_prev) * eps
        let direction = (model_output * (1.0 - alpha_prod_prev).sqrt())?;
        Ok(((pred_original * alpha_prod_prev.sqrt())? + direction)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn final_step_returns_prediction() {
        // With a zero epsilon prediction at t = 0, the step collapses to
        // x / sqrt(a_0), the plain x0 estimate.
        let mut scheduler = DdimScheduler::new(20).unwrap();
        let device = Device::Cpu;
        let sample = Tensor::ones((1, 4, 2, 2), candle_core::DType::F32, &device).unwrap();
        let eps = Tensor::zeros((1, 4, 2, 2), candle_core::DType::F32, &device).unwrap();

        let out = scheduler.step(&eps, 0, &sample).unwrap();
        let expected = 1.0 / scheduler.alphas_cumprod[0].sqrt();
        let value: f32 = out.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((value as f64 - expected).abs() < 1e-4);
    }

    #[test]
    fn rejects_zero_steps() {
        assert!(DdimScheduler::new(0).is_err());
    }

    #[test]
    fn preserves_shape() {
        let mut scheduler = DdimScheduler::new(10).unwrap();
        let device = Device::Cpu;
        let sample = Tensor::randn(0f32, 1f32, (1, 4, 8, 8), &device).unwrap();
        let eps = Tensor::randn(0f32, 1f32, (1, 4, 8, 8), &device).unwrap();
        let t = scheduler.timesteps()[0];
        let out = scheduler.step(&eps, t, &sample).unwrap();
        assert_eq!(out.dims(), sample.dims());
    }
}
