//! DPM-Solver++ (2M) multistep scheduler.
//!
//! Second-order solver in the data-prediction (x0) formulation. The first
//! step is first-order; later steps reuse the previous x0 estimate. The last
//! step returns the x0 prediction directly, the zero-noise boundary of the
//! update rule.

use anyhow::Result;
use candle_core::Tensor;

use super::{alphas_cumprod, spaced_timesteps, Scheduler, BETA_END, BETA_START, TRAIN_TIMESTEPS};

pub struct DpmSolverMultistepScheduler {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    step_index: usize,
    previous: Option<PreviousStep>,
}

struct PreviousStep {
    pred_original: Tensor,
    h: f64,
}

/// alpha_t, sigma_t and lambda_t of the VP diffusion at a train timestep.
fn schedule_point(alphas_cumprod: &[f64], timestep: usize) -> (f64, f64, f64) {
    let alpha = alphas_cumprod[timestep].sqrt();
    let sigma = (1.0 - alphas_cumprod[timestep]).sqrt();
    (alpha, sigma, (alpha / sigma).ln())
}

impl DpmSolverMultistepScheduler {
    pub fn new(num_inference_steps: usize) -> Result<Self> {
        anyhow::ensure!(
            num_inference_steps > 0 && num_inference_steps <= TRAIN_TIMESTEPS,
            "inference steps must be in 1..={TRAIN_TIMESTEPS}, got {num_inference_steps}"
        );
        Ok(Self {
            timesteps: spaced_timesteps(TRAIN_TIMESTEPS, num_inference_steps),
            alphas_cumprod: alphas_cumprod(TRAIN_TIMESTEPS, BETA_START, BETA_END),
            step_index: 0,
            previous: None,
        })
    }
}

impl Scheduler for DpmSolverMultistepScheduler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        debug_assert_eq!(self.timesteps[self.step_index], timestep);

        let (alpha_t, sigma_t, lambda_t) = schedule_point(&self.alphas_cumprod, timestep);

        // Convert the epsilon prediction to an x0 prediction.
        let pred_original = ((sample - (model_output * sigma_t)?)? / alpha_t)?;

        let Some(&prev_timestep) = self.timesteps.get(self.step_index + 1) else {
            // Zero-noise boundary: sigma_prev -> 0 collapses the update to x0.
            self.step_index += 1;
            self.previous = None;
            return Ok(pred_original);
        };

        let (alpha_prev, sigma_prev, lambda_prev) =
            schedule_point(&self.alphas_cumprod, prev_timestep);
        let h = lambda_prev - lambda_t;

        // Second-order correction once a previous x0 estimate exists.
        let data_estimate = match &self.previous {
            Some(previous) => {
                let r = previous.h / h;
                let c0 = 1.0 + 1.0 / (2.0 * r);
                let c1 = 1.0 / (2.0 * r);
                ((&pred_original * c0)? - (&previous.pred_original * c1)?)?
            }
            None => pred_original.clone(),
        };

        // x_prev = (sigma_prev / sigma_t) * x - alpha_prev * (e^{-h} - 1) * D
        let sample_term = (sample * (sigma_prev / sigma_t))?;
        let data_term = (data_estimate * (alpha_prev * ((-h).exp() - 1.0)))?;
        let prev_sample = (sample_term - data_term)?;

        self.previous = Some(PreviousStep { pred_original, h });
        self.step_index += 1;
        Ok(prev_sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn run_steps(steps: usize) -> Tensor {
        let mut scheduler = DpmSolverMultistepScheduler::new(steps).unwrap();
        let device = Device::Cpu;
        let mut sample = Tensor::ones((1, 4, 2, 2), DType::F32, &device).unwrap();
        let eps = Tensor::zeros((1, 4, 2, 2), DType::F32, &device).unwrap();
        let timesteps = scheduler.timesteps().to_vec();
        for &t in &timesteps {
            sample = scheduler.step(&eps, t, &sample).unwrap();
        }
        sample
    }

    #[test]
    fn lambda_increases_as_noise_decreases() {
        let alphas = alphas_cumprod(TRAIN_TIMESTEPS, BETA_START, BETA_END);
        let (_, _, lambda_late) = schedule_point(&alphas, 999);
        let (_, _, lambda_early) = schedule_point(&alphas, 0);
        assert!(lambda_early > lambda_late);
    }

    #[test]
    fn full_loop_stays_finite() {
        // With eps = 0 every x0 estimate is x / alpha_t; the multistep
        // updates must not blow up across the whole schedule.
        let out = run_steps(5);
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        for v in values {
            assert!(v.is_finite());
        }
    }

    #[test]
    fn second_order_kicks_in_after_first_step() {
        let mut scheduler = DpmSolverMultistepScheduler::new(4).unwrap();
        assert!(scheduler.previous.is_none());
        let device = Device::Cpu;
        let sample = Tensor::ones((1, 4, 2, 2), DType::F32, &device).unwrap();
        let eps = Tensor::zeros((1, 4, 2, 2), DType::F32, &device).unwrap();
        let t0 = scheduler.timesteps()[0];
        let _ = scheduler.step(&eps, t0, &sample).unwrap();
        assert!(scheduler.previous.is_some());
    }

    #[test]
    fn single_step_returns_x0() {
        // One inference step means the only step hits the zero-noise boundary.
        let mut scheduler = DpmSolverMultistepScheduler::new(1).unwrap();
        let device = Device::Cpu;
        let sample = Tensor::ones((1, 4, 2, 2), DType::F32, &device).unwrap();
        let eps = Tensor::zeros((1, 4, 2, 2), DType::F32, &device).unwrap();
        let out = scheduler.step(&eps, 0, &sample).unwrap();
        let expected = 1.0 / scheduler.alphas_cumprod[0].sqrt();
        let value = out.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((value as f64 - expected).abs() < 1e-4);
    }
}
