//! Compute device selection.

use anyhow::Result;
use candle_core::Device;
use log::info;

/// Pick the best available device: CUDA, then Metal, then CPU.
/// `force_cpu` skips the GPU probes entirely.
pub fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        info!("Running on CPU (forced)");
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        info!("Running on CUDA device 0");
        return Ok(Device::new_cuda(0)?);
    }
    if candle_core::utils::metal_is_available() {
        info!("Running on Metal device 0");
        return Ok(Device::new_metal(0)?);
    }
    info!("No GPU available, running on CPU");
    Ok(Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_cpu_is_cpu() {
        let device = select_device(true).unwrap();
        assert!(matches!(device, Device::Cpu));
    }
}
