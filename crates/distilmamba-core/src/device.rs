use candle_core::Device;
use tracing::info;
#[cfg(feature = "cuda")]
use tracing::warn;

use crate::error::CoreResult;

/// Selects the compute device for a training run.
///
/// With the `cuda` feature compiled in and `prefer_gpu` set, CUDA device
/// `cuda_device_id` is used when it can be acquired. Everything else,
/// Apple MPS included, runs on the CPU.
pub fn select_device(prefer_gpu: bool, #[allow(unused_variables)] cuda_device_id: usize) -> CoreResult<Device> {
    #[cfg(feature = "cuda")]
    if prefer_gpu {
        match Device::new_cuda(cuda_device_id) {
            Ok(dev) => {
                info!(cuda_device_id, "Using CUDA device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "CUDA unavailable, falling back to CPU");
            }
        }
    }

    #[cfg(not(feature = "cuda"))]
    if prefer_gpu {
        tracing::debug!("GPU requested but this binary was built without the `cuda` feature");
    }

    info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Returns a human-readable description of a device.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}
