//! Accelerator selection.

use candle_core::Device;
use candle_core::utils::{cuda_is_available, metal_is_available};
use tracing::{info, warn};

use crate::config::{Accelerator, Devices};
use crate::error::{Result, SemsegError};

/// Open the compute device for `accelerator`.
///
/// Training runs on a single device: when several ordinals are requested the
/// first one is used and the rest are reported.
pub fn resolve_device(accelerator: Accelerator, devices: &Devices) -> Result<Device> {
    let ordinals = devices.ordinals();
    let ordinal = ordinals.first().copied().unwrap_or(0);
    if ordinals.len() > 1 {
        warn!(requested = ?ordinals, using = ordinal, "multi-device training is not supported");
    }

    let open_cuda = || Device::new_cuda(ordinal).map_err(|e| SemsegError::Device(e.to_string()));
    let open_metal = || Device::new_metal(ordinal).map_err(|e| SemsegError::Device(e.to_string()));

    let device = match accelerator {
        Accelerator::Cpu => Device::Cpu,
        Accelerator::Cuda => open_cuda()?,
        Accelerator::Metal => open_metal()?,
        Accelerator::Auto if cuda_is_available() => open_cuda()?,
        Accelerator::Auto if metal_is_available() => open_metal()?,
        Accelerator::Auto => Device::Cpu,
    };
    info!(?accelerator, device = ?device, "device selected");
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_always_opens() {
        let device = resolve_device(Accelerator::Cpu, &Devices::Count(1)).unwrap();
        assert!(device.is_cpu());
        let device = resolve_device(Accelerator::Cpu, &Devices::List(vec![0, 1])).unwrap();
        assert!(device.is_cpu());
    }
}
