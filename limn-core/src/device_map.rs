use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use tracing::warn;

use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            warn!("no GPU available, running on CPU; build with `--features metal` to use the GPU");
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            warn!("no GPU available, running on CPU; build with `--features cuda` to use the GPU");
            Ok(Device::Cpu)
        }
    }
}
