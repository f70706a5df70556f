//! Device abstraction layer
//!
//! Provides a unified interface over the NPU management tooling.

mod ascend;
mod dry_run;
mod interface;
mod mock;

pub use ascend::AscendDevice;
pub use dry_run::DryRunDevice;
pub use interface::*;
pub use mock::MockDevice;

use std::sync::Arc;

/// Create a device interface based on the device type
pub async fn create_device_interface(
    device_type: DeviceType,
) -> Result<Arc<dyn DeviceInterface>, DeviceError> {
    match device_type {
        DeviceType::Auto => match AscendDevice::new().await {
            Ok(device) => {
                tracing::info!(family = %device.hardware_family(), "Auto-detected Ascend devices");
                Ok(Arc::new(device))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ascend devices not available, using mock");
                Ok(Arc::new(MockDevice::new()))
            }
        },
        DeviceType::Ascend => {
            let device = AscendDevice::new().await?;
            Ok(Arc::new(device))
        }
        DeviceType::Mock => Ok(Arc::new(MockDevice::new())),
    }
}
