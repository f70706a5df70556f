//! Dry-run wrapper: every query is forwarded, reset commands are only logged

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{BootStatus, DeviceError, DeviceInterface, HardwareFamily, NetworkHealth, NpuDevice};

pub struct DryRunDevice {
    inner: Arc<dyn DeviceInterface>,
}

impl DryRunDevice {
    pub fn new(inner: Arc<dyn DeviceInterface>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl DeviceInterface for DryRunDevice {
    async fn list_devices(&self) -> Result<Vec<NpuDevice>, DeviceError> {
        self.inner.list_devices().await
    }

    async fn error_codes(&self, logic_id: i32) -> Result<Vec<u64>, DeviceError> {
        self.inner.error_codes(logic_id).await
    }

    async fn process_count(&self, logic_id: i32) -> Result<u32, DeviceError> {
        self.inner.process_count(logic_id).await
    }

    async fn boot_status(&self, logic_id: i32) -> Result<BootStatus, DeviceError> {
        self.inner.boot_status(logic_id).await
    }

    async fn network_health(&self, logic_id: i32) -> Result<NetworkHealth, DeviceError> {
        self.inner.network_health(logic_id).await
    }

    async fn reset_device(&self, card_id: i32, device_id: i32) -> Result<(), DeviceError> {
        info!(
            card_id = card_id,
            device_id = device_id,
            "[DRY-RUN] Would reset device"
        );
        Ok(())
    }

    fn hardware_family(&self) -> HardwareFamily {
        self.inner.hardware_family()
    }
}
