//! Mock device implementation for testing

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BootStatus, DeviceError, DeviceInterface, HardwareFamily, NetworkHealth, NpuDevice};

#[derive(Debug, Clone)]
struct MockSlot {
    device: NpuDevice,
    process_count: u32,
    boot_status: BootStatus,
}

/// Mock NPU server with scriptable fault, process and boot state
pub struct MockDevice {
    family: HardwareFamily,
    slots: RwLock<BTreeMap<i32, MockSlot>>,
    /// Number of upcoming reset commands that fail
    pending_reset_failures: AtomicU32,
    /// Whether a successful reset clears every error code on the server
    clear_on_reset: AtomicBool,
    reset_calls: RwLock<Vec<(i32, i32)>>,
}

impl MockDevice {
    /// Create a new mock server with 8 Ascend 910B devices
    pub fn new() -> Self {
        Self::with_device_count(8, HardwareFamily::Ascend910B)
    }

    /// Create a mock server with the given device count and family
    pub fn with_device_count(count: i32, family: HardwareFamily) -> Self {
        let slots = (0..count)
            .map(|i| {
                (
                    i,
                    MockSlot {
                        device: NpuDevice::new(family, i, i, i, 0),
                        process_count: 0,
                        boot_status: BootStatus::BootFinished,
                    },
                )
            })
            .collect();

        Self {
            family,
            slots: RwLock::new(slots),
            pending_reset_failures: AtomicU32::new(0),
            clear_on_reset: AtomicBool::new(true),
            reset_calls: RwLock::new(Vec::new()),
        }
    }

    /// Raise error codes on a device
    pub async fn set_error_codes(&self, logic_id: i32, codes: Vec<u64>) {
        if let Some(slot) = self.slots.write().await.get_mut(&logic_id) {
            slot.device.error_codes = codes;
        }
    }

    /// Set the number of processes running on a device
    pub async fn set_process_count(&self, logic_id: i32, count: u32) {
        if let Some(slot) = self.slots.write().await.get_mut(&logic_id) {
            slot.process_count = count;
        }
    }

    /// Set the boot status of a device
    pub async fn set_boot_status(&self, logic_id: i32, status: BootStatus) {
        if let Some(slot) = self.slots.write().await.get_mut(&logic_id) {
            slot.boot_status = status;
        }
    }

    /// Set the link health of a device
    pub async fn set_network_health(&self, logic_id: i32, health: NetworkHealth) {
        if let Some(slot) = self.slots.write().await.get_mut(&logic_id) {
            slot.device.network_health = health;
        }
    }

    /// Make the next `count` reset commands fail
    pub fn fail_next_resets(&self, count: u32) {
        self.pending_reset_failures.store(count, Ordering::SeqCst);
    }

    /// Choose whether a successful reset clears error codes
    pub fn set_clear_on_reset(&self, clear: bool) {
        self.clear_on_reset.store(clear, Ordering::SeqCst);
    }

    /// Reset commands received so far as (card id, device id)
    pub async fn reset_calls(&self) -> Vec<(i32, i32)> {
        self.reset_calls.read().await.clone()
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceInterface for MockDevice {
    async fn list_devices(&self) -> Result<Vec<NpuDevice>, DeviceError> {
        Ok(self
            .slots
            .read()
            .await
            .values()
            .map(|s| s.device.clone())
            .collect())
    }

    async fn error_codes(&self, logic_id: i32) -> Result<Vec<u64>, DeviceError> {
        self.slots
            .read()
            .await
            .get(&logic_id)
            .map(|s| s.device.error_codes.clone())
            .ok_or(DeviceError::DeviceNotFound(logic_id))
    }

    async fn process_count(&self, logic_id: i32) -> Result<u32, DeviceError> {
        self.slots
            .read()
            .await
            .get(&logic_id)
            .map(|s| s.process_count)
            .ok_or(DeviceError::DeviceNotFound(logic_id))
    }

    async fn boot_status(&self, logic_id: i32) -> Result<BootStatus, DeviceError> {
        self.slots
            .read()
            .await
            .get(&logic_id)
            .map(|s| s.boot_status)
            .ok_or(DeviceError::DeviceNotFound(logic_id))
    }

    async fn network_health(&self, logic_id: i32) -> Result<NetworkHealth, DeviceError> {
        self.slots
            .read()
            .await
            .get(&logic_id)
            .map(|s| s.device.network_health)
            .ok_or(DeviceError::DeviceNotFound(logic_id))
    }

    async fn reset_device(&self, card_id: i32, device_id: i32) -> Result<(), DeviceError> {
        self.reset_calls.write().await.push((card_id, device_id));

        let failed = self
            .pending_reset_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DeviceError::ResetFailed {
                card_id,
                device_id,
                message: "Mock reset failure".to_string(),
            });
        }

        if self.clear_on_reset.load(Ordering::SeqCst) {
            for slot in self.slots.write().await.values_mut() {
                slot.device.error_codes.clear();
            }
        }
        Ok(())
    }

    fn hardware_family(&self) -> HardwareFamily {
        self.family
    }
}
