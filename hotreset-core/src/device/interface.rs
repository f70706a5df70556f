//! Device interface trait and common types
//!
//! Defines the capability surface the hot-reset engine consumes from the
//! device discovery layer: device snapshots, process counts, boot status,
//! link health and the reset command itself.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Device implementation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Auto-detect device implementation
    #[default]
    Auto,
    /// Huawei Ascend NPU via npu-smi
    Ascend,
    /// In-memory mock device
    Mock,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Auto => write!(f, "auto"),
            DeviceType::Ascend => write!(f, "ascend"),
            DeviceType::Mock => write!(f, "mock"),
        }
    }
}

/// Hardware family of the accelerators on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareFamily {
    Ascend310,
    Ascend310P,
    Ascend910,
    Ascend910B,
}

impl HardwareFamily {
    /// Detect the family from a chip name such as "Ascend 910B3" or "310P3"
    pub fn from_chip_name(name: &str) -> Option<Self> {
        let name = name.trim().trim_start_matches("Ascend").trim();
        if name.starts_with("910B") {
            Some(HardwareFamily::Ascend910B)
        } else if name.starts_with("910") {
            Some(HardwareFamily::Ascend910)
        } else if name.starts_with("310P") {
            Some(HardwareFamily::Ascend310P)
        } else if name.starts_with("310") {
            Some(HardwareFamily::Ascend310)
        } else {
            None
        }
    }

    /// Device name prefix used in allocation annotations
    pub fn device_prefix(&self) -> &'static str {
        match self {
            HardwareFamily::Ascend310 => "Ascend310",
            HardwareFamily::Ascend310P => "Ascend310P",
            HardwareFamily::Ascend910 | HardwareFamily::Ascend910B => "Ascend910",
        }
    }

    /// Whether the family supports hot reset without evicting the workload
    pub fn supports_hot_reset(&self) -> bool {
        matches!(self, HardwareFamily::Ascend910 | HardwareFamily::Ascend910B)
    }
}

impl fmt::Display for HardwareFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareFamily::Ascend310 => write!(f, "Ascend310"),
            HardwareFamily::Ascend310P => write!(f, "Ascend310P"),
            HardwareFamily::Ascend910 => write!(f, "Ascend910"),
            HardwareFamily::Ascend910B => write!(f, "Ascend910B"),
        }
    }
}

/// Device health as reported to the allocation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Health {
    #[default]
    Healthy,
    Unhealthy,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => write!(f, "Healthy"),
            Health::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Inter-device link health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NetworkHealth {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// Boot progress of a device after reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootStatus {
    Booting,
    BootFinished,
    Unknown,
}

/// Snapshot of one physical device slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpuDevice {
    /// Process-local stable index
    pub logic_id: i32,
    /// Physical id
    pub phy_id: i32,
    /// Card id used by the reset command
    pub card_id: i32,
    /// Chip id on the card used by the reset command
    pub device_id: i32,
    /// Allocation name, e.g. "Ascend910-0"
    pub name: String,
    /// Health reported to the allocation layer
    pub health: Health,
    /// Link health
    pub network_health: NetworkHealth,
    /// Error codes currently raised
    pub error_codes: Vec<u64>,
}

impl NpuDevice {
    /// Create a healthy device with no error codes
    pub fn new(family: HardwareFamily, logic_id: i32, phy_id: i32, card_id: i32, device_id: i32) -> Self {
        Self {
            logic_id,
            phy_id,
            card_id,
            device_id,
            name: format!("{}-{}", family.device_prefix(), phy_id),
            health: Health::Healthy,
            network_health: NetworkHealth::Healthy,
            error_codes: Vec::new(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy && self.error_codes.is_empty()
    }
}

impl fmt::Display for NpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(logic={})", self.name, self.logic_id)
    }
}

/// Render error codes as a comma separated hex list
pub fn error_code_hex(codes: &[u64]) -> String {
    codes
        .iter()
        .map(|c| format!("0x{:X}", c))
        .collect::<Vec<_>>()
        .join(",")
}

/// Errors that can occur during device operations
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Device not found
    #[error("Device not found: logic id {0}")]
    DeviceNotFound(i32),

    /// Failed to query device
    #[error("Failed to query device: {0}")]
    QueryError(String),

    /// Reset command rejected by the management layer
    #[error("Reset of card {card_id} device {device_id} failed: {message}")]
    ResetFailed {
        card_id: i32,
        device_id: i32,
        message: String,
    },

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Device interface trait
///
/// Implementations must be thread-safe; the hot-reset engine calls them from
/// the scan loop and from concurrent recovery workers.
#[async_trait]
pub trait DeviceInterface: Send + Sync {
    /// List all devices with their current health and error codes
    async fn list_devices(&self) -> Result<Vec<NpuDevice>, DeviceError>;

    /// Current error codes of one device
    async fn error_codes(&self, logic_id: i32) -> Result<Vec<u64>, DeviceError>;

    /// Number of processes currently running on the device
    async fn process_count(&self, logic_id: i32) -> Result<u32, DeviceError>;

    /// Boot status of the device
    async fn boot_status(&self, logic_id: i32) -> Result<BootStatus, DeviceError>;

    /// Link health of the device
    async fn network_health(&self, logic_id: i32) -> Result<NetworkHealth, DeviceError>;

    /// Issue the hot reset command
    async fn reset_device(&self, card_id: i32, device_id: i32) -> Result<(), DeviceError>;

    /// Hardware family of the devices behind this interface
    fn hardware_family(&self) -> HardwareFamily;
}
