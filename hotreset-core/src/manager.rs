//! Device manager variants
//!
//! One variant per hardware family group, selected once at startup. Only
//! families that support hot reset carry the recovery engine.

use std::sync::Arc;

use tracing::{debug, info};

use crate::device::{DeviceError, DeviceInterface, HardwareFamily, NpuDevice};
use crate::ledger::ClusterClient;
use crate::metrics::MetricsRegistry;
use crate::orchestrator::{HotResetConfig, HotResetManager};
use crate::policy::FaultCodeTable;

pub enum DeviceManager {
    /// Inference cards without hot reset
    Ascend310 {
        device: Arc<dyn DeviceInterface>,
        family: HardwareFamily,
    },
    /// Training cards with the hot-reset engine
    Ascend910 {
        device: Arc<dyn DeviceInterface>,
        hot_reset: HotResetManager,
    },
}

impl DeviceManager {
    pub fn new(
        device: Arc<dyn DeviceInterface>,
        client: Arc<dyn ClusterClient>,
        config: HotResetConfig,
        table: FaultCodeTable,
        metrics: MetricsRegistry,
    ) -> Self {
        let family = device.hardware_family();
        info!(family = %family, hot_reset = family.supports_hot_reset(), "Selected device manager");

        if family.supports_hot_reset() {
            let hot_reset = HotResetManager::new(device.clone(), client, config, table, metrics);
            DeviceManager::Ascend910 { device, hot_reset }
        } else {
            DeviceManager::Ascend310 { device, family }
        }
    }

    pub fn family(&self) -> HardwareFamily {
        match self {
            DeviceManager::Ascend310 { family, .. } => *family,
            DeviceManager::Ascend910 { device, .. } => device.hardware_family(),
        }
    }

    pub async fn get_npus(&self) -> Result<Vec<NpuDevice>, DeviceError> {
        match self {
            DeviceManager::Ascend310 { device, .. } | DeviceManager::Ascend910 { device, .. } => {
                device.list_devices().await
            }
        }
    }

    pub async fn grace_tolerance(&self, devices: &mut [NpuDevice]) {
        match self {
            DeviceManager::Ascend310 { family, .. } => {
                debug!(family = %family, devices = devices.len(), "Hot reset not supported, skipping");
            }
            DeviceManager::Ascend910 { hot_reset, .. } => hot_reset.grace_tolerance(devices).await,
        }
    }

    /// One scan cycle, returning the snapshot with health updated
    pub async fn scan(&self) -> Result<Vec<NpuDevice>, DeviceError> {
        let mut devices = self.get_npus().await?;
        self.grace_tolerance(&mut devices).await;
        Ok(devices)
    }

    pub fn hot_reset(&self) -> Option<&HotResetManager> {
        match self {
            DeviceManager::Ascend310 { .. } => None,
            DeviceManager::Ascend910 { hot_reset, .. } => Some(hot_reset),
        }
    }

    /// Let in-flight recovery workers finish
    pub async fn shutdown(&self) {
        if let Some(hot_reset) = self.hot_reset() {
            hot_reset.drain_workers().await;
        }
    }
}
