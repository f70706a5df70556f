//! Busy set, consecutive-failure counters and the node reset record

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use super::{ClusterClient, LedgerError, NodeResetInfo, ResetDevice, WriteMode};
use crate::device::NpuDevice;
use crate::metrics::MetricsRegistry;

/// Tracks devices that fail automatic recovery
///
/// Counters are keyed by physical id, the busy set by logic id. Each map has
/// its own lock; when more than one is held they are taken in field order.
pub struct ResetRecorder {
    client: Arc<dyn ClusterClient>,
    max_reset_times: u32,
    metrics: MetricsRegistry,
    init: OnceCell<()>,
    busy: Mutex<HashSet<i32>>,
    counters: Mutex<HashMap<i32, u32>>,
    node: Mutex<NodeResetInfo>,
}

impl ResetRecorder {
    pub fn new(client: Arc<dyn ClusterClient>, max_reset_times: u32, metrics: MetricsRegistry) -> Self {
        Self {
            client,
            max_reset_times,
            metrics,
            init: OnceCell::new(),
            busy: Mutex::new(HashSet::new()),
            counters: Mutex::new(HashMap::new()),
            node: Mutex::new(NodeResetInfo::default()),
        }
    }

    /// Load the stored node record; succeeds at most once per process
    pub async fn init(&self) -> Result<(), LedgerError> {
        self.init
            .get_or_try_init(|| async {
                let mut stored = self.client.get_node_reset_info().await?;
                stored.dedup();

                let mut counters = self.counters.lock().await;
                for dev in &stored.third_party_reset_devs {
                    counters.entry(dev.phy_id).or_insert(1);
                }
                drop(counters);

                info!(
                    third_party = stored.third_party_reset_devs.len(),
                    manual = stored.manual_reset_devs.len(),
                    "Loaded node reset record"
                );
                *self.node.lock().await = stored;
                Ok::<(), LedgerError>(())
            })
            .await?;
        Ok(())
    }

    pub fn max_reset_times(&self) -> u32 {
        self.max_reset_times
    }

    /// Per-scan housekeeping over a device snapshot
    ///
    /// Healthy devices leave both lists and their counters reset. Third-party
    /// entries whose counter exceeds the ceiling move to the manual list.
    /// Devices mid-recovery are left alone.
    pub async fn refresh(&self, devices: &[NpuDevice]) -> Result<(), LedgerError> {
        let busy = self.busy.lock().await.clone();
        let mut counters = self.counters.lock().await;
        let mut node = self.node.lock().await;
        let before = node.clone();

        for dev in devices.iter().filter(|d| !busy.contains(&d.logic_id)) {
            if dev.is_healthy() {
                counters.remove(&dev.phy_id);
                node.third_party_reset_devs.retain(|d| d.phy_id != dev.phy_id);
                node.manual_reset_devs.retain(|d| d.phy_id != dev.phy_id);
            }
        }

        let ceiling = self.max_reset_times;
        let (exhausted, retained): (Vec<ResetDevice>, Vec<ResetDevice>) = node
            .third_party_reset_devs
            .drain(..)
            .partition(|d| counters.get(&d.phy_id).copied().unwrap_or(0) > ceiling);
        node.third_party_reset_devs = retained;
        for dev in &exhausted {
            warn!(phy_id = dev.phy_id, ceiling, "Automatic recovery exhausted, manual intervention required");
        }
        node.merge(
            &NodeResetInfo {
                third_party_reset_devs: Vec::new(),
                manual_reset_devs: exhausted,
            },
            WriteMode::Append,
        );

        if *node != before {
            self.write(&node, WriteMode::Overwrite).await?;
        }
        Ok(())
    }

    /// Count one more failed recovery of `devices`
    pub async fn record_reset_failure(&self, devices: &[NpuDevice]) -> Result<(), LedgerError> {
        let mut counters = self.counters.lock().await;
        let mut node = self.node.lock().await;
        let manual = node.manual_phy_ids();

        let incoming = NodeResetInfo {
            third_party_reset_devs: devices
                .iter()
                .filter(|d| !manual.contains(&d.phy_id))
                .map(ResetDevice::from)
                .collect(),
            manual_reset_devs: Vec::new(),
        };
        for dev in &incoming.third_party_reset_devs {
            let count = counters.entry(dev.phy_id).or_insert(0);
            *count += 1;
            warn!(phy_id = dev.phy_id, failures = *count, "Recorded failed recovery");
        }
        if incoming.third_party_reset_devs.is_empty() {
            return Ok(());
        }

        node.merge(&incoming, WriteMode::Append);
        self.write(&incoming, WriteMode::Append).await
    }

    /// Put `devices` on the manual-intervention list
    pub async fn record_manual(&self, devices: &[NpuDevice]) -> Result<(), LedgerError> {
        let mut node = self.node.lock().await;
        let incoming = NodeResetInfo {
            third_party_reset_devs: Vec::new(),
            manual_reset_devs: devices.iter().map(ResetDevice::from).collect(),
        };

        let phy_ids: HashSet<i32> = devices.iter().map(|d| d.phy_id).collect();
        let was_third_party = node
            .third_party_reset_devs
            .iter()
            .any(|d| phy_ids.contains(&d.phy_id));
        node.third_party_reset_devs.retain(|d| !phy_ids.contains(&d.phy_id));
        node.merge(&incoming, WriteMode::Append);

        if was_third_party {
            self.write(&node, WriteMode::Overwrite).await
        } else {
            self.write(&incoming, WriteMode::Append).await
        }
    }

    /// Forget failures of devices that recovered
    pub async fn clear_failures(&self, devices: &[NpuDevice]) -> Result<(), LedgerError> {
        let mut counters = self.counters.lock().await;
        let mut node = self.node.lock().await;
        let before = node.third_party_reset_devs.len();

        for dev in devices {
            counters.remove(&dev.phy_id);
            node.third_party_reset_devs.retain(|d| d.phy_id != dev.phy_id);
        }

        if node.third_party_reset_devs.len() != before {
            self.write(&node, WriteMode::Overwrite).await?;
        }
        Ok(())
    }

    pub async fn manual_phy_ids(&self) -> HashSet<i32> {
        self.node.lock().await.manual_phy_ids()
    }

    pub async fn failure_count(&self, phy_id: i32) -> u32 {
        self.counters.lock().await.get(&phy_id).copied().unwrap_or(0)
    }

    pub async fn node_info(&self) -> NodeResetInfo {
        self.node.lock().await.clone()
    }

    pub async fn mark_busy(&self, logic_ids: &[i32]) {
        self.busy.lock().await.extend(logic_ids.iter().copied());
    }

    pub async fn clear_busy(&self, logic_ids: &[i32]) {
        let mut busy = self.busy.lock().await;
        for id in logic_ids {
            busy.remove(id);
        }
    }

    async fn write(&self, info: &NodeResetInfo, mode: WriteMode) -> Result<(), LedgerError> {
        self.client
            .write_node_reset_info(info, mode)
            .await
            .map_err(|e| {
                self.metrics.inc_ledger_write_failure("node");
                warn!(error = %e, "Failed to write node reset record");
                e
            })
    }
}
