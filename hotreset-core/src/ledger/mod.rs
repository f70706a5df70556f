//! Cluster Ledger
//!
//! Durable, cluster-visible recovery records: one reset record per task and a
//! node-scoped list of devices that exhausted automatic recovery. The engine
//! reaches the cluster only through [`ClusterClient`].

mod memory;
mod recorder;
mod task;

pub use memory::MemoryCluster;
pub use recorder::ResetRecorder;
pub use task::{TaskLedger, TaskLedgerConfig};

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bookkeeping::{PodInfo, RecoverStatus, TaskDeviceInfo};
use crate::device::NpuDevice;
use crate::policy::PolicyLevel;

/// Durable recovery record of one task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskResetInfo {
    pub rank_list: Vec<TaskDeviceInfo>,
    /// Unix seconds of the last write, zero while initializing
    pub update_time: i64,
    /// Reset cycles performed within the episode
    pub retry_time: u32,
}

impl TaskResetInfo {
    pub fn is_initializing(&self) -> bool {
        self.update_time == 0
    }

    /// Whether a rank outside `local_ranks` is still being recovered
    pub fn is_resetting_elsewhere(&self, local_ranks: &HashSet<u32>) -> bool {
        !self.is_initializing()
            && self
                .rank_list
                .iter()
                .any(|r| r.status == RecoverStatus::Unrecovered && !local_ranks.contains(&r.rank_id))
    }

    /// Whether every rank in `ranks` is recorded as a failed isolation
    pub fn ranks_isolated(&self, ranks: &[u32]) -> bool {
        ranks.iter().all(|id| {
            self.rank_list.iter().any(|r| {
                r.rank_id == *id && r.fault.policy == PolicyLevel::Isolate && r.status == RecoverStatus::RecoverFailed
            })
        })
    }

    /// Replace ranks with the same id, append the rest
    pub fn upsert_ranks(&mut self, ranks: &[TaskDeviceInfo]) {
        for rank in ranks {
            match self.rank_list.iter_mut().find(|r| r.rank_id == rank.rank_id) {
                Some(existing) => *existing = rank.clone(),
                None => self.rank_list.push(rank.clone()),
            }
        }
    }
}

/// A device that exhausted automatic recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResetDevice {
    pub card_id: i32,
    pub device_id: i32,
    pub associated_card_id: i32,
    pub phy_id: i32,
}

impl From<&NpuDevice> for ResetDevice {
    fn from(device: &NpuDevice) -> Self {
        Self {
            card_id: device.card_id,
            device_id: device.device_id,
            associated_card_id: device.card_id,
            phy_id: device.phy_id,
        }
    }
}

/// How a node record write combines with what is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace wholesale
    Overwrite,
    /// Merge, de-duplicated by physical id, first seen wins
    Append,
}

/// Node-scoped record of devices left for remediation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeResetInfo {
    #[serde(default)]
    pub third_party_reset_devs: Vec<ResetDevice>,
    #[serde(default)]
    pub manual_reset_devs: Vec<ResetDevice>,
}

fn append_unique(list: &mut Vec<ResetDevice>, incoming: &[ResetDevice]) {
    for dev in incoming {
        if !list.iter().any(|d| d.phy_id == dev.phy_id) {
            list.push(dev.clone());
        }
    }
}

impl NodeResetInfo {
    /// Combine `incoming` into `self` according to `mode`
    pub fn merge(&mut self, incoming: &NodeResetInfo, mode: WriteMode) {
        match mode {
            WriteMode::Overwrite => *self = incoming.clone(),
            WriteMode::Append => {
                append_unique(&mut self.third_party_reset_devs, &incoming.third_party_reset_devs);
                append_unique(&mut self.manual_reset_devs, &incoming.manual_reset_devs);
            }
        }
    }

    /// Drop duplicate physical ids, keeping the first of each
    pub fn dedup(&mut self) {
        let mut deduped = NodeResetInfo::default();
        deduped.merge(self, WriteMode::Append);
        *self = deduped;
    }

    pub fn manual_phy_ids(&self) -> HashSet<i32> {
        self.manual_reset_devs.iter().map(|d| d.phy_id).collect()
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Cluster request failed: {0}")]
    Cluster(String),

    #[error("Invalid ledger record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The engine's view of the cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Pods bound to this node
    async fn list_node_pods(&self) -> Result<Vec<PodInfo>, LedgerError>;

    /// Reset record of a task, `None` if it was never written
    async fn get_task_reset_info(&self, namespace: &str, task: &str) -> Result<Option<TaskResetInfo>, LedgerError>;

    /// Create or replace the reset record of a task
    async fn write_task_reset_info(&self, namespace: &str, task: &str, info: &TaskResetInfo) -> Result<(), LedgerError>;

    /// Node record, empty if absent
    async fn get_node_reset_info(&self) -> Result<NodeResetInfo, LedgerError>;

    /// Write the node record, merging per `mode`
    async fn write_node_reset_info(&self, info: &NodeResetInfo, mode: WriteMode) -> Result<(), LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault_cache::DeviceFaultInfo;

    fn dev(card: i32, phy: i32) -> ResetDevice {
        ResetDevice {
            card_id: card,
            device_id: 0,
            associated_card_id: card,
            phy_id: phy,
        }
    }

    fn rank(id: u32, status: RecoverStatus) -> TaskDeviceInfo {
        let mut r = TaskDeviceInfo::new(id, DeviceFaultInfo::empty(id as i32));
        r.status = status;
        r
    }

    #[test]
    fn test_append_dedups_by_phy_id_first_seen() {
        let mut stored = NodeResetInfo {
            third_party_reset_devs: vec![dev(1, 1)],
            manual_reset_devs: vec![],
        };
        let incoming = NodeResetInfo {
            third_party_reset_devs: vec![dev(9, 1), dev(2, 2), dev(3, 2)],
            manual_reset_devs: vec![dev(4, 4)],
        };
        stored.merge(&incoming, WriteMode::Append);

        assert_eq!(stored.third_party_reset_devs, vec![dev(1, 1), dev(2, 2)]);
        assert_eq!(stored.manual_reset_devs, vec![dev(4, 4)]);
    }

    #[test]
    fn test_overwrite_replaces() {
        let mut stored = NodeResetInfo {
            third_party_reset_devs: vec![dev(1, 1)],
            manual_reset_devs: vec![dev(2, 2)],
        };
        stored.merge(&NodeResetInfo::default(), WriteMode::Overwrite);
        assert_eq!(stored, NodeResetInfo::default());
    }

    #[test]
    fn test_node_record_round_trip_has_unique_phy_ids() {
        let mut info = NodeResetInfo {
            third_party_reset_devs: vec![dev(1, 1), dev(5, 1)],
            manual_reset_devs: vec![dev(3, 3), dev(3, 3)],
        };
        info.dedup();

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"ThirdPartyResetDevs\""));
        assert!(json.contains("\"AssociatedCardId\""));

        let mut back: NodeResetInfo = serde_json::from_str(&json).unwrap();
        back.merge(&info, WriteMode::Append);
        assert_eq!(back.third_party_reset_devs, vec![dev(1, 1)]);
        assert_eq!(back.manual_reset_devs, vec![dev(3, 3)]);
    }

    #[test]
    fn test_resetting_elsewhere() {
        let local: HashSet<u32> = [0, 1].into_iter().collect();
        let mut info = TaskResetInfo {
            rank_list: vec![rank(0, RecoverStatus::Unrecovered), rank(8, RecoverStatus::Recovered)],
            update_time: 0,
            retry_time: 0,
        };
        // Zero timestamp means initializing
        info.rank_list.push(rank(9, RecoverStatus::Unrecovered));
        assert!(!info.is_resetting_elsewhere(&local));

        info.update_time = 1_700_000_000;
        assert!(info.is_resetting_elsewhere(&local));

        info.rank_list.pop();
        assert!(!info.is_resetting_elsewhere(&local));
    }

    #[test]
    fn test_ranks_isolated() {
        let mut info = TaskResetInfo {
            rank_list: vec![rank(0, RecoverStatus::Unrecovered), rank(1, RecoverStatus::Unrecovered)],
            update_time: 1_700_000_000,
            retry_time: 0,
        };
        assert!(!info.ranks_isolated(&[1]));

        let isolated = rank(1, RecoverStatus::Unrecovered).with_outcome(PolicyLevel::Isolate, RecoverStatus::RecoverFailed);
        info.upsert_ranks(&[isolated]);
        assert!(info.ranks_isolated(&[1]));
        assert!(!info.ranks_isolated(&[0, 1]));
        assert!(!info.ranks_isolated(&[7]));
    }

    #[test]
    fn test_upsert_ranks() {
        let mut info = TaskResetInfo {
            rank_list: vec![rank(0, RecoverStatus::Unrecovered), rank(8, RecoverStatus::Unrecovered)],
            ..Default::default()
        };
        info.upsert_ranks(&[rank(0, RecoverStatus::RecoverFailed), rank(1, RecoverStatus::RecoverFailed)]);

        let statuses: Vec<(u32, RecoverStatus)> =
            info.rank_list.iter().map(|r| (r.rank_id, r.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (0, RecoverStatus::RecoverFailed),
                (8, RecoverStatus::Unrecovered),
                (1, RecoverStatus::RecoverFailed)
            ]
        );
    }

    #[test]
    fn test_task_record_wire_format() {
        let info = TaskResetInfo {
            rank_list: vec![rank(3, RecoverStatus::Unrecovered)],
            update_time: 42,
            retry_time: 1,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["UpdateTime"], 42);
        assert_eq!(json["RetryTime"], 1);
        assert_eq!(json["RankList"][0]["RankId"], 3);
    }
}
