//! Ring Topology
//!
//! Devices sharing a reset-sensitive interconnect form a ring. Rings are
//! contiguous, fixed-size partitions of logic ids and are recovered as a unit.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::device::HardwareFamily;
use crate::policy::FaultType;

/// Boards without an HCCS interconnect
pub const NO_HCCS_BOARD_IDS: [u32; 3] = [0x28, 0x29, 0x3d];

/// Workload mode of the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkMode {
    #[default]
    Training,
    Inference,
}

/// Whether the board links its devices through HCCS
pub fn has_hccs(board_id: u32) -> bool {
    !NO_HCCS_BOARD_IDS.contains(&board_id)
}

/// Whether a fault anywhere on the node blocks every device
///
/// Only inference servers with an HCCS interconnect couple all devices
/// together; faults that need no handling never block.
pub fn need_block_all_devices(mode: WorkMode, board_id: u32, faults: &[FaultType]) -> bool {
    mode == WorkMode::Inference
        && has_hccs(board_id)
        && faults.iter().any(|f| *f != FaultType::NotHandleFault)
}

/// Static partition of logic ids into rings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingTopology {
    ring_size: i32,
}

impl RingTopology {
    pub fn new(ring_size: i32) -> Self {
        Self {
            ring_size: ring_size.max(1),
        }
    }

    /// Ring size for a hardware SKU and workload mode
    pub fn for_hardware(family: HardwareFamily, mode: WorkMode, board_id: u32) -> Self {
        let size = match (family, mode) {
            (HardwareFamily::Ascend910, _) => 4,
            (HardwareFamily::Ascend910B, WorkMode::Training) => 8,
            (HardwareFamily::Ascend910B, WorkMode::Inference) if has_hccs(board_id) => 8,
            (HardwareFamily::Ascend910B, WorkMode::Inference) => 1,
            (HardwareFamily::Ascend310 | HardwareFamily::Ascend310P, _) => 1,
        };
        Self::new(size)
    }

    pub fn ring_size(&self) -> i32 {
        self.ring_size
    }

    /// First logic id of the ring containing `logic_id`
    pub fn ring_start(&self, logic_id: i32) -> i32 {
        logic_id.div_euclid(self.ring_size) * self.ring_size
    }

    /// Every logic id of the ring containing `logic_id`
    pub fn ring_of(&self, logic_id: i32) -> Vec<i32> {
        let start = self.ring_start(logic_id);
        (start..start + self.ring_size).collect()
    }

    /// Distinct ring starts touched by `ids`, ascending
    pub fn ring_starts(&self, ids: &[i32]) -> BTreeSet<i32> {
        ids.iter().map(|id| self.ring_start(*id)).collect()
    }

    /// Every logic id of every ring touched by `ids`, ascending
    pub fn expand(&self, ids: &[i32]) -> Vec<i32> {
        self.ring_starts(ids)
            .into_iter()
            .flat_map(|start| start..start + self.ring_size)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_sizes() {
        let t = RingTopology::for_hardware(HardwareFamily::Ascend910, WorkMode::Training, 0);
        assert_eq!(t.ring_size(), 4);
        let t = RingTopology::for_hardware(HardwareFamily::Ascend910B, WorkMode::Training, 0);
        assert_eq!(t.ring_size(), 8);
        let t = RingTopology::for_hardware(HardwareFamily::Ascend910B, WorkMode::Inference, 0x30);
        assert_eq!(t.ring_size(), 8);
        let t = RingTopology::for_hardware(HardwareFamily::Ascend910B, WorkMode::Inference, 0x28);
        assert_eq!(t.ring_size(), 1);
    }

    #[test]
    fn test_ring_start_and_members() {
        let t = RingTopology::new(4);
        assert_eq!(t.ring_start(0), 0);
        assert_eq!(t.ring_start(3), 0);
        assert_eq!(t.ring_start(5), 4);
        assert_eq!(t.ring_of(6), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_expand_covers_whole_rings() {
        let t = RingTopology::new(4);
        assert_eq!(t.expand(&[1]), vec![0, 1, 2, 3]);
        assert_eq!(t.expand(&[1, 2, 6]), vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert!(t.expand(&[]).is_empty());
    }

    #[test]
    fn test_need_block_all_devices() {
        let faults = [FaultType::NotHandleFault, FaultType::RestartNpu];
        assert!(need_block_all_devices(WorkMode::Inference, 0x30, &faults));
        assert!(!need_block_all_devices(
            WorkMode::Inference,
            0x30,
            &[FaultType::NotHandleFault]
        ));
        assert!(!need_block_all_devices(WorkMode::Training, 0x30, &faults));
        for board in NO_HCCS_BOARD_IDS {
            assert!(!need_block_all_devices(
                WorkMode::Inference,
                board,
                &[FaultType::SeparateNpu]
            ));
        }
    }
}
