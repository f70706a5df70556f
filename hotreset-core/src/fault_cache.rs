//! Global Fault Cache
//!
//! Per-device record of current error codes and derived policy. Rebuilt
//! wholesale from every device snapshot.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{Health, NpuDevice};
use crate::policy::{FaultCodeTable, PolicyLevel};

/// Fault record of one device slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceFaultInfo {
    pub logic_id: i32,
    #[serde(rename = "ErrorCode")]
    pub error_codes: Vec<u64>,
    pub policy: PolicyLevel,
    pub health: Health,
}

impl DeviceFaultInfo {
    /// A record with no faults
    pub fn empty(logic_id: i32) -> Self {
        Self {
            logic_id,
            error_codes: Vec::new(),
            policy: PolicyLevel::Empty,
            health: Health::Healthy,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Refusing to refresh fault cache from an empty device list")]
    EmptySnapshot,

    #[error("No fault record for logic id {0}")]
    NotFound(i32),
}

/// Fault cache keyed by logic id
#[derive(Debug, Default)]
pub struct FaultCache {
    devices: HashMap<i32, DeviceFaultInfo>,
}

impl FaultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the cache from a device snapshot
    ///
    /// Devices in `isolated` are forced to `Isolate`. Slots seen before but
    /// missing from the snapshot are kept as empty records.
    pub fn refresh(
        &mut self,
        devices: &[NpuDevice],
        isolated: &HashSet<i32>,
        table: &FaultCodeTable,
    ) -> Result<(), CacheError> {
        if devices.is_empty() {
            return Err(CacheError::EmptySnapshot);
        }

        let mut rebuilt: HashMap<i32, DeviceFaultInfo> = self
            .devices
            .keys()
            .map(|id| (*id, DeviceFaultInfo::empty(*id)))
            .collect();

        for device in devices {
            let policy = if isolated.contains(&device.logic_id) {
                PolicyLevel::Isolate
            } else {
                table.policy_for_codes(&device.error_codes)
            };
            rebuilt.insert(
                device.logic_id,
                DeviceFaultInfo {
                    logic_id: device.logic_id,
                    error_codes: device.error_codes.clone(),
                    policy,
                    health: device.health,
                },
            );
        }

        self.devices = rebuilt;
        Ok(())
    }

    pub fn get(&self, logic_id: i32) -> Result<DeviceFaultInfo, CacheError> {
        self.devices
            .get(&logic_id)
            .cloned()
            .ok_or(CacheError::NotFound(logic_id))
    }

    /// Clear a device's record after confirmed recovery
    pub fn reset(&mut self, logic_id: i32) {
        self.devices
            .insert(logic_id, DeviceFaultInfo::empty(logic_id));
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HardwareFamily;

    fn devices(n: i32) -> Vec<NpuDevice> {
        (0..n)
            .map(|i| NpuDevice::new(HardwareFamily::Ascend910B, i, i, i, 0))
            .collect()
    }

    #[test]
    fn test_refresh_rejects_empty_snapshot() {
        let mut cache = FaultCache::new();
        let err = cache
            .refresh(&[], &HashSet::new(), &FaultCodeTable::default())
            .unwrap_err();
        assert!(matches!(err, CacheError::EmptySnapshot));
    }

    #[test]
    fn test_refresh_derives_policy_and_isolation() {
        let mut devs = devices(4);
        devs[1].error_codes = vec![0x8C084E00];
        let isolated: HashSet<i32> = [3].into_iter().collect();

        let mut cache = FaultCache::new();
        cache
            .refresh(&devs, &isolated, &FaultCodeTable::default())
            .unwrap();

        assert_eq!(cache.get(0).unwrap().policy, PolicyLevel::Empty);
        assert_eq!(cache.get(1).unwrap().policy, PolicyLevel::Reset);
        assert_eq!(cache.get(3).unwrap().policy, PolicyLevel::Isolate);
        assert!(matches!(cache.get(9), Err(CacheError::NotFound(9))));
    }

    #[test]
    fn test_refresh_is_wholesale() {
        let table = FaultCodeTable::default();
        let mut devs = devices(2);
        devs[1].error_codes = vec![0x8C084E00];

        let mut cache = FaultCache::new();
        cache.refresh(&devs, &HashSet::new(), &table).unwrap();
        assert_eq!(cache.get(1).unwrap().policy, PolicyLevel::Reset);

        // Device 1 disappears from the snapshot: its stale fault must not survive
        cache.refresh(&devs[..1], &HashSet::new(), &table).unwrap();
        assert_eq!(cache.get(1).unwrap(), DeviceFaultInfo::empty(1));
        assert_eq!(cache.len(), 2);
    }
}
