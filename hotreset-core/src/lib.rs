//! HotReset Core Library
//!
//! Fault-tolerant hot-reset engine for NPU nodes: classifies device faults,
//! recovers whole interconnect rings without evicting the workload and keeps
//! the cluster ledger consistent with the outcome.

pub mod bookkeeping;
pub mod device;
pub mod executor;
pub mod fault_cache;
pub mod ledger;
pub mod manager;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod ring;

// Re-export common types
pub use bookkeeping::{PodInfo, RecoverStatus, TaskBookkeeping, TaskDeviceInfo};
pub use device::{DeviceError, DeviceInterface, DeviceType, HardwareFamily, NpuDevice};
pub use ledger::{ClusterClient, LedgerError, NodeResetInfo, ResetDevice, TaskResetInfo, WriteMode};
pub use manager::DeviceManager;
pub use orchestrator::{HotResetConfig, HotResetError, HotResetManager};
pub use policy::{FaultCodeTable, FaultType, PolicyLevel};
pub use ring::{RingTopology, WorkMode};
