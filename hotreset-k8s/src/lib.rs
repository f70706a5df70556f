//! HotReset Kubernetes Integration
//!
//! Cluster ledger over ConfigMaps and node annotations, plus the event mirror
//! that copies task records to the local filesystem.

pub mod client;
pub mod ledger;
pub mod mirror;

pub use client::K8sClient;
pub use ledger::KubeLedger;
pub use mirror::{EventMirror, MirrorConfig};
