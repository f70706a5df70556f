//! Configuration module for the hot-reset agent
//!
//! Handles loading and validating configuration from YAML files and environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use hotreset_core::policy::parse_fault_code;
use hotreset_core::{DeviceType, FaultCodeTable, FaultType, HotResetConfig, WorkMode};
use hotreset_k8s::MirrorConfig;

/// Recovery engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotResetSection {
    #[serde(default)]
    pub work_mode: WorkMode,

    /// Board id, decides the HCCS layout in inference mode
    #[serde(default)]
    pub board_id: u32,

    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_restart_request_wait")]
    pub restart_request_wait: Duration,

    #[serde(with = "humantime_serde", default = "default_restart_grace")]
    pub restart_grace: Duration,

    #[serde(with = "humantime_serde", default = "default_process_wait")]
    pub process_wait: Duration,

    #[serde(default = "default_reset_retry")]
    pub reset_retry: u32,

    #[serde(with = "humantime_serde", default = "default_reset_backoff")]
    pub reset_backoff: Duration,

    #[serde(default = "default_boot_max_polls")]
    pub boot_max_polls: u32,

    #[serde(default = "default_network_max_polls")]
    pub network_max_polls: u32,

    #[serde(with = "humantime_serde", default = "default_warm_up")]
    pub warm_up: Duration,

    #[serde(with = "humantime_serde", default = "default_propagation")]
    pub propagation: Duration,

    /// Failed recoveries tolerated before a device needs manual intervention
    #[serde(default = "default_max_reset_times")]
    pub max_reset_times: u32,
}

impl Default for HotResetSection {
    fn default() -> Self {
        Self {
            work_mode: WorkMode::default(),
            board_id: 0,
            poll_interval: default_poll_interval(),
            restart_request_wait: default_restart_request_wait(),
            restart_grace: default_restart_grace(),
            process_wait: default_process_wait(),
            reset_retry: default_reset_retry(),
            reset_backoff: default_reset_backoff(),
            boot_max_polls: default_boot_max_polls(),
            network_max_polls: default_network_max_polls(),
            warm_up: default_warm_up(),
            propagation: default_propagation(),
            max_reset_times: default_max_reset_times(),
        }
    }
}

/// Local mirror of task records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_mirror_root")]
    pub root: PathBuf,
}

impl Default for MirrorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            root: default_mirror_root(),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port to expose metrics on
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device implementation to use
    #[serde(default)]
    pub device_type: DeviceType,

    /// Node name (from K8s downward API)
    #[serde(default)]
    pub node_name: Option<String>,

    /// Interval between device scans
    #[serde(with = "humantime_serde", default = "default_scan_interval")]
    pub scan_interval: Duration,

    #[serde(default)]
    pub hot_reset: HotResetSection,

    /// Fault type name to hex error codes, extending the built-in table
    #[serde(default)]
    pub fault_codes: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub mirror: MirrorSection,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Dry run mode - log resets but don't execute them
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            node_name: None,
            scan_interval: default_scan_interval(),
            hot_reset: HotResetSection::default(),
            fault_codes: BTreeMap::new(),
            mirror: MirrorSection::default(),
            metrics: MetricsConfig::default(),
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let hr = &self.hot_reset;
        if self.scan_interval.is_zero() {
            anyhow::bail!("scan_interval must be > 0");
        }
        if hr.poll_interval.is_zero() {
            anyhow::bail!("hot_reset.poll_interval must be > 0");
        }
        if hr.reset_retry == 0 {
            anyhow::bail!("hot_reset.reset_retry must be > 0");
        }
        if hr.boot_max_polls == 0 || hr.network_max_polls == 0 {
            anyhow::bail!("hot_reset boot and network poll counts must be > 0");
        }
        if hr.max_reset_times == 0 {
            anyhow::bail!("hot_reset.max_reset_times must be > 0");
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        self.fault_code_table()?;
        Ok(())
    }

    /// Override node_name from environment if not set
    pub fn with_node_name_from_env(mut self) -> Self {
        if self.node_name.is_none() {
            self.node_name = std::env::var("NODE_NAME").ok();
        }
        self
    }

    pub fn hot_reset_config(&self) -> HotResetConfig {
        let hr = &self.hot_reset;
        HotResetConfig {
            work_mode: hr.work_mode,
            board_id: hr.board_id,
            poll_interval: hr.poll_interval,
            restart_request_wait: hr.restart_request_wait,
            restart_grace: hr.restart_grace,
            process_wait: hr.process_wait,
            reset_retry: hr.reset_retry,
            reset_backoff: hr.reset_backoff,
            boot_max_polls: hr.boot_max_polls,
            network_max_polls: hr.network_max_polls,
            warm_up: hr.warm_up,
            propagation: hr.propagation,
            max_reset_times: hr.max_reset_times,
        }
    }

    /// Built-in table with the configured codes layered on top
    pub fn fault_code_table(&self) -> Result<FaultCodeTable> {
        let mut table = FaultCodeTable::default();
        for (name, codes) in &self.fault_codes {
            let fault: FaultType = name
                .parse()
                .with_context(|| format!("Invalid fault_codes entry: {}", name))?;
            let codes = codes
                .iter()
                .map(|c| parse_fault_code(c))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Invalid code under fault_codes.{}", name))?;
            table.insert_all(fault, codes);
        }
        Ok(table)
    }

    pub fn mirror_config(&self) -> MirrorConfig {
        MirrorConfig {
            root: self.mirror.root.clone(),
            ..MirrorConfig::default()
        }
    }
}

// Default value functions
fn default_scan_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_restart_request_wait() -> Duration {
    Duration::from_secs(60)
}

fn default_restart_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_process_wait() -> Duration {
    Duration::from_secs(150)
}

fn default_reset_retry() -> u32 {
    3
}

fn default_reset_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_boot_max_polls() -> u32 {
    120
}

fn default_network_max_polls() -> u32 {
    60
}

fn default_warm_up() -> Duration {
    Duration::from_secs(20)
}

fn default_propagation() -> Duration {
    Duration::from_secs(3)
}

fn default_max_reset_times() -> u32 {
    3
}

fn default_mirror_root() -> PathBuf {
    PathBuf::from("/user/restore/reset")
}

fn default_metrics_port() -> u16 {
    9105
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_true() -> bool {
    true
}
