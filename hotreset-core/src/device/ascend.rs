//! Huawei Ascend NPU device implementation
//!
//! Uses the npu-smi and hccn_tool command line tools for NPU management.

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use super::{BootStatus, DeviceError, DeviceInterface, HardwareFamily, Health, NetworkHealth, NpuDevice};

// "        0      0      0      Ascend 910B3"
static CHIP_MAP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+)\s+(\d+)\s+(\d+)\s+(Ascend\s+\S+)\s*$").expect("valid chip map regex")
});
static HEALTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Health\s+Status\s*:\s*(\w+)").expect("valid health regex"));
static ERROR_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Error\s+Code\s*:\s*(.*)").expect("valid error code regex"));
static PROCESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Process\s+id\s*:\s*\d+").expect("valid process regex"));
static BOOT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Boot\s+Status\s*:\s*(.+)").expect("valid boot regex"));
static NET_HEALTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)net\s+health\s+status\s*:\s*(\w+)").expect("valid net health regex")
});

/// One row of `npu-smi info -m`
#[derive(Debug, Clone, PartialEq)]
struct ChipMapping {
    card_id: i32,
    chip_id: i32,
    logic_id: i32,
    chip_name: String,
}

/// Huawei Ascend NPU device implementation
pub struct AscendDevice {
    npu_smi_path: String,
    hccn_tool_path: String,
    family: HardwareFamily,
    /// logic id -> chip mapping, refreshed on every listing
    chips: RwLock<HashMap<i32, ChipMapping>>,
}

impl AscendDevice {
    /// Create a new Ascend device interface with default tool paths
    pub async fn new() -> Result<Self, DeviceError> {
        Self::with_paths(
            "/usr/local/bin/npu-smi".to_string(),
            "/usr/local/Ascend/driver/tools/hccn_tool".to_string(),
        )
        .await
    }

    /// Create a new Ascend device interface with custom tool paths
    pub async fn with_paths(npu_smi_path: String, hccn_tool_path: String) -> Result<Self, DeviceError> {
        if !std::path::Path::new(&npu_smi_path).exists() {
            return Err(DeviceError::Other(format!(
                "npu-smi not found at {}",
                npu_smi_path
            )));
        }

        let output = run_tool(&npu_smi_path, &["info", "-m"]).await?;
        let chips = parse_chip_map(&output);
        let family = chips
            .iter()
            .find_map(|c| HardwareFamily::from_chip_name(&c.chip_name))
            .ok_or_else(|| DeviceError::QueryError("no Ascend chips reported by npu-smi".to_string()))?;

        Ok(Self {
            npu_smi_path,
            hccn_tool_path,
            family,
            chips: RwLock::new(chips.into_iter().map(|c| (c.logic_id, c)).collect()),
        })
    }

    async fn run_npu_smi(&self, args: &[&str]) -> Result<String, DeviceError> {
        run_tool(&self.npu_smi_path, args).await
    }

    async fn chip(&self, logic_id: i32) -> Result<ChipMapping, DeviceError> {
        self.chips
            .read()
            .await
            .get(&logic_id)
            .cloned()
            .ok_or(DeviceError::DeviceNotFound(logic_id))
    }

    async fn query_chip(&self, logic_id: i32, kind: &str) -> Result<String, DeviceError> {
        let chip = self.chip(logic_id).await?;
        let card = chip.card_id.to_string();
        let chip_id = chip.chip_id.to_string();
        self.run_npu_smi(&["info", "-t", kind, "-i", &card, "-c", &chip_id])
            .await
    }
}

async fn run_tool(path: &str, args: &[&str]) -> Result<String, DeviceError> {
    let output = tokio::process::Command::new(path)
        .args(args)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeviceError::QueryError(format!(
            "{} {} failed: {}",
            path,
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Parse `npu-smi info -m`
///
/// ```text
///     NPU ID    Chip ID    Chip Logic ID    Chip Name
///     0         0          0                Ascend 910B3
///     0         1          -                Mcu
/// ```
fn parse_chip_map(output: &str) -> Vec<ChipMapping> {
    output
        .lines()
        .filter_map(|line| CHIP_MAP_RE.captures(line))
        .filter_map(|cap| {
            Some(ChipMapping {
                card_id: cap[1].parse().ok()?,
                chip_id: cap[2].parse().ok()?,
                logic_id: cap[3].parse().ok()?,
                chip_name: cap[4].to_string(),
            })
        })
        .collect()
}

/// Parse health status and error codes from `npu-smi info -t health`
fn parse_health(output: &str) -> (Health, Vec<u64>) {
    let health = match HEALTH_RE.captures(output) {
        Some(cap) if cap[1].eq_ignore_ascii_case("OK") => Health::Healthy,
        Some(_) => Health::Unhealthy,
        None => Health::Healthy,
    };

    let codes = ERROR_CODE_RE
        .captures(output)
        .map(|cap| {
            cap[1]
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("NA"))
                .filter_map(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                .collect()
        })
        .unwrap_or_default();

    (health, codes)
}

fn parse_process_count(output: &str) -> u32 {
    PROCESS_RE.find_iter(output).count() as u32
}

fn parse_boot_status(output: &str) -> BootStatus {
    match BOOT_RE.captures(output) {
        Some(cap) if cap[1].to_lowercase().contains("finish") => BootStatus::BootFinished,
        Some(_) => BootStatus::Booting,
        None => BootStatus::Unknown,
    }
}

fn parse_net_health(output: &str) -> NetworkHealth {
    match NET_HEALTH_RE.captures(output) {
        Some(cap) if cap[1].eq_ignore_ascii_case("Success") => NetworkHealth::Healthy,
        Some(_) => NetworkHealth::Unhealthy,
        None => NetworkHealth::Unknown,
    }
}

#[async_trait]
impl DeviceInterface for AscendDevice {
    async fn list_devices(&self) -> Result<Vec<NpuDevice>, DeviceError> {
        let output = self.run_npu_smi(&["info", "-m"]).await?;
        let chips = parse_chip_map(&output);
        *self.chips.write().await = chips.iter().map(|c| (c.logic_id, c.clone())).collect();

        let mut devices = Vec::with_capacity(chips.len());
        for chip in chips {
            let mut device =
                NpuDevice::new(self.family, chip.logic_id, chip.logic_id, chip.card_id, chip.chip_id);
            match self.query_chip(chip.logic_id, "health").await {
                Ok(out) => {
                    let (health, codes) = parse_health(&out);
                    device.health = health;
                    device.error_codes = codes;
                }
                Err(e) => {
                    warn!(device = %device, error = %e, "Failed to query device health");
                    device.health = Health::Unhealthy;
                }
            }
            devices.push(device);
        }

        trace!(count = devices.len(), "Listed Ascend devices");
        Ok(devices)
    }

    async fn error_codes(&self, logic_id: i32) -> Result<Vec<u64>, DeviceError> {
        let output = self.query_chip(logic_id, "health").await?;
        Ok(parse_health(&output).1)
    }

    async fn process_count(&self, logic_id: i32) -> Result<u32, DeviceError> {
        let output = self.query_chip(logic_id, "proc-mem").await?;
        Ok(parse_process_count(&output))
    }

    async fn boot_status(&self, logic_id: i32) -> Result<BootStatus, DeviceError> {
        let output = self.query_chip(logic_id, "boot").await?;
        Ok(parse_boot_status(&output))
    }

    async fn network_health(&self, logic_id: i32) -> Result<NetworkHealth, DeviceError> {
        let chip = self.chip(logic_id).await?;
        let id = chip.logic_id.to_string();
        match run_tool(&self.hccn_tool_path, &["-i", &id, "-net_health", "-g"]).await {
            Ok(output) => Ok(parse_net_health(&output)),
            Err(e) => {
                debug!(logic_id = logic_id, error = %e, "hccn_tool query failed");
                Err(e)
            }
        }
    }

    async fn reset_device(&self, card_id: i32, device_id: i32) -> Result<(), DeviceError> {
        let card = card_id.to_string();
        let chip = device_id.to_string();
        warn!(card_id = card_id, device_id = device_id, "Issuing NPU hot reset");

        run_tool(
            &self.npu_smi_path,
            &["set", "-t", "reset", "-i", &card, "-c", &chip, "-m", "1"],
        )
        .await
        .map(|_| ())
        .map_err(|e| DeviceError::ResetFailed {
            card_id,
            device_id,
            message: e.to_string(),
        })
    }

    fn hardware_family(&self) -> HardwareFamily {
        self.family
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chip_map() {
        let sample = r#"
        NPU ID                         Chip ID                        Chip Logic ID                  Chip Name
        0                              0                              0                              Ascend 910B3
        0                              1                              -                              Mcu
        1                              0                              1                              Ascend 910B3
"#;
        let chips = parse_chip_map(sample);
        assert_eq!(chips.len(), 2);
        assert_eq!(chips[1].card_id, 1);
        assert_eq!(chips[1].chip_id, 0);
        assert_eq!(chips[1].logic_id, 1);
        assert_eq!(chips[1].chip_name, "Ascend 910B3");
    }

    #[test]
    fn test_parse_health() {
        let ok = "        Health Status                  : OK\n        Error Code                     : NA\n";
        assert_eq!(parse_health(ok), (Health::Healthy, vec![]));

        let faulted = "        Health Status                  : Alarm\n        Error Code                     : 80E01801 8C084E00\n";
        assert_eq!(
            parse_health(faulted),
            (Health::Unhealthy, vec![0x80E01801, 0x8C084E00])
        );
    }

    #[test]
    fn test_parse_process_and_boot() {
        let procs = "Process id : 1201\nProcess memory(MB) : 300\nProcess id : 1202\n";
        assert_eq!(parse_process_count(procs), 2);
        assert_eq!(parse_process_count("No process in device.\n"), 0);

        assert_eq!(
            parse_boot_status("Boot Status : Boot Finished"),
            BootStatus::BootFinished
        );
        assert_eq!(parse_boot_status("Boot Status : Booting"), BootStatus::Booting);
        assert_eq!(parse_boot_status(""), BootStatus::Unknown);
    }

    #[test]
    fn test_parse_net_health() {
        assert_eq!(
            parse_net_health("net health status: Success"),
            NetworkHealth::Healthy
        );
        assert_eq!(
            parse_net_health("net health status: Fault"),
            NetworkHealth::Unhealthy
        );
        assert_eq!(parse_net_health("unknown"), NetworkHealth::Unknown);
    }
}
