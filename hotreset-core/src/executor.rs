//! Device Reset Executor
//!
//! Issues the hardware reset command and waits for a whole ring to come back.
//! Every wait is a bounded poll; failures are always returned to the caller.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::device::{BootStatus, DeviceError, DeviceInterface, NetworkHealth, NpuDevice};
use crate::metrics::MetricsRegistry;
use crate::ring::RingTopology;

/// Timing and retry bounds of the executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Sleep between two polls of the same condition
    pub poll_interval: Duration,
    /// Attempts of the reset command
    pub reset_retry: u32,
    /// Backoff unit, attempt `n` waits `n * reset_backoff`
    pub reset_backoff: Duration,
    /// Boot status polls per device
    pub boot_max_polls: u32,
    /// Network health polls per device
    pub network_max_polls: u32,
    /// Budget for in-flight processes to exit
    pub process_wait: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            reset_retry: 3,
            reset_backoff: Duration::from_secs(10),
            boot_max_polls: 120,
            network_max_polls: 60,
            process_wait: Duration::from_secs(150),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Reset of card {card_id} device {device_id} failed after {attempts} attempts: {source}")]
    Reset {
        card_id: i32,
        device_id: i32,
        attempts: u32,
        #[source]
        source: DeviceError,
    },

    #[error("Device {logic_id} did not finish booting after {polls} polls")]
    BootTimeout { logic_id: i32, polls: u32 },

    #[error("Device {logic_id} network not healthy after {polls} polls")]
    NetworkTimeout { logic_id: i32, polls: u32 },

    #[error("Processes on devices {logic_ids:?} still running after {waited:?}")]
    ProcessDrainTimeout { logic_ids: Vec<i32>, waited: Duration },
}

impl ExecutorError {
    /// Whether a reset command was issued before the failure
    pub fn reset_attempted(&self) -> bool {
        !matches!(self, ExecutorError::ProcessDrainTimeout { .. })
    }
}

/// Reset executor bound to one device interface and ring layout
pub struct ResetExecutor {
    device: Arc<dyn DeviceInterface>,
    topology: RingTopology,
    config: ExecutorConfig,
    metrics: MetricsRegistry,
}

impl ResetExecutor {
    pub fn new(
        device: Arc<dyn DeviceInterface>,
        topology: RingTopology,
        config: ExecutorConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            device,
            topology,
            config,
            metrics,
        }
    }

    pub fn topology(&self) -> RingTopology {
        self.topology
    }

    /// Issue the reset command with linearly increasing backoff
    pub async fn try_reset(&self, card_id: i32, device_id: i32) -> Result<(), ExecutorError> {
        let attempts = self.config.reset_retry.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match self.device.reset_device(card_id, device_id).await {
                Ok(()) => {
                    self.metrics.inc_reset_command(true);
                    info!(card = card_id, device = device_id, attempt, "Reset command accepted");
                    return Ok(());
                }
                Err(e) => {
                    self.metrics.inc_reset_command(false);
                    warn!(card = card_id, device = device_id, attempt, error = %e, "Reset command failed");
                    last_err = Some(e);
                }
            }

            if attempt < attempts {
                sleep(self.config.reset_backoff * attempt).await;
            }
        }

        Err(ExecutorError::Reset {
            card_id,
            device_id,
            attempts,
            source: last_err.unwrap_or_else(|| DeviceError::Other("no reset attempt".to_string())),
        })
    }

    /// Wait until every device in the ring of `logic_id` has booted
    ///
    /// When `require_network` is set each device must also report healthy
    /// links. Any device timing out fails the whole ring.
    pub async fn wait_ring_complete(&self, logic_id: i32, require_network: bool) -> Result<(), ExecutorError> {
        let ring = self.topology.ring_of(logic_id);
        debug!(ring_start = ring[0], size = ring.len(), require_network, "Waiting for ring");

        for id in &ring {
            self.wait_boot_finished(*id).await?;
        }
        if require_network {
            for id in &ring {
                self.wait_network_healthy(*id).await?;
            }
        }

        info!(ring_start = ring[0], "Ring recovered");
        Ok(())
    }

    async fn wait_boot_finished(&self, logic_id: i32) -> Result<(), ExecutorError> {
        let polls = self.config.boot_max_polls.max(1);
        for poll in 1..=polls {
            match self.device.boot_status(logic_id).await {
                Ok(BootStatus::BootFinished) => return Ok(()),
                Ok(status) => trace_poll(logic_id, poll, &format!("{:?}", status)),
                Err(e) => trace_poll(logic_id, poll, &e.to_string()),
            }
            if poll < polls {
                sleep(self.config.poll_interval).await;
            }
        }
        Err(ExecutorError::BootTimeout { logic_id, polls })
    }

    async fn wait_network_healthy(&self, logic_id: i32) -> Result<(), ExecutorError> {
        let polls = self.config.network_max_polls.max(1);
        for poll in 1..=polls {
            match self.device.network_health(logic_id).await {
                Ok(NetworkHealth::Healthy) => return Ok(()),
                Ok(health) => trace_poll(logic_id, poll, &format!("{:?}", health)),
                Err(e) => trace_poll(logic_id, poll, &e.to_string()),
            }
            if poll < polls {
                sleep(self.config.poll_interval).await;
            }
        }
        Err(ExecutorError::NetworkTimeout { logic_id, polls })
    }

    /// Wait for every device in `logic_ids` to have no running processes
    pub async fn wait_processes_drained(&self, logic_ids: &[i32]) -> Result<(), ExecutorError> {
        let start = Instant::now();
        loop {
            let mut busy = Vec::new();
            for id in logic_ids {
                match self.device.process_count(*id).await {
                    Ok(0) => {}
                    Ok(n) => {
                        debug!(device = id, processes = n, "Device still has processes");
                        busy.push(*id);
                    }
                    Err(e) => {
                        debug!(device = id, error = %e, "Process query failed");
                        busy.push(*id);
                    }
                }
            }

            if busy.is_empty() {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= self.config.process_wait {
                return Err(ExecutorError::ProcessDrainTimeout {
                    logic_ids: busy,
                    waited,
                });
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Reset the ring of `device` and wait for it to come back
    pub async fn reset_ring(&self, device: &NpuDevice, require_network: bool) -> Result<(), ExecutorError> {
        self.try_reset(device.card_id, device.device_id).await?;
        self.wait_ring_complete(device.logic_id, require_network).await
    }
}

fn trace_poll(logic_id: i32, poll: u32, state: &str) {
    tracing::trace!(device = logic_id, poll, state, "Device not ready");
}
