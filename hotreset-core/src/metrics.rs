//! Prometheus metrics for the hot-reset engine

use once_cell::sync::Lazy;
use prometheus::{opts, register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge};

use crate::bookkeeping::RecoverStatus;
use crate::policy::PolicyLevel;

/// Recovery episodes started, by entry policy
static EPISODES_STARTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("hotreset_episodes_started_total", "Total number of recovery episodes started"),
        &["policy"]
    )
    .expect("Failed to create episodes_started metric")
});

/// Recovery episodes finished, by outcome
static EPISODES_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("hotreset_episodes_finished_total", "Total number of recovery episodes finished"),
        &["outcome"]
    )
    .expect("Failed to create episodes_finished metric")
});

/// Hardware reset commands issued
static RESET_COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("hotreset_reset_commands_total", "Total number of device reset commands"),
        &["result"]
    )
    .expect("Failed to create reset_commands metric")
});

/// Ledger writes that failed
static LEDGER_WRITE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("hotreset_ledger_write_failures_total", "Total number of failed ledger writes"),
        &["record"]
    )
    .expect("Failed to create ledger_write_failures metric")
});

/// Devices currently marked in reset
static DEVICES_IN_RESET: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("hotreset_devices_in_reset", "Number of devices currently in reset"))
        .expect("Failed to create devices_in_reset metric")
});

/// Number of NPUs detected
static NPU_COUNT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("hotreset_npu_count", "Number of NPUs detected"))
        .expect("Failed to create npu_count metric")
});

/// Metrics registry wrapper
#[derive(Debug, Clone, Copy)]
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*EPISODES_STARTED;
        let _ = &*EPISODES_FINISHED;
        let _ = &*RESET_COMMANDS;
        let _ = &*LEDGER_WRITE_FAILURES;
        let _ = &*DEVICES_IN_RESET;
        let _ = &*NPU_COUNT;
        Self
    }

    pub fn set_npu_count(&self, count: i64) {
        NPU_COUNT.set(count);
    }

    pub fn set_devices_in_reset(&self, count: i64) {
        DEVICES_IN_RESET.set(count);
    }

    pub fn inc_episode_started(&self, policy: PolicyLevel) {
        EPISODES_STARTED.with_label_values(&[policy.as_str()]).inc();
    }

    pub fn inc_episode_finished(&self, outcome: RecoverStatus) {
        let outcome = match outcome {
            RecoverStatus::Unrecovered => "unrecovered",
            RecoverStatus::Recovered => "recovered",
            RecoverStatus::RecoverFailed => "recover_failed",
        };
        EPISODES_FINISHED.with_label_values(&[outcome]).inc();
    }

    pub fn inc_reset_command(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        RESET_COMMANDS.with_label_values(&[result]).inc();
    }

    /// `record` is "task" or "node"
    pub fn inc_ledger_write_failure(&self, record: &str) {
        LEDGER_WRITE_FAILURES.with_label_values(&[record]).inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let registry = MetricsRegistry::new();

        registry.set_npu_count(8);
        registry.set_devices_in_reset(4);
        registry.inc_episode_started(PolicyLevel::Reset);
        registry.inc_episode_finished(RecoverStatus::Recovered);
        registry.inc_reset_command(true);
        registry.inc_ledger_write_failure("task");

        assert_eq!(NPU_COUNT.get(), 8);
        assert!(EPISODES_STARTED.with_label_values(&["ResetError"]).get() >= 1);
    }
}
