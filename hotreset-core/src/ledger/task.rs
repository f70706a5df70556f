//! Per-task reset record writes

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use super::{ClusterClient, LedgerError, TaskResetInfo};
use crate::bookkeeping::{PodInfo, RecoverStatus, TaskDeviceInfo};
use crate::metrics::MetricsRegistry;
use crate::policy::PolicyLevel;

#[derive(Debug, Clone)]
pub struct TaskLedgerConfig {
    /// Sleep before writing `Recovered` after a successful reset
    pub warm_up: Duration,
    /// Sleep after every timed write
    pub propagation: Duration,
}

impl Default for TaskLedgerConfig {
    fn default() -> Self {
        Self {
            warm_up: Duration::from_secs(20),
            propagation: Duration::from_secs(3),
        }
    }
}

/// Writer of task reset records
pub struct TaskLedger {
    client: Arc<dyn ClusterClient>,
    config: TaskLedgerConfig,
    metrics: MetricsRegistry,
}

impl TaskLedger {
    pub fn new(client: Arc<dyn ClusterClient>, config: TaskLedgerConfig, metrics: MetricsRegistry) -> Self {
        Self { client, config, metrics }
    }

    pub async fn read(&self, pod: &PodInfo, task: &str) -> Result<Option<TaskResetInfo>, LedgerError> {
        self.client.get_task_reset_info(&pod.namespace, task).await
    }

    /// Timed status write
    ///
    /// A `Recovered` outcome of a reset policy first waits for the devices to
    /// warm up. Every write is followed by the propagation delay.
    pub async fn update_status(
        &self,
        pod: &PodInfo,
        task: &str,
        ranks: &[TaskDeviceInfo],
        policy: PolicyLevel,
        status: RecoverStatus,
        retry_time: u32,
    ) -> Result<(), LedgerError> {
        if status == RecoverStatus::Recovered && matches!(policy, PolicyLevel::Reset | PolicyLevel::FreeReset) {
            sleep(self.config.warm_up).await;
        }
        self.update_status_without_wait(pod, task, ranks, policy, status, retry_time)
            .await?;
        sleep(self.config.propagation).await;
        Ok(())
    }

    /// Status write with no delay either side
    ///
    /// Multi-node tasks share the record with other nodes, so their local
    /// ranks are merged into what is stored. Single-node records are replaced.
    pub async fn update_status_without_wait(
        &self,
        pod: &PodInfo,
        task: &str,
        ranks: &[TaskDeviceInfo],
        policy: PolicyLevel,
        status: RecoverStatus,
        retry_time: u32,
    ) -> Result<(), LedgerError> {
        let local: Vec<TaskDeviceInfo> = ranks.iter().map(|r| r.with_outcome(policy, status)).collect();
        let rank_list = if pod.is_multi_node() {
            let mut stored = self.read(pod, task).await?.unwrap_or_default();
            stored.upsert_ranks(&local);
            stored.rank_list
        } else {
            local
        };
        let info = TaskResetInfo {
            rank_list,
            update_time: chrono::Utc::now().timestamp(),
            retry_time,
        };
        self.write(pod, task, &info).await?;
        info!(task, policy = %policy, status = ?status, retry_time, "Updated task reset record");
        Ok(())
    }

    /// Merge `ranks` as failed isolation into the stored record
    pub async fn write_isolate_merged(
        &self,
        pod: &PodInfo,
        task: &str,
        ranks: &[TaskDeviceInfo],
    ) -> Result<(), LedgerError> {
        let mut info = self.read(pod, task).await?.unwrap_or_default();
        let isolated: Vec<TaskDeviceInfo> = ranks
            .iter()
            .map(|r| r.with_outcome(PolicyLevel::Isolate, RecoverStatus::RecoverFailed))
            .collect();
        info.upsert_ranks(&isolated);
        info.update_time = chrono::Utc::now().timestamp();

        self.write(pod, task, &info).await?;
        warn!(task, ranks = isolated.len(), "Task resetting on another node, isolated local ranks");
        sleep(self.config.propagation).await;
        Ok(())
    }

    async fn write(&self, pod: &PodInfo, task: &str, info: &TaskResetInfo) -> Result<(), LedgerError> {
        self.client
            .write_task_reset_info(&pod.namespace, task, info)
            .await
            .map_err(|e| {
                self.metrics.inc_ledger_write_failure("task");
                warn!(task, error = %e, "Failed to write task reset record");
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookkeeping::SERVER_COUNT_ANNOTATION;
    use crate::fault_cache::DeviceFaultInfo;
    use crate::ledger::MemoryCluster;
    use tokio::time::Instant;

    fn pod() -> PodInfo {
        PodInfo {
            namespace: "ns".to_string(),
            name: "job-0".to_string(),
            ..Default::default()
        }
    }

    fn multi_node_pod() -> PodInfo {
        let mut pod = pod();
        pod.annotations
            .insert(SERVER_COUNT_ANNOTATION.to_string(), "2".to_string());
        pod
    }

    fn remote_failed_record() -> TaskResetInfo {
        let mut remote = ranks()[0].with_outcome(PolicyLevel::Isolate, RecoverStatus::RecoverFailed);
        remote.rank_id = 9;
        TaskResetInfo {
            rank_list: vec![remote],
            update_time: 1,
            retry_time: 0,
        }
    }

    fn ranks() -> Vec<TaskDeviceInfo> {
        let mut fault = DeviceFaultInfo::empty(0);
        fault.policy = PolicyLevel::Reset;
        vec![TaskDeviceInfo::new(0, fault)]
    }

    fn ledger(cluster: Arc<MemoryCluster>) -> TaskLedger {
        TaskLedger::new(
            cluster,
            TaskLedgerConfig {
                warm_up: Duration::from_millis(40),
                propagation: Duration::from_millis(10),
            },
            MetricsRegistry::new(),
        )
    }

    #[tokio::test]
    async fn test_recovered_reset_waits_for_warm_up() {
        let cluster = Arc::new(MemoryCluster::new());
        let ledger = ledger(cluster.clone());

        let start = Instant::now();
        ledger
            .update_status(&pod(), "job", &ranks(), PolicyLevel::Reset, RecoverStatus::Recovered, 1)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));

        let info = cluster.get_task_reset_info("ns", "job").await.unwrap().unwrap();
        assert_eq!(info.retry_time, 1);
        assert_eq!(info.rank_list[0].status, RecoverStatus::Recovered);
        assert_eq!(info.rank_list[0].initial_policy, PolicyLevel::Reset);
        assert!(!info.is_initializing());
    }

    #[tokio::test]
    async fn test_without_wait_is_immediate() {
        let cluster = Arc::new(MemoryCluster::new());
        let ledger = ledger(cluster.clone());

        let start = Instant::now();
        ledger
            .update_status_without_wait(&pod(), "job", &ranks(), PolicyLevel::Reset, RecoverStatus::Unrecovered, 0)
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(10));
        assert_eq!(cluster.task_writes(), 1);
    }

    #[tokio::test]
    async fn test_isolate_merge_keeps_remote_ranks() {
        let cluster = Arc::new(MemoryCluster::new());
        let mut remote = ranks();
        remote[0].rank_id = 8;
        cluster
            .put_task_reset_info(
                "ns",
                "job",
                TaskResetInfo {
                    rank_list: remote,
                    update_time: 1,
                    retry_time: 0,
                },
            )
            .await;

        ledger(cluster.clone())
            .write_isolate_merged(&pod(), "job", &ranks())
            .await
            .unwrap();

        let info = cluster.get_task_reset_info("ns", "job").await.unwrap().unwrap();
        assert_eq!(info.rank_list.len(), 2);
        assert_eq!(info.rank_list[0].status, RecoverStatus::Unrecovered);
        assert_eq!(info.rank_list[1].fault.policy, PolicyLevel::Isolate);
        assert_eq!(info.rank_list[1].status, RecoverStatus::RecoverFailed);
    }

    #[tokio::test]
    async fn test_multi_node_write_keeps_remote_ranks() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.put_task_reset_info("ns", "job", remote_failed_record()).await;
        let ledger = ledger(cluster.clone());

        for status in [RecoverStatus::Unrecovered, RecoverStatus::Recovered] {
            ledger
                .update_status_without_wait(&multi_node_pod(), "job", &ranks(), PolicyLevel::Reset, status, 1)
                .await
                .unwrap();
        }

        let info = cluster.get_task_reset_info("ns", "job").await.unwrap().unwrap();
        let ranks: Vec<(u32, RecoverStatus)> = info.rank_list.iter().map(|r| (r.rank_id, r.status)).collect();
        assert_eq!(
            ranks,
            vec![(9, RecoverStatus::RecoverFailed), (0, RecoverStatus::Recovered)]
        );
    }

    #[tokio::test]
    async fn test_single_node_write_replaces_record() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.put_task_reset_info("ns", "job", remote_failed_record()).await;

        ledger(cluster.clone())
            .update_status_without_wait(&pod(), "job", &ranks(), PolicyLevel::Reset, RecoverStatus::Unrecovered, 0)
            .await
            .unwrap();

        let info = cluster.get_task_reset_info("ns", "job").await.unwrap().unwrap();
        assert_eq!(info.rank_list.len(), 1);
        assert_eq!(info.rank_list[0].rank_id, 0);
    }

    #[tokio::test]
    async fn test_write_failure_is_returned() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.set_fail_writes(true);
        let err = ledger(cluster)
            .update_status(&pod(), "job", &ranks(), PolicyLevel::Reset, RecoverStatus::Unrecovered, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Cluster(_)));
    }
}
