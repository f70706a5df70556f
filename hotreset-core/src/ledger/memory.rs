//! In-memory cluster for tests and local runs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ClusterClient, LedgerError, NodeResetInfo, TaskResetInfo, WriteMode};
use crate::bookkeeping::PodInfo;

/// Cluster state held in memory
#[derive(Default)]
pub struct MemoryCluster {
    pods: RwLock<Vec<PodInfo>>,
    tasks: RwLock<HashMap<(String, String), TaskResetInfo>>,
    node: RwLock<NodeResetInfo>,
    task_writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_pods(&self, pods: Vec<PodInfo>) {
        *self.pods.write().await = pods;
    }

    pub async fn put_task_reset_info(&self, namespace: &str, task: &str, info: TaskResetInfo) {
        self.tasks
            .write()
            .await
            .insert((namespace.to_string(), task.to_string()), info);
    }

    pub async fn node_reset_info(&self) -> NodeResetInfo {
        self.node.read().await.clone()
    }

    /// Number of task record writes so far
    pub fn task_writes(&self) -> usize {
        self.task_writes.load(Ordering::SeqCst)
    }

    /// Make every write fail until cleared
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), LedgerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::Cluster("write rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn list_node_pods(&self) -> Result<Vec<PodInfo>, LedgerError> {
        Ok(self.pods.read().await.clone())
    }

    async fn get_task_reset_info(&self, namespace: &str, task: &str) -> Result<Option<TaskResetInfo>, LedgerError> {
        Ok(self
            .tasks
            .read()
            .await
            .get(&(namespace.to_string(), task.to_string()))
            .cloned())
    }

    async fn write_task_reset_info(&self, namespace: &str, task: &str, info: &TaskResetInfo) -> Result<(), LedgerError> {
        self.check_writable()?;
        self.put_task_reset_info(namespace, task, info.clone()).await;
        self.task_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_node_reset_info(&self) -> Result<NodeResetInfo, LedgerError> {
        Ok(self.node.read().await.clone())
    }

    async fn write_node_reset_info(&self, info: &NodeResetInfo, mode: WriteMode) -> Result<(), LedgerError> {
        self.check_writable()?;
        self.node.write().await.merge(info, mode);
        Ok(())
    }
}
