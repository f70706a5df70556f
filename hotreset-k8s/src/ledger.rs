//! Cluster ledger over ConfigMaps and node annotations

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info};

use hotreset_core::ledger::{ClusterClient, LedgerError, NodeResetInfo, TaskResetInfo, WriteMode};
use hotreset_core::PodInfo;

use crate::client::K8sClient;

/// Name prefix of task reset config maps
pub const RESET_CONFIG_PREFIX: &str = "reset-config-";
/// Name prefix of task diagnostics config maps
pub const FAULT_CONFIG_PREFIX: &str = "fault-config-";
/// Data key of the task reset record
pub const RESET_DATA_KEY: &str = "reset.json";
/// Data key of the diagnostics record
pub const FAULT_DATA_KEY: &str = "fault.json";
/// Node annotation holding the node reset record
pub const NODE_RESET_ANNOTATION: &str = "huawei.com/reset-devices";

pub fn reset_config_name(task: &str) -> String {
    format!("{}{}", RESET_CONFIG_PREFIX, task)
}

/// Engine view of a pod
pub fn pod_info(pod: &Pod) -> PodInfo {
    let meta = &pod.metadata;
    PodInfo {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_else(BTreeMap::new),
        labels: meta.labels.clone().unwrap_or_else(BTreeMap::new),
    }
}

fn cluster_err(e: anyhow::Error) -> LedgerError {
    LedgerError::Cluster(format!("{:#}", e))
}

/// [`ClusterClient`] backed by the Kubernetes API
pub struct KubeLedger {
    client: K8sClient,
    node_name: String,
}

impl KubeLedger {
    pub fn new(client: K8sClient, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeLedger {
    async fn list_node_pods(&self) -> Result<Vec<PodInfo>, LedgerError> {
        let pods = self
            .client
            .list_pods_on_node(&self.node_name)
            .await
            .map_err(cluster_err)?;
        Ok(pods.iter().map(pod_info).collect())
    }

    async fn get_task_reset_info(&self, namespace: &str, task: &str) -> Result<Option<TaskResetInfo>, LedgerError> {
        let name = reset_config_name(task);
        let cm = self
            .client
            .get_config_map(namespace, &name)
            .await
            .map_err(cluster_err)?;

        let raw = cm
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(RESET_DATA_KEY));
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => {
                debug!(namespace, task, "No task reset record");
                Ok(None)
            }
        }
    }

    async fn write_task_reset_info(&self, namespace: &str, task: &str, info: &TaskResetInfo) -> Result<(), LedgerError> {
        let raw = serde_json::to_string(info)?;
        self.client
            .upsert_config_map_data(namespace, &reset_config_name(task), RESET_DATA_KEY, raw)
            .await
            .map_err(cluster_err)
    }

    async fn get_node_reset_info(&self) -> Result<NodeResetInfo, LedgerError> {
        let raw = self
            .client
            .node_annotation(&self.node_name, NODE_RESET_ANNOTATION)
            .await
            .map_err(cluster_err)?;

        match raw {
            Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(NodeResetInfo::default()),
        }
    }

    async fn write_node_reset_info(&self, info: &NodeResetInfo, mode: WriteMode) -> Result<(), LedgerError> {
        let mut stored = match mode {
            WriteMode::Overwrite => NodeResetInfo::default(),
            WriteMode::Append => self.get_node_reset_info().await?,
        };
        stored.merge(info, mode);

        let raw = serde_json::to_string(&stored)?;
        self.client
            .patch_node_annotation(&self.node_name, NODE_RESET_ANNOTATION, &raw)
            .await
            .context("Failed to write node reset record")
            .map_err(cluster_err)?;

        info!(
            node = %self.node_name,
            mode = ?mode,
            third_party = stored.third_party_reset_devs.len(),
            manual = stored.manual_reset_devs.len(),
            "Node reset record written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_pod_info_from_pod() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("train-0".to_string()),
                namespace: Some("ai".to_string()),
                uid: Some("u-1".to_string()),
                annotations: Some(
                    [("volcano.sh/job-name".to_string(), "train".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };

        let info = pod_info(&pod);
        assert_eq!(info.key(), "ai/train-0");
        assert_eq!(info.task_name().unwrap(), "train");
        assert!(info.labels.is_empty());
    }

    #[test]
    fn test_names() {
        assert_eq!(reset_config_name("train"), "reset-config-train");
    }
}
