//! Kubernetes Client wrapper
//!
//! Provides a simplified interface to the Kubernetes API.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Config};
use serde_json::json;
use tracing::{debug, info};

const FIELD_MANAGER: &str = "hotreset";

/// Kubernetes client wrapper
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Create a new K8s client using in-cluster config
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;

        info!("Connected to Kubernetes API server");
        Ok(Self { client })
    }

    /// Create a new K8s client with custom config
    pub async fn with_config(config: Config) -> Result<Self> {
        let client = Client::try_from(config)
            .context("Failed to create Kubernetes client from config")?;

        Ok(Self { client })
    }

    /// Get the underlying kube client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get node API
    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Get all pods API
    pub fn pods_all(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    /// Get config maps API for a namespace
    pub fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Get all config maps API
    pub fn config_maps_all(&self) -> Api<ConfigMap> {
        Api::all(self.client.clone())
    }

    /// Get a node by name
    pub async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes()
            .get(name)
            .await
            .with_context(|| format!("Failed to get node: {}", name))
    }

    /// Check if the API server is reachable
    pub async fn health_check(&self) -> Result<()> {
        let _ = self
            .nodes()
            .list(&ListParams::default().limit(1))
            .await
            .context("Failed to list nodes")?;
        Ok(())
    }

    /// Read one annotation of a node
    pub async fn node_annotation(&self, node_name: &str, key: &str) -> Result<Option<String>> {
        let node = self.get_node(node_name).await?;
        Ok(node
            .metadata
            .annotations
            .and_then(|mut a| a.remove(key)))
    }

    /// Set one annotation of a node
    pub async fn patch_node_annotation(&self, node_name: &str, key: &str, value: &str) -> Result<()> {
        let annotations: BTreeMap<&str, &str> = [(key, value)].into_iter().collect();
        let patch = json!({
            "metadata": {
                "annotations": annotations
            }
        });

        let params = PatchParams::apply(FIELD_MANAGER);
        self.nodes()
            .patch(node_name, &params, &Patch::Merge(&patch))
            .await
            .with_context(|| format!("Failed to annotate node: {}", node_name))?;

        debug!(node = node_name, key = key, "Node annotation updated");
        Ok(())
    }

    /// List pods on a specific node
    pub async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));

        let pods = self
            .pods_all()
            .list(&params)
            .await
            .with_context(|| format!("Failed to list pods on node: {}", node_name))?;

        Ok(pods.items)
    }

    /// Get a config map, `None` if it does not exist
    pub async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.config_maps(namespace)
            .get_opt(name)
            .await
            .with_context(|| format!("Failed to get config map: {}/{}", namespace, name))
    }

    /// Set one data key of a config map, creating the map if missing
    pub async fn upsert_config_map_data(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: String,
    ) -> Result<()> {
        let api = self.config_maps(namespace);
        let params = PostParams::default();

        match self.get_config_map(namespace, name).await? {
            Some(mut cm) => {
                cm.data.get_or_insert_with(BTreeMap::new).insert(key.to_string(), value);
                api.replace(name, &params, &cm)
                    .await
                    .with_context(|| format!("Failed to update config map: {}/{}", namespace, name))?;
                debug!(namespace = namespace, name = name, "Config map updated");
            }
            None => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    },
                    data: Some([(key.to_string(), value)].into_iter().collect()),
                    ..Default::default()
                };
                api.create(&params, &cm)
                    .await
                    .with_context(|| format!("Failed to create config map: {}/{}", namespace, name))?;
                info!(namespace = namespace, name = name, "Config map created");
            }
        }
        Ok(())
    }
}
