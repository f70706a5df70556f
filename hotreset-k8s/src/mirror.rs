//! Cluster Event Mirror
//!
//! Mirrors the reset and diagnostics ConfigMaps of tasks running on this node
//! into local files for agents that cannot reach the API server. Pod and
//! ConfigMap watch events feed one work queue; failed items are re-queued
//! with per-key exponential backoff.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::runtime::{watcher, WatchStreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use hotreset_core::PodInfo;

use crate::client::K8sClient;
use crate::ledger::{pod_info, FAULT_CONFIG_PREFIX, FAULT_DATA_KEY, RESET_CONFIG_PREFIX, RESET_DATA_KEY};

/// Mirror settings
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Directory holding one `<namespace>.<task>` directory per task
    pub root: PathBuf,
    /// Attempts per item before it is dropped
    pub retry_limit: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/user/restore/reset"),
            retry_limit: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOp {
    Add,
    Update,
    Delete,
}

/// Work queue item
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorItem {
    Pod {
        op: EventOp,
        pod: PodInfo,
    },
    ConfigMap {
        op: EventOp,
        namespace: String,
        name: String,
        data: BTreeMap<String, String>,
    },
}

impl MirrorItem {
    /// Rate limiter key
    pub fn key(&self) -> String {
        match self {
            MirrorItem::Pod { pod, .. } => format!("pod/{}", pod.key()),
            MirrorItem::ConfigMap { namespace, name, .. } => format!("configmap/{}/{}", namespace, name),
        }
    }
}

/// Which mirrored file a ConfigMap maps to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredFile {
    pub task: String,
    pub data_key: &'static str,
}

/// Classify a ConfigMap name, `None` for maps that are not mirrored
pub fn classify_config_map(name: &str) -> Option<MirroredFile> {
    let (task, data_key) = if let Some(task) = name.strip_prefix(RESET_CONFIG_PREFIX) {
        (task, RESET_DATA_KEY)
    } else if let Some(task) = name.strip_prefix(FAULT_CONFIG_PREFIX) {
        (task, FAULT_DATA_KEY)
    } else {
        return None;
    };

    if task.is_empty() {
        return None;
    }
    Some(MirroredFile {
        task: task.to_string(),
        data_key,
    })
}

/// Read access to ConfigMap data
#[async_trait]
pub trait ConfigMapSource: Send + Sync {
    async fn config_map_data(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>>;
}

#[async_trait]
impl ConfigMapSource for K8sClient {
    async fn config_map_data(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self
            .get_config_map(namespace, name)
            .await?
            .map(|cm| cm.data.unwrap_or_default()))
    }
}

/// Applies queue items to the local file tree
pub struct MirrorHandler {
    root: PathBuf,
    source: Arc<dyn ConfigMapSource>,
}

impl MirrorHandler {
    pub fn new(root: impl Into<PathBuf>, source: Arc<dyn ConfigMapSource>) -> Self {
        Self {
            root: root.into(),
            source,
        }
    }

    pub fn task_dir(&self, namespace: &str, task: &str) -> PathBuf {
        self.root.join(format!("{}.{}", namespace, task))
    }

    pub async fn handle(&self, item: &MirrorItem) -> Result<()> {
        match item {
            MirrorItem::Pod { op: EventOp::Add, pod } => self.on_pod_add(pod).await,
            MirrorItem::Pod { op: EventOp::Update, pod } => {
                debug!(pod = %pod.key(), "Pod update, nothing to mirror");
                Ok(())
            }
            MirrorItem::Pod { op: EventOp::Delete, pod } => self.on_pod_delete(pod).await,
            MirrorItem::ConfigMap { op: EventOp::Delete, namespace, name, .. } => {
                self.on_config_map_delete(namespace, name).await
            }
            MirrorItem::ConfigMap { namespace, name, data, .. } => {
                self.on_config_map_apply(namespace, name, data).await
            }
        }
    }

    async fn on_pod_add(&self, pod: &PodInfo) -> Result<()> {
        let task = match pod.task_name() {
            Ok(task) => task,
            Err(e) => {
                debug!(pod = %pod.key(), error = %e, "Pod has no task, not mirrored");
                return Ok(());
            }
        };

        let dir = self.task_dir(&pod.namespace, &task);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        for (prefix, data_key) in [(RESET_CONFIG_PREFIX, RESET_DATA_KEY), (FAULT_CONFIG_PREFIX, FAULT_DATA_KEY)] {
            let name = format!("{}{}", prefix, task);
            let data = self.source.config_map_data(&pod.namespace, &name).await?;
            // Created even without a config map so later updates are mirrored
            let content = data.as_ref().and_then(|d| d.get(data_key)).map_or("", String::as_str);
            write_atomic(&dir, data_key, content).await?;
        }

        info!(pod = %pod.key(), task = %task, dir = %dir.display(), "Task mirror created");
        Ok(())
    }

    async fn on_pod_delete(&self, pod: &PodInfo) -> Result<()> {
        let Ok(task) = pod.task_name() else {
            return Ok(());
        };
        let dir = self.task_dir(&pod.namespace, &task);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(task = %task, dir = %dir.display(), "Task mirror removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
        }
    }

    async fn on_config_map_apply(&self, namespace: &str, name: &str, data: &BTreeMap<String, String>) -> Result<()> {
        let Some(file) = classify_config_map(name) else {
            return Ok(());
        };
        // Mirrored files are created only by pod add
        let dir = self.task_dir(namespace, &file.task);
        if !tokio::fs::try_exists(dir.join(file.data_key)).await.unwrap_or(false) {
            debug!(namespace, name, "Task not on this node, not mirrored");
            return Ok(());
        }

        match data.get(file.data_key) {
            Some(content) => write_atomic(&dir, file.data_key, content).await,
            None => {
                debug!(namespace, name, key = file.data_key, "Config map lacks mirrored key");
                Ok(())
            }
        }
    }

    async fn on_config_map_delete(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(file) = classify_config_map(name) else {
            return Ok(());
        };
        let path = self.task_dir(namespace, &file.task).join(file.data_key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Mirrored file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

/// Write `file_name` in `dir` through a temp file and rename
async fn write_atomic(dir: &Path, file_name: &str, content: &str) -> Result<()> {
    let tmp = dir.join(format!(".{}.tmp", file_name));
    let target = dir.join(file_name);
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &target)
        .await
        .with_context(|| format!("Failed to rename to {}", target.display()))?;
    debug!(path = %target.display(), "Mirrored file written");
    Ok(())
}

/// Per-key exponential backoff
#[derive(Debug)]
pub struct RateLimiter {
    base: Duration,
    max: Duration,
    failures: HashMap<String, u32>,
}

impl RateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Delay before the next retry of `key`, doubling each call
    pub fn when(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(*failures))
            .min(self.max);
        *failures += 1;
        delay
    }

    pub fn retries(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

/// Single-consumer queue in front of a [`MirrorHandler`]
pub struct WorkQueue {
    handler: MirrorHandler,
    limiter: RateLimiter,
    retry_limit: u32,
    tx: mpsc::UnboundedSender<MirrorItem>,
    rx: mpsc::UnboundedReceiver<MirrorItem>,
}

impl WorkQueue {
    pub fn new(handler: MirrorHandler, config: &MirrorConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handler,
            limiter: RateLimiter::new(config.base_delay, config.max_delay),
            retry_limit: config.retry_limit,
            tx,
            rx,
        }
    }

    /// Producer handle
    pub fn sender(&self) -> mpsc::UnboundedSender<MirrorItem> {
        self.tx.clone()
    }

    /// Handle one item, scheduling a delayed retry on failure
    pub async fn process(&mut self, item: MirrorItem) {
        let key = item.key();
        match self.handler.handle(&item).await {
            Ok(()) => self.limiter.forget(&key),
            Err(e) if self.limiter.retries(&key) < self.retry_limit => {
                let delay = self.limiter.when(&key);
                warn!(key = %key, error = %e, delay = ?delay, "Mirror failed, requeueing");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(item);
                });
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Mirror failed too often, dropping");
                self.limiter.forget(&key);
            }
        }
    }

    /// Consume until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(item) => self.process(item).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    info!("Event mirror shutting down");
                    break;
                }
            }
        }
    }
}

/// Watches pods on this node and all ConfigMaps
pub struct EventMirror {
    client: K8sClient,
    node_name: String,
    config: MirrorConfig,
}

impl EventMirror {
    pub fn new(client: K8sClient, node_name: impl Into<String>, config: MirrorConfig) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            config,
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.root)
            .await
            .with_context(|| format!("Failed to create mirror root {}", self.config.root.display()))?;

        let handler = MirrorHandler::new(self.config.root.clone(), Arc::new(self.client.clone()));
        let queue = WorkQueue::new(handler, &self.config);

        let pods = tokio::spawn(watch_pods(self.client.clone(), self.node_name.clone(), queue.sender()));
        let config_maps = tokio::spawn(watch_config_maps(self.client.clone(), queue.sender()));
        info!(node = %self.node_name, root = %self.config.root.display(), "Event mirror started");

        queue.run(shutdown).await;
        pods.abort();
        config_maps.abort();
        Ok(())
    }
}

async fn watch_pods(client: K8sClient, node_name: String, tx: mpsc::UnboundedSender<MirrorItem>) {
    let config = watcher::Config::default().fields(&format!("spec.nodeName={}", node_name));
    let mut stream = watcher(client.pods_all(), config).default_backoff().boxed();
    let mut known: HashMap<String, PodInfo> = HashMap::new();

    while let Some(event) = stream.next().await {
        let items = match event {
            Ok(watcher::Event::Applied(pod)) => vec![applied_pod(&mut known, &pod)],
            Ok(watcher::Event::Deleted(pod)) => {
                let info = pod_info(&pod);
                known.remove(&info.uid);
                vec![MirrorItem::Pod { op: EventOp::Delete, pod: info }]
            }
            Ok(watcher::Event::Restarted(pods)) => restarted_pods(&mut known, &pods),
            Err(e) => {
                warn!(error = %e, "Pod watch error");
                continue;
            }
        };
        for item in items {
            if tx.send(item).is_err() {
                return;
            }
        }
    }
}

fn applied_pod(known: &mut HashMap<String, PodInfo>, pod: &Pod) -> MirrorItem {
    let info = pod_info(pod);
    let op = if known.insert(info.uid.clone(), info.clone()).is_some() {
        EventOp::Update
    } else {
        EventOp::Add
    };
    MirrorItem::Pod { op, pod: info }
}

/// Items for a relist: deletes for vanished pods, then adds or updates
fn restarted_pods(known: &mut HashMap<String, PodInfo>, pods: &[Pod]) -> Vec<MirrorItem> {
    let listed: HashSet<String> = pods.iter().filter_map(|p| p.metadata.uid.clone()).collect();
    let vanished: Vec<String> = known.keys().filter(|uid| !listed.contains(*uid)).cloned().collect();

    let mut items: Vec<MirrorItem> = vanished
        .iter()
        .filter_map(|uid| known.remove(uid))
        .map(|pod| MirrorItem::Pod { op: EventOp::Delete, pod })
        .collect();
    items.extend(pods.iter().map(|p| applied_pod(known, p)));
    items
}

async fn watch_config_maps(client: K8sClient, tx: mpsc::UnboundedSender<MirrorItem>) {
    let mut stream = watcher(client.config_maps_all(), watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut known: HashSet<(String, String)> = HashSet::new();

    while let Some(event) = stream.next().await {
        let items: Vec<MirrorItem> = match event {
            Ok(watcher::Event::Applied(cm)) => vec![config_map_item(&mut known, cm, false)],
            Ok(watcher::Event::Deleted(cm)) => vec![config_map_item(&mut known, cm, true)],
            Ok(watcher::Event::Restarted(cms)) => cms
                .into_iter()
                .map(|cm| config_map_item(&mut known, cm, false))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Config map watch error");
                continue;
            }
        };
        for item in items {
            if tx.send(item).is_err() {
                return;
            }
        }
    }
}

fn config_map_item(known: &mut HashSet<(String, String)>, cm: ConfigMap, deleted: bool) -> MirrorItem {
    let namespace = cm.metadata.namespace.unwrap_or_default();
    let name = cm.metadata.name.unwrap_or_default();
    let id = (namespace.clone(), name.clone());

    let op = if deleted {
        known.remove(&id);
        EventOp::Delete
    } else if known.insert(id) {
        EventOp::Add
    } else {
        EventOp::Update
    };

    MirrorItem::ConfigMap {
        op,
        namespace,
        name,
        data: cm.data.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct FakeSource {
        maps: RwLock<HashMap<(String, String), BTreeMap<String, String>>>,
        failures: AtomicU32,
    }

    impl FakeSource {
        async fn put(&self, namespace: &str, name: &str, key: &str, value: &str) {
            self.maps.write().await.insert(
                (namespace.to_string(), name.to_string()),
                [(key.to_string(), value.to_string())].into_iter().collect(),
            );
        }
    }

    #[async_trait]
    impl ConfigMapSource for FakeSource {
        async fn config_map_data(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                anyhow::bail!("api server unavailable");
            }
            Ok(self
                .maps
                .read()
                .await
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }
    }

    fn pod(task: Option<&str>) -> PodInfo {
        let mut pod = PodInfo {
            namespace: "ai".to_string(),
            name: "train-0".to_string(),
            uid: "uid-0".to_string(),
            ..Default::default()
        };
        if let Some(task) = task {
            pod.labels
                .insert("volcano.sh/job-name".to_string(), task.to_string());
        }
        pod
    }

    fn cm_item(op: EventOp, name: &str, key: &str, value: &str) -> MirrorItem {
        MirrorItem::ConfigMap {
            op,
            namespace: "ai".to_string(),
            name: name.to_string(),
            data: [(key.to_string(), value.to_string())].into_iter().collect(),
        }
    }

    fn setup() -> (TempDir, Arc<FakeSource>, MirrorHandler) {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        let handler = MirrorHandler::new(dir.path(), source.clone());
        (dir, source, handler)
    }

    #[test]
    fn test_classify_config_map() {
        assert_eq!(
            classify_config_map("reset-config-train"),
            Some(MirroredFile {
                task: "train".to_string(),
                data_key: RESET_DATA_KEY
            })
        );
        assert_eq!(classify_config_map("fault-config-train").unwrap().data_key, FAULT_DATA_KEY);
        assert_eq!(classify_config_map("reset-config-"), None);
        assert_eq!(classify_config_map("kube-root-ca.crt"), None);
    }

    #[tokio::test]
    async fn test_pod_add_mirrors_existing_config_maps() {
        let (dir, source, handler) = setup();
        source.put("ai", "reset-config-train", RESET_DATA_KEY, "{\"RankList\":[]}").await;

        tokio_test::assert_ok!(handler.handle(&MirrorItem::Pod { op: EventOp::Add, pod: pod(Some("train")) }).await);

        let task_dir = dir.path().join("ai.train");
        let content = std::fs::read_to_string(task_dir.join(RESET_DATA_KEY)).unwrap();
        assert_eq!(content, "{\"RankList\":[]}");
        // Placeholder until the diagnostics map appears
        assert_eq!(std::fs::read_to_string(task_dir.join(FAULT_DATA_KEY)).unwrap(), "");
        assert!(!task_dir.join(format!(".{}.tmp", RESET_DATA_KEY)).exists());
    }

    #[tokio::test]
    async fn test_config_map_update_needs_mirrored_file() {
        let (dir, _source, handler) = setup();
        let update = cm_item(EventOp::Update, "fault-config-train", FAULT_DATA_KEY, "v1");

        handler.handle(&update).await.unwrap();
        assert!(!dir.path().join("ai.train").exists());

        // A bare directory is not enough
        std::fs::create_dir_all(dir.path().join("ai.train")).unwrap();
        handler.handle(&update).await.unwrap();
        assert!(!dir.path().join("ai.train").join(FAULT_DATA_KEY).exists());

        handler
            .handle(&MirrorItem::Pod { op: EventOp::Add, pod: pod(Some("train")) })
            .await
            .unwrap();
        handler.handle(&update).await.unwrap();
        let path = dir.path().join("ai.train").join(FAULT_DATA_KEY);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "v1");

        handler
            .handle(&cm_item(EventOp::Delete, "fault-config-train", FAULT_DATA_KEY, ""))
            .await
            .unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_pod_delete_removes_task_dir() {
        let (dir, _source, handler) = setup();
        let add = MirrorItem::Pod { op: EventOp::Add, pod: pod(Some("train")) };
        handler.handle(&add).await.unwrap();
        assert!(dir.path().join("ai.train").is_dir());

        handler
            .handle(&MirrorItem::Pod { op: EventOp::Delete, pod: pod(Some("train")) })
            .await
            .unwrap();
        assert!(!dir.path().join("ai.train").exists());

        // Deleting again is not an error
        tokio_test::assert_ok!(
            handler
                .handle(&MirrorItem::Pod { op: EventOp::Delete, pod: pod(Some("train")) })
                .await
        );
    }

    #[tokio::test]
    async fn test_unrecognized_items_are_acknowledged() {
        let (dir, _source, handler) = setup();
        tokio_test::assert_ok!(handler.handle(&cm_item(EventOp::Add, "other", "k", "v")).await);
        tokio_test::assert_ok!(
            handler
                .handle(&MirrorItem::Pod { op: EventOp::Add, pod: pod(None) })
                .await
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_rate_limiter_backoff() {
        let mut limiter = RateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        assert_eq!(limiter.when("a"), Duration::from_millis(5));
        assert_eq!(limiter.when("a"), Duration::from_millis(10));
        assert_eq!(limiter.when("a"), Duration::from_millis(20));
        assert_eq!(limiter.when("b"), Duration::from_millis(5));
        assert_eq!(limiter.retries("a"), 3);

        for _ in 0..40 {
            limiter.when("a");
        }
        assert_eq!(limiter.when("a"), Duration::from_secs(1000));

        limiter.forget("a");
        assert_eq!(limiter.retries("a"), 0);
    }

    #[tokio::test]
    async fn test_queue_retries_failed_items() {
        let (dir, source, handler) = setup();
        source.put("ai", "reset-config-train", RESET_DATA_KEY, "{}").await;
        source.failures.store(2, Ordering::SeqCst);

        let config = MirrorConfig {
            root: dir.path().to_path_buf(),
            retry_limit: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        };
        let mut queue = WorkQueue::new(handler, &config);
        let item = MirrorItem::Pod { op: EventOp::Add, pod: pod(Some("train")) };

        queue.process(item).await;
        for _ in 0..2 {
            let retried = queue.rx.recv().await.unwrap();
            queue.process(retried).await;
        }

        assert!(dir.path().join("ai.train").join(RESET_DATA_KEY).exists());
        assert_eq!(queue.limiter.retries("pod/ai/train-0"), 0);
    }

    #[tokio::test]
    async fn test_queue_drops_after_retry_limit() {
        let (dir, source, handler) = setup();
        source.failures.store(u32::MAX, Ordering::SeqCst);

        let config = MirrorConfig {
            root: dir.path().to_path_buf(),
            retry_limit: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let mut queue = WorkQueue::new(handler, &config);
        queue
            .process(MirrorItem::Pod { op: EventOp::Add, pod: pod(Some("train")) })
            .await;
        let retried = queue.rx.recv().await.unwrap();
        queue.process(retried).await;

        // Dropped: nothing else arrives
        let next = tokio::time::timeout(Duration::from_millis(50), queue.rx.recv()).await;
        assert!(next.is_err());
        assert_eq!(queue.limiter.retries("pod/ai/train-0"), 0);
    }

    #[test]
    fn test_restarted_pods_emits_deletes_for_vanished() {
        let mut known = HashMap::new();
        let mut gone = pod(Some("old"));
        gone.uid = "uid-gone".to_string();
        known.insert(gone.uid.clone(), gone);

        let listed = Pod {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("train-0".to_string()),
                namespace: Some("ai".to_string()),
                uid: Some("uid-0".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let items = restarted_pods(&mut known, &[listed.clone()]);
        let ops: Vec<EventOp> = items
            .iter()
            .map(|i| match i {
                MirrorItem::Pod { op, .. } => *op,
                MirrorItem::ConfigMap { op, .. } => *op,
            })
            .collect();
        assert_eq!(ops, vec![EventOp::Delete, EventOp::Add]);

        let again = restarted_pods(&mut known, &[listed]);
        assert!(matches!(again[0], MirrorItem::Pod { op: EventOp::Update, .. }));
    }
}
