//! Recovery Orchestrator
//!
//! Drives one recovery episode per fault-affected task:
//!
//! ```text
//! Idle -> PreProcess -> RestartRequest | Restart | Reset path -> PostProcess -> Idle
//!                                \______________|_____________/
//!                                               v
//!                                        IsolateTerminal
//! ```
//!
//! The scan loop owns a [`HotResetManager`] and calls
//! [`HotResetManager::grace_tolerance`] once per cycle. Each episode runs on
//! its own worker; its outcome is only visible through the ledger.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::bookkeeping::{BookkeepingError, PodInfo, RecoverStatus, TaskBookkeeping, TaskDeviceInfo};
use crate::device::{DeviceError, DeviceInterface, Health, NpuDevice};
use crate::executor::{ExecutorConfig, ExecutorError, ResetExecutor};
use crate::fault_cache::{CacheError, DeviceFaultInfo, FaultCache};
use crate::ledger::{ClusterClient, LedgerError, ResetRecorder, TaskLedger, TaskLedgerConfig};
use crate::metrics::MetricsRegistry;
use crate::policy::{max_policy, FaultCodeTable, FaultType, PolicyLevel};
use crate::ring::{need_block_all_devices, RingTopology, WorkMode};

/// Hot-reset engine settings
#[derive(Debug, Clone)]
pub struct HotResetConfig {
    pub work_mode: WorkMode,
    pub board_id: u32,
    /// Sleep between polls of device state
    pub poll_interval: Duration,
    /// How long a restart-request fault may take to clear itself
    pub restart_request_wait: Duration,
    /// Self-healing grace after the workload restarted
    pub restart_grace: Duration,
    /// Budget for in-flight processes to exit before a reset
    pub process_wait: Duration,
    pub reset_retry: u32,
    pub reset_backoff: Duration,
    pub boot_max_polls: u32,
    pub network_max_polls: u32,
    /// Device warm-up before a successful reset is reported
    pub warm_up: Duration,
    /// Delay after ledger writes
    pub propagation: Duration,
    /// Failed recoveries tolerated before manual intervention
    pub max_reset_times: u32,
}

impl Default for HotResetConfig {
    fn default() -> Self {
        Self {
            work_mode: WorkMode::Training,
            board_id: 0,
            poll_interval: Duration::from_secs(1),
            restart_request_wait: Duration::from_secs(60),
            restart_grace: Duration::from_secs(30),
            process_wait: Duration::from_secs(150),
            reset_retry: 3,
            reset_backoff: Duration::from_secs(10),
            boot_max_polls: 120,
            network_max_polls: 60,
            warm_up: Duration::from_secs(20),
            propagation: Duration::from_secs(3),
            max_reset_times: 3,
        }
    }
}

impl HotResetConfig {
    fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            poll_interval: self.poll_interval,
            reset_retry: self.reset_retry,
            reset_backoff: self.reset_backoff,
            boot_max_polls: self.boot_max_polls,
            network_max_polls: self.network_max_polls,
            process_wait: self.process_wait,
        }
    }

    fn ledger_config(&self) -> TaskLedgerConfig {
        TaskLedgerConfig {
            warm_up: self.warm_up,
            propagation: self.propagation,
        }
    }
}

#[derive(Debug, Error)]
pub enum HotResetError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Bookkeeping(#[from] BookkeepingError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// One PreProcess -> ladder -> PostProcess cycle of a task
struct Episode {
    task: String,
    /// Token of the task's in-reset marker
    generation: u64,
    pod: PodInfo,
    policy: PolicyLevel,
    /// Fault snapshot taken at PreProcess
    ranks: Vec<TaskDeviceInfo>,
    /// Faulted devices of the task
    devices: Vec<NpuDevice>,
    /// Every device of every ring touched by the fault
    ring_ids: Vec<i32>,
    multi_node: bool,
    retry_time: AtomicU32,
}

impl Episode {
    fn faulty_ids(&self) -> Vec<i32> {
        self.devices.iter().map(|d| d.logic_id).collect()
    }

    fn task_ids(&self) -> Vec<i32> {
        self.ranks.iter().map(TaskDeviceInfo::logic_id).collect()
    }

    fn retries(&self) -> u32 {
        self.retry_time.load(Ordering::SeqCst)
    }
}

struct Inner {
    config: HotResetConfig,
    table: FaultCodeTable,
    topology: RingTopology,
    resource_key: String,
    device: Arc<dyn DeviceInterface>,
    client: Arc<dyn ClusterClient>,
    executor: ResetExecutor,
    recorder: ResetRecorder,
    ledger: TaskLedger,
    cache: Mutex<FaultCache>,
    book: Mutex<TaskBookkeeping>,
    metrics: MetricsRegistry,
}

/// Hot-reset context owned by the scan loop
pub struct HotResetManager {
    inner: Arc<Inner>,
    workers: Mutex<JoinSet<()>>,
}

impl HotResetManager {
    pub fn new(
        device: Arc<dyn DeviceInterface>,
        client: Arc<dyn ClusterClient>,
        config: HotResetConfig,
        table: FaultCodeTable,
        metrics: MetricsRegistry,
    ) -> Self {
        let family = device.hardware_family();
        let topology = RingTopology::for_hardware(family, config.work_mode, config.board_id);
        info!(
            family = %family,
            ring_size = topology.ring_size(),
            mode = ?config.work_mode,
            "Hot reset engine initialized"
        );

        let inner = Inner {
            table,
            topology,
            resource_key: format!("huawei.com/{}", family.device_prefix()),
            executor: ResetExecutor::new(device.clone(), topology, config.executor_config(), metrics),
            recorder: ResetRecorder::new(client.clone(), config.max_reset_times, metrics),
            ledger: TaskLedger::new(client.clone(), config.ledger_config(), metrics),
            cache: Mutex::new(FaultCache::new()),
            book: Mutex::new(TaskBookkeeping::new()),
            device,
            client,
            config,
            metrics,
        };

        Self {
            inner: Arc::new(inner),
            workers: Mutex::new(JoinSet::new()),
        }
    }

    pub fn topology(&self) -> RingTopology {
        self.inner.topology
    }

    /// Per-cycle entry point
    ///
    /// Outcomes are reported through the fault cache, the ledger and the
    /// health fields of `devices`.
    pub async fn grace_tolerance(&self, devices: &mut [NpuDevice]) {
        if let Err(e) = self.scan(devices).await {
            error!(error = %e, "Hot reset scan failed");
        }
    }

    pub async fn fault_info(&self, logic_id: i32) -> Result<DeviceFaultInfo, CacheError> {
        self.inner.cache.lock().await.get(logic_id)
    }

    pub async fn is_task_in_reset(&self, task: &str) -> bool {
        self.inner.book.lock().await.is_task_in_reset(task)
    }

    pub async fn devices_in_reset(&self) -> HashSet<i32> {
        self.inner.book.lock().await.devices_in_reset()
    }

    /// Wait for every in-flight worker to finish
    pub async fn drain_workers(&self) {
        let mut workers = self.workers.lock().await;
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "Recovery worker ended abnormally");
            }
        }
    }

    async fn scan(&self, devices: &mut [NpuDevice]) -> Result<(), HotResetError> {
        let inner = &self.inner;
        inner.recorder.init().await?;
        if let Err(e) = inner.recorder.refresh(devices).await {
            warn!(error = %e, "Reset record housekeeping failed");
        }

        let manual = inner.recorder.manual_phy_ids().await;
        let isolated: HashSet<i32> = devices
            .iter()
            .filter(|d| manual.contains(&d.phy_id))
            .map(|d| d.logic_id)
            .collect();
        inner.cache.lock().await.refresh(devices, &isolated, &inner.table)?;

        let pods = inner.client.list_node_pods().await?;
        self.refresh_tasks(devices, &pods).await?;

        let tasks = inner.book.lock().await.tasks()?;
        for task in tasks {
            if let Err(e) = self.process_task(&task, devices, &isolated).await {
                warn!(task = %task, error = %e, "Skipping task this cycle");
            }
        }

        inner.mark_unhealthy(devices, &isolated).await;
        inner.metrics.set_npu_count(devices.len() as i64);
        Ok(())
    }

    /// Rebuild task bookkeeping from the local pods
    async fn refresh_tasks(&self, devices: &[NpuDevice], pods: &[PodInfo]) -> Result<(), HotResetError> {
        let inner = &self.inner;
        let by_name: HashMap<&str, i32> = devices.iter().map(|d| (d.name.as_str(), d.logic_id)).collect();

        let mut task_devices: HashMap<String, Vec<i32>> = HashMap::new();
        let mut task_faults: HashMap<String, Vec<TaskDeviceInfo>> = HashMap::new();
        let mut task_pods: HashMap<String, PodInfo> = HashMap::new();

        let cache = inner.cache.lock().await;
        for pod in pods {
            let ids: Vec<i32> = pod
                .allocated_devices(&inner.resource_key)
                .iter()
                .filter_map(|name| by_name.get(name.as_str()).copied())
                .collect();
            if ids.is_empty() {
                continue;
            }
            let task = match pod.task_name() {
                Ok(task) => task,
                Err(e) => {
                    debug!(pod = %pod.key(), error = %e, "Ignoring pod");
                    continue;
                }
            };

            let base = pod.rank_index() * ids.len() as u32;
            let mut ranks = Vec::with_capacity(ids.len());
            for (i, id) in ids.iter().enumerate() {
                ranks.push(TaskDeviceInfo::new(base + i as u32, cache.get(*id)?));
            }

            task_devices.entry(task.clone()).or_default().extend(ids);
            task_faults.entry(task.clone()).or_default().extend(ranks);
            task_pods.entry(task).or_insert_with(|| pod.clone());
        }
        drop(cache);

        let active: HashSet<String> = task_devices.keys().cloned().collect();
        let mut book = inner.book.lock().await;
        for task in book.free_task(&active, &task_devices) {
            info!(task = %task, "Released in-reset marker of departed or reassigned task");
        }
        book.set_task_device_list(task_devices);
        book.set_task_fault_info(task_faults);
        book.set_task_pod(task_pods)?;
        Ok(())
    }

    async fn process_task(
        &self,
        task: &str,
        devices: &[NpuDevice],
        isolated: &HashSet<i32>,
    ) -> Result<(), HotResetError> {
        let inner = &self.inner;
        let (ranks, pod) = {
            let book = inner.book.lock().await;
            if book.is_task_in_reset(task) {
                debug!(task, "Task already in reset");
                return Ok(());
            }
            (book.task_fault_info(task)?, book.task_pod(task)?)
        };

        let policy = max_policy(ranks.iter().map(|r| r.fault.policy));
        if !policy.needs_recovery() {
            return Ok(());
        }
        let faulty: Vec<&TaskDeviceInfo> = ranks.iter().filter(|r| r.fault.policy.needs_recovery()).collect();
        if policy == PolicyLevel::Isolate && faulty.iter().all(|r| isolated.contains(&r.logic_id())) {
            debug!(task, "Faulted devices already isolated");
            return Ok(());
        }

        if pod.is_multi_node() {
            let local: HashSet<u32> = ranks.iter().map(|r| r.rank_id).collect();
            let stored = inner.ledger.read(&pod, task).await?;
            if let Some(stored) = stored.filter(|s| s.is_resetting_elsewhere(&local)) {
                let faulty_ranks: Vec<u32> = faulty.iter().map(|r| r.rank_id).collect();
                if stored.ranks_isolated(&faulty_ranks) {
                    debug!(task, "Local ranks already isolated in task record");
                } else if inner.book.lock().await.is_faulty_device_still_in_task(task)? {
                    let local_faulty: Vec<TaskDeviceInfo> = faulty.iter().map(|r| (*r).clone()).collect();
                    self.spawn_isolate_write(pod, task.to_string(), local_faulty).await;
                }
                info!(task, "Task is resetting on another node");
                return Ok(());
            }
        }

        let fault_devices: Vec<NpuDevice> = faulty
            .iter()
            .filter_map(|r| devices.iter().find(|d| d.logic_id == r.logic_id()).cloned())
            .collect();
        let episode = inner
            .pre_process(task, pod, ranks, policy, fault_devices)
            .await?;
        self.spawn_episode(episode).await;
        Ok(())
    }

    async fn spawn_isolate_write(&self, pod: PodInfo, task: String, ranks: Vec<TaskDeviceInfo>) {
        let inner = Arc::clone(&self.inner);
        let mut workers = self.workers.lock().await;
        workers.spawn(async move {
            if let Err(e) = inner.ledger.write_isolate_merged(&pod, &task, &ranks).await {
                warn!(task = %task, error = %e, "Failed to isolate ranks of remotely resetting task");
            }
        });
        reap_finished(&mut workers);
    }

    async fn spawn_episode(&self, episode: Episode) {
        let inner = Arc::clone(&self.inner);
        let mut workers = self.workers.lock().await;
        workers.spawn(async move {
            let episode = Arc::new(episode);
            // The ladder runs on its own task so PostProcess survives a panic in it
            let ladder = tokio::spawn({
                let inner = Arc::clone(&inner);
                let episode = Arc::clone(&episode);
                async move { inner.run_ladder(&episode).await }
            });

            let outcome = match ladder.await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    error!(task = %episode.task, error = %e, "Recovery episode could not be concluded");
                    RecoverStatus::Unrecovered
                }
                Err(e) => {
                    error!(task = %episode.task, error = %e, "Recovery worker aborted");
                    RecoverStatus::Unrecovered
                }
            };

            inner.post_process(&episode).await;
            inner.metrics.inc_episode_finished(outcome);
        });
        reap_finished(&mut workers);
    }
}

fn reap_finished(workers: &mut JoinSet<()>) {
    while let Some(Some(res)) = workers.join_next().now_or_never() {
        if let Err(e) = res {
            warn!(error = %e, "Recovery worker ended abnormally");
        }
    }
}

impl Inner {
    /// Mark the task and its rings, then record the episode as started
    async fn pre_process(
        &self,
        task: &str,
        pod: PodInfo,
        ranks: Vec<TaskDeviceInfo>,
        policy: PolicyLevel,
        devices: Vec<NpuDevice>,
    ) -> Result<Episode, HotResetError> {
        let faulty: Vec<i32> = devices.iter().map(|d| d.logic_id).collect();
        let ring_ids = self.topology.expand(&faulty);

        let generation = {
            let mut book = self.book.lock().await;
            let generation = book.set_task_in_reset(task)?;
            if let Err(e) = book.set_devices_in_reset(&ring_ids) {
                if let Err(unset) = book.unset_task_in_reset(task, generation) {
                    error!(task, error = %unset, "Failed to roll back task marker");
                }
                return Err(e.into());
            }
            generation
        };
        self.recorder.mark_busy(&ring_ids).await;

        if let Err(e) = self
            .ledger
            .update_status_without_wait(&pod, task, &ranks, policy, RecoverStatus::Unrecovered, 0)
            .await
        {
            self.release(task, generation, &ring_ids).await;
            return Err(e.into());
        }

        self.metrics.inc_episode_started(policy);
        info!(task, policy = %policy, devices = ?faulty, ring = ?ring_ids, "Recovery episode started");

        Ok(Episode {
            task: task.to_string(),
            generation,
            multi_node: pod.is_multi_node(),
            pod,
            policy,
            ranks,
            devices,
            ring_ids,
            retry_time: AtomicU32::new(0),
        })
    }

    async fn post_process(&self, ep: &Episode) {
        self.release(&ep.task, ep.generation, &ep.ring_ids).await;
        debug!(task = %ep.task, "Recovery episode released");
    }

    async fn release(&self, task: &str, generation: u64, ring_ids: &[i32]) {
        let mut book = self.book.lock().await;
        if let Err(e) = book.unset_devices_in_reset(ring_ids) {
            error!(task, error = %e, "Device left marked in reset");
        }
        match book.unset_task_in_reset(task, generation) {
            Ok(()) => {}
            Err(e @ BookkeepingError::MarkerSuperseded(_)) => {
                info!(task, error = %e, "Task marker kept for the newer episode");
            }
            Err(e) => warn!(task, error = %e, "Task marker already cleared"),
        }
        drop(book);
        self.recorder.clear_busy(ring_ids).await;
    }

    async fn run_ladder(&self, ep: &Episode) -> Result<RecoverStatus, HotResetError> {
        match ep.policy {
            PolicyLevel::RestartRequest => self.restart_request_path(ep).await,
            PolicyLevel::Restart => self.restart_path(ep).await,
            PolicyLevel::FreeReset | PolicyLevel::Reset => self.reset_path(ep).await,
            PolicyLevel::Isolate => self.isolate_terminal(ep).await,
            PolicyLevel::Empty | PolicyLevel::Ignore => {
                self.finalize(ep, ep.policy, RecoverStatus::Recovered).await
            }
        }
    }

    async fn restart_request_path(&self, ep: &Episode) -> Result<RecoverStatus, HotResetError> {
        let deadline = Instant::now() + self.config.restart_request_wait;
        loop {
            if self.is_healed(ep).await {
                info!(task = %ep.task, "Fault cleared without reset");
                return self.finalize(ep, ep.policy, RecoverStatus::Recovered).await;
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(self.config.poll_interval).await;
        }

        warn!(task = %ep.task, "Fault persisted past wait budget, escalating to reset");
        if let Err(e) = self
            .ledger
            .update_status_without_wait(
                &ep.pod,
                &ep.task,
                &ep.ranks,
                PolicyLevel::Reset,
                RecoverStatus::Unrecovered,
                ep.retries(),
            )
            .await
        {
            warn!(task = %ep.task, error = %e, "Escalation not recorded, resetting anyway");
        }

        match self.reset_cycle(ep).await {
            Ok(()) => self.conclude(ep, PolicyLevel::Reset).await,
            Err(e) => self.fail_recovery(ep, e).await,
        }
    }

    async fn restart_path(&self, ep: &Episode) -> Result<RecoverStatus, HotResetError> {
        if let Err(e) = self.executor.wait_processes_drained(&ep.task_ids()).await {
            return self.fail_recovery(ep, e).await;
        }
        sleep(self.config.restart_grace).await;

        if self.is_healed(ep).await {
            info!(task = %ep.task, "Fault cleared after restart");
            return self.finalize(ep, ep.policy, RecoverStatus::Recovered).await;
        }

        warn!(task = %ep.task, "Fault persisted after restart, escalating to reset");
        if let Err(e) = self
            .ledger
            .update_status(
                &ep.pod,
                &ep.task,
                &ep.ranks,
                PolicyLevel::Reset,
                RecoverStatus::Unrecovered,
                ep.retries(),
            )
            .await
        {
            warn!(task = %ep.task, error = %e, "Escalation not recorded, resetting anyway");
        }

        match self.reset_cycle(ep).await {
            Ok(()) => self.conclude(ep, PolicyLevel::Reset).await,
            Err(e) => self.fail_recovery(ep, e).await,
        }
    }

    async fn reset_path(&self, ep: &Episode) -> Result<RecoverStatus, HotResetError> {
        match self.reset_cycle(ep).await {
            Ok(()) => self.conclude(ep, ep.policy).await,
            Err(e) => self.fail_recovery(ep, e).await,
        }
    }

    /// Drain the task, then reset each faulted ring once
    async fn reset_cycle(&self, ep: &Episode) -> Result<(), ExecutorError> {
        self.executor.wait_processes_drained(&ep.task_ids()).await?;
        ep.retry_time.fetch_add(1, Ordering::SeqCst);

        let mut rings = BTreeSet::new();
        for device in &ep.devices {
            if rings.insert(self.topology.ring_start(device.logic_id)) {
                info!(task = %ep.task, device = %device, "Resetting ring");
                self.executor.reset_ring(device, ep.multi_node).await?;
            }
        }
        Ok(())
    }

    /// Finalize on the device state observed now
    async fn conclude(&self, ep: &Episode, policy: PolicyLevel) -> Result<RecoverStatus, HotResetError> {
        if self.is_healed(ep).await {
            self.finalize(ep, policy, RecoverStatus::Recovered).await
        } else {
            warn!(task = %ep.task, "Fault remains after reset");
            self.isolate_terminal(ep).await
        }
    }

    async fn fail_recovery(&self, ep: &Episode, err: ExecutorError) -> Result<RecoverStatus, HotResetError> {
        warn!(task = %ep.task, error = %err, reset_attempted = err.reset_attempted(), "Recovery failed");
        self.isolate_terminal(ep).await
    }

    /// Record the devices as failed and leave them for remediation
    async fn isolate_terminal(&self, ep: &Episode) -> Result<RecoverStatus, HotResetError> {
        let status = self
            .finalize(ep, PolicyLevel::Isolate, RecoverStatus::RecoverFailed)
            .await?;

        let recorded = if ep.policy == PolicyLevel::Isolate {
            self.recorder.record_manual(&ep.devices).await
        } else {
            self.recorder.record_reset_failure(&ep.devices).await
        };
        if let Err(e) = recorded {
            warn!(task = %ep.task, error = %e, "Failed to record isolated devices");
        }
        Ok(status)
    }

    async fn finalize(
        &self,
        ep: &Episode,
        policy: PolicyLevel,
        status: RecoverStatus,
    ) -> Result<RecoverStatus, HotResetError> {
        self.ledger
            .update_status(&ep.pod, &ep.task, &ep.ranks, policy, status, ep.retries())
            .await?;

        if status == RecoverStatus::Recovered {
            let mut cache = self.cache.lock().await;
            for id in ep.faulty_ids() {
                cache.reset(id);
            }
            drop(cache);
            if let Err(e) = self.recorder.clear_failures(&ep.devices).await {
                warn!(task = %ep.task, error = %e, "Failed to clear failure record");
            }
        }

        info!(task = %ep.task, policy = %policy, status = ?status, "Recovery episode finished");
        Ok(status)
    }

    async fn is_healed(&self, ep: &Episode) -> bool {
        match self.current_policy(&ep.faulty_ids()).await {
            Ok(policy) => !policy.needs_recovery(),
            Err(e) => {
                debug!(task = %ep.task, error = %e, "Fault state unknown");
                false
            }
        }
    }

    async fn current_policy(&self, ids: &[i32]) -> Result<PolicyLevel, DeviceError> {
        let mut levels = Vec::with_capacity(ids.len());
        for id in ids {
            let codes = self.device.error_codes(*id).await?;
            levels.push(self.table.policy_for_codes(&codes));
        }
        Ok(max_policy(levels))
    }

    /// Report in-reset rings, isolated devices and blocked nodes unhealthy
    async fn mark_unhealthy(&self, devices: &mut [NpuDevice], isolated: &HashSet<i32>) {
        let in_reset = self.book.lock().await.devices_in_reset();
        let faults: Vec<FaultType> = devices
            .iter()
            .flat_map(|d| d.error_codes.iter().map(|c| self.table.classify(*c)))
            .collect();
        let block_all = need_block_all_devices(self.config.work_mode, self.config.board_id, &faults);
        if block_all {
            warn!(board_id = self.config.board_id, "Fault blocks every device on the node");
        }

        for device in devices.iter_mut() {
            if block_all || in_reset.contains(&device.logic_id) || isolated.contains(&device.logic_id) {
                device.health = Health::Unhealthy;
            }
        }
        self.metrics.set_devices_in_reset(in_reset.len() as i64);
    }
}
