//! Task/Device Bookkeeping
//!
//! Maps workload tasks to their devices, fault snapshots and owning pods, and
//! holds the in-reset markers that make double entry into recovery
//! impossible. Two one-directional indexes (task -> devices, device -> pod)
//! are maintained together; nothing holds back-pointers.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::error_code_hex;
use crate::fault_cache::DeviceFaultInfo;
use crate::policy::PolicyLevel;

/// Task name annotation / label
pub const TASK_NAME_KEY: &str = "volcano.sh/job-name";
/// Rank index of the pod within its task
pub const RANK_INDEX_ANNOTATION: &str = "hccl/rankIndex";
/// Number of servers the task spans
pub const SERVER_COUNT_ANNOTATION: &str = "huawei.com/server-count";

/// Pod fields the engine needs, decoupled from the cluster client types
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl PodInfo {
    /// Owning task name, from the annotation first, then the label
    pub fn task_name(&self) -> Result<String, BookkeepingError> {
        self.annotations
            .get(TASK_NAME_KEY)
            .or_else(|| self.labels.get(TASK_NAME_KEY))
            .filter(|s| !s.is_empty())
            .cloned()
            .ok_or_else(|| BookkeepingError::MissingTaskName(self.key()))
    }

    /// Device names allocated to the pod under `resource_key`
    pub fn allocated_devices(&self, resource_key: &str) -> Vec<String> {
        self.annotations
            .get(resource_key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn rank_index(&self) -> u32 {
        self.annotations
            .get(RANK_INDEX_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Whether the task spans more than this node
    pub fn is_multi_node(&self) -> bool {
        self.annotations
            .get(SERVER_COUNT_ANNOTATION)
            .and_then(|v| v.parse::<u32>().ok())
            .map_or(false, |n| n > 1)
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Recovery status of one rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RecoverStatus {
    #[default]
    Unrecovered,
    Recovered,
    RecoverFailed,
}

/// Snapshot of one rank of a fault-affected task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskDeviceInfo {
    pub rank_id: u32,
    #[serde(flatten)]
    pub fault: DeviceFaultInfo,
    pub initial_policy: PolicyLevel,
    pub status: RecoverStatus,
    pub error_code_hex: String,
}

impl TaskDeviceInfo {
    pub fn new(rank_id: u32, fault: DeviceFaultInfo) -> Self {
        Self {
            rank_id,
            initial_policy: fault.policy,
            status: RecoverStatus::Unrecovered,
            error_code_hex: error_code_hex(&fault.error_codes),
            fault,
        }
    }

    pub fn logic_id(&self) -> i32 {
        self.fault.logic_id
    }

    /// Copy of this rank with a new policy and status
    pub fn with_outcome(&self, policy: PolicyLevel, status: RecoverStatus) -> Self {
        let mut next = self.clone();
        next.fault.policy = policy;
        next.status = status;
        next
    }
}

#[derive(Debug, Error)]
pub enum BookkeepingError {
    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    #[error("Task {0} is already in reset")]
    TaskAlreadyInReset(String),

    #[error("Task {0} is not in reset")]
    TaskNotInReset(String),

    #[error("Task {0} is in reset under a newer episode")]
    MarkerSuperseded(String),

    #[error("Device {0} is already in reset")]
    DeviceAlreadyInReset(i32),

    #[error("Device {0} is not in reset")]
    DeviceNotInReset(i32),

    #[error("Task {0} not found")]
    TaskNotFound(String),

    #[error("Pod {0} has neither a task name annotation nor label")]
    MissingTaskName(String),
}

fn join_ids(ids: &[i32]) -> String {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// In-reset marker of one episode
#[derive(Debug, Clone)]
struct ResetMarker {
    /// Joined device ids at the start of the episode
    devices: String,
    generation: u64,
}

/// Task and device bookkeeping; the caller serializes access
#[derive(Debug, Default)]
pub struct TaskBookkeeping {
    task_devices: Option<HashMap<String, Vec<i32>>>,
    task_fault_info: Option<HashMap<String, Vec<TaskDeviceInfo>>>,
    task_pods: Option<HashMap<String, PodInfo>>,
    device_pods: HashMap<i32, PodInfo>,
    tasks_in_reset: HashMap<String, ResetMarker>,
    devices_in_reset: HashSet<i32>,
    generation: u64,
}

impl TaskBookkeeping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_task_device_list(&mut self, devices: HashMap<String, Vec<i32>>) {
        self.task_devices = Some(devices);
    }

    pub fn set_task_fault_info(&mut self, info: HashMap<String, Vec<TaskDeviceInfo>>) {
        self.task_fault_info = Some(info);
    }

    /// Replace task -> pod and rebuild the device -> pod index with it
    pub fn set_task_pod(&mut self, pods: HashMap<String, PodInfo>) -> Result<(), BookkeepingError> {
        let task_devices = self
            .task_devices
            .as_ref()
            .ok_or(BookkeepingError::NotInitialized("task device list"))?;

        let mut device_pods = HashMap::new();
        for (task, pod) in &pods {
            for id in task_devices.get(task).into_iter().flatten() {
                device_pods.insert(*id, pod.clone());
            }
        }

        self.device_pods = device_pods;
        self.task_pods = Some(pods);
        Ok(())
    }

    pub fn task_device_list(&self, task: &str) -> Result<Vec<i32>, BookkeepingError> {
        self.task_devices
            .as_ref()
            .ok_or(BookkeepingError::NotInitialized("task device list"))?
            .get(task)
            .cloned()
            .ok_or_else(|| BookkeepingError::TaskNotFound(task.to_string()))
    }

    pub fn task_fault_info(&self, task: &str) -> Result<Vec<TaskDeviceInfo>, BookkeepingError> {
        self.task_fault_info
            .as_ref()
            .ok_or(BookkeepingError::NotInitialized("task fault info"))?
            .get(task)
            .cloned()
            .ok_or_else(|| BookkeepingError::TaskNotFound(task.to_string()))
    }

    pub fn task_pod(&self, task: &str) -> Result<PodInfo, BookkeepingError> {
        self.task_pods
            .as_ref()
            .ok_or(BookkeepingError::NotInitialized("task pod"))?
            .get(task)
            .cloned()
            .ok_or_else(|| BookkeepingError::TaskNotFound(task.to_string()))
    }

    /// Names of all tasks with fault info this cycle, sorted
    pub fn tasks(&self) -> Result<Vec<String>, BookkeepingError> {
        let mut names: Vec<String> = self
            .task_fault_info
            .as_ref()
            .ok_or(BookkeepingError::NotInitialized("task fault info"))?
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    /// Drop in-reset markers of tasks that left or whose devices changed
    ///
    /// Device markers stay with the episode that set them. Returns the names
    /// of freed tasks.
    pub fn free_task(
        &mut self,
        active: &HashSet<String>,
        assignment: &HashMap<String, Vec<i32>>,
    ) -> Vec<String> {
        let freed: Vec<String> = self
            .tasks_in_reset
            .iter()
            .filter(|(task, marker)| {
                !active.contains(*task)
                    || assignment
                        .get(*task)
                        .map_or(true, |ids| join_ids(ids) != marker.devices)
            })
            .map(|(task, _)| task.clone())
            .collect();

        for task in &freed {
            self.tasks_in_reset.remove(task);
        }
        freed
    }

    /// Mark the task in reset, returning the episode generation
    pub fn set_task_in_reset(&mut self, task: &str) -> Result<u64, BookkeepingError> {
        if self.tasks_in_reset.contains_key(task) {
            return Err(BookkeepingError::TaskAlreadyInReset(task.to_string()));
        }
        let devices = join_ids(&self.task_device_list(task)?);
        self.generation += 1;
        self.tasks_in_reset.insert(
            task.to_string(),
            ResetMarker {
                devices,
                generation: self.generation,
            },
        );
        Ok(self.generation)
    }

    /// Clear the marker set by episode `generation`
    ///
    /// A marker set by a later episode of the same task is left in place.
    pub fn unset_task_in_reset(&mut self, task: &str, generation: u64) -> Result<(), BookkeepingError> {
        match self.tasks_in_reset.get(task) {
            None => Err(BookkeepingError::TaskNotInReset(task.to_string())),
            Some(marker) if marker.generation != generation => {
                Err(BookkeepingError::MarkerSuperseded(task.to_string()))
            }
            Some(_) => {
                self.tasks_in_reset.remove(task);
                Ok(())
            }
        }
    }

    pub fn is_task_in_reset(&self, task: &str) -> bool {
        self.tasks_in_reset.contains_key(task)
    }

    pub fn set_device_in_reset(&mut self, logic_id: i32) -> Result<(), BookkeepingError> {
        if !self.devices_in_reset.insert(logic_id) {
            return Err(BookkeepingError::DeviceAlreadyInReset(logic_id));
        }
        Ok(())
    }

    pub fn unset_device_in_reset(&mut self, logic_id: i32) -> Result<(), BookkeepingError> {
        if !self.devices_in_reset.remove(&logic_id) {
            return Err(BookkeepingError::DeviceNotInReset(logic_id));
        }
        Ok(())
    }

    /// Mark every device; nothing is marked if any one is already set
    pub fn set_devices_in_reset(&mut self, ids: &[i32]) -> Result<(), BookkeepingError> {
        if let Some(id) = ids.iter().find(|id| self.devices_in_reset.contains(id)) {
            return Err(BookkeepingError::DeviceAlreadyInReset(*id));
        }
        self.devices_in_reset.extend(ids.iter().copied());
        Ok(())
    }

    /// Unmark every device, reporting the first absent one
    pub fn unset_devices_in_reset(&mut self, ids: &[i32]) -> Result<(), BookkeepingError> {
        let mut first_err = None;
        for id in ids {
            if let Err(e) = self.unset_device_in_reset(*id) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Bulk variants over a rank list
    pub fn set_all_devices_in_reset(&mut self, ranks: &[TaskDeviceInfo]) -> Result<(), BookkeepingError> {
        let ids: Vec<i32> = ranks.iter().map(TaskDeviceInfo::logic_id).collect();
        self.set_devices_in_reset(&ids)
    }

    pub fn unset_all_devices_in_reset(&mut self, ranks: &[TaskDeviceInfo]) -> Result<(), BookkeepingError> {
        let ids: Vec<i32> = ranks.iter().map(TaskDeviceInfo::logic_id).collect();
        self.unset_devices_in_reset(&ids)
    }

    pub fn is_device_in_reset(&self, logic_id: i32) -> bool {
        self.devices_in_reset.contains(&logic_id)
    }

    pub fn devices_in_reset(&self) -> HashSet<i32> {
        self.devices_in_reset.clone()
    }

    /// Whether any faulted device of the task is still bound to a pod of it
    pub fn is_faulty_device_still_in_task(&self, task: &str) -> Result<bool, BookkeepingError> {
        for rank in self.task_fault_info(task)? {
            if !rank.fault.policy.needs_recovery() {
                continue;
            }
            if let Some(pod) = self.device_pods.get(&rank.logic_id()) {
                if pod.task_name()? == task {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(task: Option<&str>, via_label: bool) -> PodInfo {
        let mut pod = PodInfo {
            namespace: "default".to_string(),
            name: "train-0".to_string(),
            uid: "uid-0".to_string(),
            ..Default::default()
        };
        if let Some(t) = task {
            if via_label {
                pod.labels.insert(TASK_NAME_KEY.to_string(), t.to_string());
            } else {
                pod.annotations.insert(TASK_NAME_KEY.to_string(), t.to_string());
            }
        }
        pod
    }

    fn book_with_task(task: &str, ids: Vec<i32>, policy: PolicyLevel) -> TaskBookkeeping {
        let mut book = TaskBookkeeping::new();
        let ranks: Vec<TaskDeviceInfo> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut fault = DeviceFaultInfo::empty(*id);
                fault.policy = policy;
                TaskDeviceInfo::new(i as u32, fault)
            })
            .collect();
        book.set_task_device_list([(task.to_string(), ids)].into_iter().collect());
        book.set_task_fault_info([(task.to_string(), ranks)].into_iter().collect());
        book.set_task_pod([(task.to_string(), pod(Some(task), false))].into_iter().collect())
            .unwrap();
        book
    }

    #[test]
    fn test_task_name_from_annotation_or_label() {
        assert_eq!(pod(Some("job-a"), false).task_name().unwrap(), "job-a");
        assert_eq!(pod(Some("job-b"), true).task_name().unwrap(), "job-b");
        assert!(matches!(
            pod(None, false).task_name(),
            Err(BookkeepingError::MissingTaskName(_))
        ));
    }

    #[test]
    fn test_pod_annotations() {
        let mut p = pod(Some("job"), false);
        p.annotations
            .insert("huawei.com/Ascend910".to_string(), "Ascend910-0, Ascend910-1".to_string());
        p.annotations
            .insert(RANK_INDEX_ANNOTATION.to_string(), "3".to_string());
        p.annotations
            .insert(SERVER_COUNT_ANNOTATION.to_string(), "2".to_string());

        assert_eq!(
            p.allocated_devices("huawei.com/Ascend910"),
            vec!["Ascend910-0", "Ascend910-1"]
        );
        assert_eq!(p.rank_index(), 3);
        assert!(p.is_multi_node());
        assert!(!pod(Some("job"), false).is_multi_node());
    }

    #[test]
    fn test_uninitialized_maps_are_errors() {
        let mut book = TaskBookkeeping::new();
        assert!(matches!(
            book.task_fault_info("t"),
            Err(BookkeepingError::NotInitialized(_))
        ));
        assert!(matches!(
            book.set_task_pod(HashMap::new()),
            Err(BookkeepingError::NotInitialized(_))
        ));
        assert!(matches!(
            book.set_task_in_reset("t"),
            Err(BookkeepingError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_task_in_reset_is_idempotency_guard() {
        let mut book = book_with_task("job", vec![0, 1], PolicyLevel::Reset);

        let generation = book.set_task_in_reset("job").unwrap();
        assert!(matches!(
            book.set_task_in_reset("job"),
            Err(BookkeepingError::TaskAlreadyInReset(_))
        ));

        book.unset_task_in_reset("job", generation).unwrap();
        assert!(!book.is_task_in_reset("job"));
        assert!(matches!(
            book.unset_task_in_reset("job", generation),
            Err(BookkeepingError::TaskNotInReset(_))
        ));
    }

    #[test]
    fn test_device_markers() {
        let mut book = TaskBookkeeping::new();
        book.set_devices_in_reset(&[0, 1, 2, 3]).unwrap();
        assert!(book.is_device_in_reset(2));

        // All-or-nothing on conflict
        assert!(book.set_devices_in_reset(&[4, 3]).is_err());
        assert!(!book.is_device_in_reset(4));

        assert!(matches!(
            book.unset_devices_in_reset(&[0, 1, 9]),
            Err(BookkeepingError::DeviceNotInReset(9))
        ));
        assert_eq!(book.devices_in_reset(), [2, 3].into_iter().collect());
    }

    #[test]
    fn test_free_task() {
        let mut book = book_with_task("job", vec![0, 1], PolicyLevel::Reset);
        book.set_task_in_reset("job").unwrap();

        let active: HashSet<String> = ["job".to_string()].into_iter().collect();
        let same: HashMap<String, Vec<i32>> = [("job".to_string(), vec![1, 0])].into_iter().collect();
        assert!(book.free_task(&active, &same).is_empty());
        assert!(book.is_task_in_reset("job"));

        let changed: HashMap<String, Vec<i32>> = [("job".to_string(), vec![0, 2])].into_iter().collect();
        assert_eq!(book.free_task(&active, &changed), vec!["job".to_string()]);
        assert!(!book.is_task_in_reset("job"));

        book.set_task_in_reset("job").unwrap();
        assert_eq!(book.free_task(&HashSet::new(), &same), vec!["job".to_string()]);
    }

    #[test]
    fn test_freed_episode_cannot_clear_successor_marker() {
        let mut book = book_with_task("job", vec![0, 1], PolicyLevel::Reset);
        let first = book.set_task_in_reset("job").unwrap();
        book.set_devices_in_reset(&[0, 1, 2, 3]).unwrap();

        // Reassigned mid-episode
        let active: HashSet<String> = ["job".to_string()].into_iter().collect();
        let moved: HashMap<String, Vec<i32>> = [("job".to_string(), vec![4, 5])].into_iter().collect();
        book.set_task_device_list(moved.clone());
        assert_eq!(book.free_task(&active, &moved), vec!["job".to_string()]);
        assert_eq!(book.devices_in_reset(), (0..4).collect());

        let second = book.set_task_in_reset("job").unwrap();
        assert_ne!(first, second);

        assert!(matches!(
            book.unset_task_in_reset("job", first),
            Err(BookkeepingError::MarkerSuperseded(_))
        ));
        assert!(book.is_task_in_reset("job"));

        book.unset_task_in_reset("job", second).unwrap();
        assert!(!book.is_task_in_reset("job"));
    }

    #[test]
    fn test_faulty_device_still_in_task() {
        let book = book_with_task("job", vec![0, 1], PolicyLevel::Reset);
        assert!(book.is_faulty_device_still_in_task("job").unwrap());

        let healthy = book_with_task("job", vec![0, 1], PolicyLevel::Ignore);
        assert!(!healthy.is_faulty_device_still_in_task("job").unwrap());

        let mut nameless = book_with_task("job", vec![0], PolicyLevel::Reset);
        nameless
            .set_task_pod([("job".to_string(), pod(None, false))].into_iter().collect())
            .unwrap();
        assert!(nameless.is_faulty_device_still_in_task("job").is_err());
    }

    #[test]
    fn test_task_device_info_serialization() {
        let mut fault = DeviceFaultInfo::empty(3);
        fault.error_codes = vec![0x8C084E00];
        fault.policy = PolicyLevel::Reset;
        let rank = TaskDeviceInfo::new(11, fault);

        let json = serde_json::to_value(&rank).unwrap();
        assert_eq!(json["RankId"], 11);
        assert_eq!(json["LogicId"], 3);
        assert_eq!(json["Policy"], "ResetError");
        assert_eq!(json["InitialPolicy"], "ResetError");
        assert_eq!(json["Status"], "Unrecovered");
        assert_eq!(json["ErrorCodeHex"], "0x8C084E00");

        let back: TaskDeviceInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, rank);
    }
}
