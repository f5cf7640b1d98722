//! Protocol data types carried inside messages and checkpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use skiff_id::{ExecutorId, FrameworkId, OfferId, SlaveId, TaskId, UpdateId};
use skiff_resources::Resources;

/// Static `key=value` labels advertised by a slave.
pub type Attributes = BTreeMap<String, String>;

/// The lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "TASK_STAGING")]
    Staging,
    #[serde(rename = "TASK_STARTING")]
    Starting,
    #[serde(rename = "TASK_RUNNING")]
    Running,
    #[serde(rename = "TASK_FINISHED")]
    Finished,
    #[serde(rename = "TASK_FAILED")]
    Failed,
    #[serde(rename = "TASK_KILLED")]
    Killed,
    #[serde(rename = "TASK_LOST")]
    Lost,
}

impl TaskState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Killed | TaskState::Lost
        )
    }

    /// All states, in declaration order. Used for statistics tables.
    pub const ALL: [TaskState; 7] = [
        TaskState::Staging,
        TaskState::Starting,
        TaskState::Running,
        TaskState::Finished,
        TaskState::Failed,
        TaskState::Killed,
        TaskState::Lost,
    ];
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Staging => "TASK_STAGING",
            TaskState::Starting => "TASK_STARTING",
            TaskState::Running => "TASK_RUNNING",
            TaskState::Finished => "TASK_FINISHED",
            TaskState::Failed => "TASK_FAILED",
            TaskState::Killed => "TASK_KILLED",
            TaskState::Lost => "TASK_LOST",
        };
        write!(f, "{}", s)
    }
}

/// A command to run inside an executor sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub value: String,
}

impl CommandInfo {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// Describes an executor a framework wants launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    /// Filled in by the agent before launch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework_id: Option<FrameworkId>,
    pub command: CommandInfo,
    pub resources: Resources,
}

/// Describes a task a framework wants run.
///
/// A task either names an explicit executor or carries a bare command,
/// in which case the agent synthesises a command-executor shim keyed by
/// the task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub resources: Resources,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

/// Describes a framework to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub name: String,
    pub user: String,
    /// Opt-in to durable logging of this framework's executors and
    /// status-update streams. Authoritative over the agent-wide flag.
    #[serde(default)]
    pub checkpoint: bool,
}

/// Describes the slave to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveInfo {
    pub hostname: String,
    pub resources: Resources,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub checkpoint: bool,
}

/// The observed state of one task at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

/// A status update travelling from an executor towards its framework.
///
/// `update_id` is the 128-bit acknowledgement key; within one
/// (framework, task) stream updates are delivered strictly in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub framework_id: FrameworkId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave_id: Option<SlaveId>,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub update_id: UpdateId,
}

impl StatusUpdate {
    /// Builds an update stamped with the current time and a fresh id.
    pub fn new(
        framework_id: FrameworkId,
        executor_id: Option<ExecutorId>,
        slave_id: Option<SlaveId>,
        status: TaskStatus,
    ) -> Self {
        Self {
            framework_id,
            executor_id,
            slave_id,
            status,
            timestamp: Utc::now(),
            update_id: UpdateId::new(),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.status.task_id
    }
}

/// A launched task as tracked by the agent and reported to the master
/// on re-registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub name: String,
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave_id: Option<SlaveId>,
    pub state: TaskState,
    pub resources: Resources,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_status: Option<TaskStatus>,
}

impl Task {
    /// Builds the tracking record for an accepted task.
    pub fn from_info(
        info: &TaskInfo,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        slave_id: Option<SlaveId>,
    ) -> Self {
        Self {
            task_id: info.task_id.clone(),
            name: info.name.clone(),
            framework_id,
            executor_id,
            slave_id,
            state: TaskState::Staging,
            resources: info.resources.clone(),
            latest_status: None,
        }
    }
}

/// A resource offer produced by the allocator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub offer_id: OfferId,
    pub framework_id: FrameworkId,
    pub slave_id: SlaveId,
    pub resources: Resources,
}

/// A usage sample for one executor, as reported by the isolator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatistics {
    pub timestamp: DateTime<Utc>,
    pub cpus_user_time_secs: f64,
    pub cpus_system_time_secs: f64,
    pub mem_rss_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_terminal() {
        assert!(!TaskState::Staging.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Finished.is_terminal());
        assert!(TaskState::Lost.is_terminal());
    }

    #[test]
    fn test_status_update_json_roundtrip() {
        let update = StatusUpdate::new(
            FrameworkId::new(),
            Some("exec-1".parse().unwrap()),
            Some(SlaveId::new()),
            TaskStatus {
                task_id: "task-1".parse().unwrap(),
                state: TaskState::Running,
                message: None,
                data: None,
            },
        );

        let json = serde_json::to_string(&update).unwrap();
        let back: StatusUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
        assert!(json.contains("TASK_RUNNING"));
    }

    #[test]
    fn test_task_from_info() {
        let info = TaskInfo {
            task_id: "t1".parse().unwrap(),
            name: "t1".to_string(),
            resources: Resources::parse("cpus:1").unwrap(),
            executor: None,
            command: Some(CommandInfo::new("sleep 1")),
            data: None,
        };

        let task = Task::from_info(&info, FrameworkId::new(), "e1".parse().unwrap(), None);
        assert_eq!(task.state, TaskState::Staging);
        assert_eq!(task.resources, info.resources);
        assert!(task.latest_status.is_none());
    }
}
