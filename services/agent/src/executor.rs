//! The lifecycle record of one executor incarnation and the tasks it
//! hosts.
//!
//! ## State Machine
//!
//! ```text
//!                 register/reregister              shutdown/kill
//! REGISTERING ───────────────────────▶ RUNNING ───────────────▶ TERMINATING
//!      │                                  │                          │
//!      │ registration timeout             │ exit                     │ exit
//!      ▼                                  ▼                          ▼
//! TERMINATING (forced)               TERMINATED                TERMINATED
//! ```
//!
//! A task id lives in exactly one of the four task tables: queued
//! (accepted, executor not yet running), launched (handed to the
//! executor), terminated (terminal status seen, acknowledgement
//! pending), completed (terminal status acknowledged, bounded history).
//! `resources` is always the sum over queued and launched tasks.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use tracing::warn;

use skiff_id::{ExecutorId, FrameworkId, RunId, SlaveId, TaskId};
use skiff_messages::{Endpoint, ExecutorInfo, Task, TaskInfo, TaskState, TaskStatus};
use skiff_resources::Resources;

use crate::checkpoint::{self, CheckpointError, Record};
use crate::config::MAX_COMPLETED_TASKS_PER_EXECUTOR;
use crate::isolator::ContainerId;
use crate::paths;
use crate::state::TaskRunState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Launched but not (re-)registered yet.
    Registering,
    /// Has (re-)registered.
    Running,
    /// Being shut down or killed.
    Terminating,
    /// Process has exited; there may still be unacknowledged updates.
    Terminated,
}

/// One executor incarnation, exclusively owned by its framework record.
pub struct ExecutorRecord {
    pub id: ExecutorId,
    pub framework_id: FrameworkId,
    /// Distinguishes incarnations of the same executor id.
    pub run_id: RunId,
    pub info: ExecutorInfo,
    /// Sandbox directory of this run.
    pub directory: PathBuf,
    pub checkpoint: bool,
    /// True when rebuilt from checkpoints rather than launched.
    pub recovered: bool,
    pub state: ExecutorState,
    /// Where the executor speaks from, once registered.
    pub endpoint: Option<Endpoint>,
    pub os_pid: Option<u32>,
    /// Sum of resources across queued and launched tasks.
    pub resources: Resources,
    pub queued_tasks: HashMap<TaskId, TaskInfo>,
    pub launched_tasks: HashMap<TaskId, Task>,
    pub terminated_tasks: HashMap<TaskId, Task>,
    pub completed_tasks: VecDeque<Task>,
}

impl ExecutorRecord {
    pub fn new(
        framework_id: FrameworkId,
        info: ExecutorInfo,
        run_id: RunId,
        directory: PathBuf,
        checkpoint: bool,
    ) -> Self {
        Self {
            id: info.executor_id.clone(),
            framework_id,
            run_id,
            info,
            directory,
            checkpoint,
            recovered: false,
            state: ExecutorState::Registering,
            endpoint: None,
            os_pid: None,
            resources: Resources::empty(),
            queued_tasks: HashMap::new(),
            launched_tasks: HashMap::new(),
            terminated_tasks: HashMap::new(),
            completed_tasks: VecDeque::new(),
        }
    }

    pub fn container_id(&self) -> ContainerId {
        ContainerId {
            framework_id: self.framework_id.clone(),
            executor_id: self.id.clone(),
            run_id: self.run_id,
        }
    }

    /// Accepts a task while the executor is not yet running.
    pub fn add_task(&mut self, task: TaskInfo) {
        self.resources += &task.resources;
        self.queued_tasks.insert(task.task_id.clone(), task);
    }

    /// Moves every queued task to launched, returning the infos to send.
    pub fn flush_queued(&mut self, slave_id: Option<SlaveId>) -> Vec<TaskInfo> {
        let mut infos: Vec<TaskInfo> = self.queued_tasks.drain().map(|(_, info)| info).collect();
        infos.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        for info in &infos {
            let task = Task::from_info(info, self.framework_id.clone(), self.id.clone(), slave_id);
            self.launched_tasks.insert(task.task_id.clone(), task);
        }
        infos
    }

    /// Records a task handed directly to a running executor.
    pub fn launch_task(&mut self, info: &TaskInfo, slave_id: Option<SlaveId>) {
        self.resources += &info.resources;
        let task = Task::from_info(info, self.framework_id.clone(), self.id.clone(), slave_id);
        self.launched_tasks.insert(task.task_id.clone(), task);
    }

    /// Applies a non-terminal status to a launched task.
    pub fn update_task_state(&mut self, status: &TaskStatus) {
        if let Some(task) = self.launched_tasks.get_mut(&status.task_id) {
            task.state = status.state;
            task.latest_status = Some(status.clone());
        }
    }

    /// Moves a task to the terminated table with its terminal status.
    /// Frees the task's resources.
    pub fn terminate_task(&mut self, task_id: &TaskId, status: TaskStatus) {
        let task = if let Some(info) = self.queued_tasks.remove(task_id) {
            let mut task = Task::from_info(&info, self.framework_id.clone(), self.id.clone(), None);
            task.state = status.state;
            task.latest_status = Some(status);
            Some(task)
        } else if let Some(mut task) = self.launched_tasks.remove(task_id) {
            task.state = status.state;
            task.latest_status = Some(status);
            Some(task)
        } else {
            None
        };

        match task {
            Some(task) => {
                self.terminated_tasks.insert(task_id.clone(), task);
                self.recompute_resources();
            }
            None => {
                warn!(
                    executor_id = %self.id,
                    task_id = %task_id,
                    "Ignoring termination of unknown task"
                );
            }
        }
    }

    /// After the terminal update was acknowledged: move the task to the
    /// bounded completed history.
    pub fn complete_task(&mut self, task_id: &TaskId) -> bool {
        let Some(task) = self.terminated_tasks.remove(task_id) else {
            return false;
        };
        if self.completed_tasks.len() >= MAX_COMPLETED_TASKS_PER_EXECUTOR {
            self.completed_tasks.pop_front();
        }
        self.completed_tasks.push_back(task);
        true
    }

    /// Whether any task has not fully completed yet.
    pub fn has_incomplete_tasks(&self) -> bool {
        !self.queued_tasks.is_empty()
            || !self.launched_tasks.is_empty()
            || !self.terminated_tasks.is_empty()
    }

    /// Whether the task id appears in any table.
    pub fn contains_task(&self, task_id: &TaskId) -> bool {
        self.queued_tasks.contains_key(task_id)
            || self.launched_tasks.contains_key(task_id)
            || self.terminated_tasks.contains_key(task_id)
            || self.completed_tasks.iter().any(|t| &t.task_id == task_id)
    }

    /// Appends the task launch record to this executor's durable log.
    pub fn checkpoint_task(
        &self,
        meta_dir: &Path,
        slave_id: &SlaveId,
        task: &Task,
    ) -> Result<(), CheckpointError> {
        if !self.checkpoint {
            return Ok(());
        }
        checkpoint::checkpoint(
            &paths::task_info_path(
                meta_dir,
                slave_id,
                &self.framework_id,
                &self.id,
                &self.run_id,
                &task.task_id,
            ),
            &Record::Task(task.clone()),
        )
    }

    /// Rebuilds one task from its checkpointed launch record and update
    /// log.
    pub fn recover_task(&mut self, recovered: &TaskRunState) {
        let Some(mut task) = recovered.info.clone() else {
            warn!(executor_id = %self.id, "Skipping recovered task without launch record");
            return;
        };

        let mut terminal_acked = false;
        for update in &recovered.updates {
            task.state = update.status.state;
            task.latest_status = Some(update.status.clone());
            if update.status.state.is_terminal() && recovered.acks.contains(&update.update_id) {
                terminal_acked = true;
            }
        }

        if terminal_acked {
            if self.completed_tasks.len() >= MAX_COMPLETED_TASKS_PER_EXECUTOR {
                self.completed_tasks.pop_front();
            }
            self.completed_tasks.push_back(task);
        } else if task.state.is_terminal() {
            self.terminated_tasks.insert(task.task_id.clone(), task);
        } else {
            self.launched_tasks.insert(task.task_id.clone(), task);
        }
        self.recompute_resources();
    }

    fn recompute_resources(&mut self) {
        let mut resources = Resources::empty();
        for info in self.queued_tasks.values() {
            resources += &info.resources;
        }
        for task in self.launched_tasks.values() {
            resources += &task.resources;
        }
        self.resources = resources;
    }
}

/// The terminal status an agent synthesises for a task it must answer
/// for itself.
pub fn synthesised_status(task_id: TaskId, state: TaskState, message: &str) -> TaskStatus {
    TaskStatus {
        task_id,
        state,
        message: Some(message.to_string()),
        data: None,
    }
}
