//! The record of one framework on this agent: its executors and the
//! tasks pending validation.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use skiff_id::{ExecutorId, FrameworkId, RunId, TaskId};
use skiff_messages::{Endpoint, ExecutorInfo, FrameworkInfo};

use crate::config::MAX_COMPLETED_EXECUTORS_PER_FRAMEWORK;
use crate::executor::ExecutorRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkState {
    /// First state of a newly created framework.
    Running,
    /// The framework is shutting down in the cluster.
    Terminating,
}

/// Owned by the agent; owns its executors.
pub struct FrameworkRecord {
    pub id: FrameworkId,
    pub info: FrameworkInfo,
    /// The framework scheduler's endpoint.
    pub pid: Endpoint,
    pub state: FrameworkState,
    /// Tasks accepted but still in the asynchronous launch path,
    /// per target executor. A task may appear more than once if the
    /// master retries.
    pub pending: HashMap<ExecutorId, Vec<TaskId>>,
    pub executors: HashMap<ExecutorId, ExecutorRecord>,
    pub completed_executors: VecDeque<ExecutorRecord>,
}

impl FrameworkRecord {
    pub fn new(id: FrameworkId, info: FrameworkInfo, pid: Endpoint) -> Self {
        Self {
            id,
            info,
            pid,
            state: FrameworkState::Running,
            pending: HashMap::new(),
            executors: HashMap::new(),
            completed_executors: VecDeque::new(),
        }
    }

    /// Whether this framework opted into durable logging.
    pub fn checkpoints(&self) -> bool {
        self.info.checkpoint
    }

    pub fn add_pending(&mut self, executor_id: &ExecutorId, task_id: TaskId) {
        self.pending
            .entry(executor_id.clone())
            .or_default()
            .push(task_id);
    }

    /// Removes one pending entry; returns false if none was there (the
    /// task was killed or the framework torn down in the meantime).
    pub fn remove_pending(&mut self, executor_id: &ExecutorId, task_id: &TaskId) -> bool {
        let Some(tasks) = self.pending.get_mut(executor_id) else {
            return false;
        };
        let Some(index) = tasks.iter().position(|t| t == task_id) else {
            return false;
        };
        tasks.remove(index);
        if tasks.is_empty() {
            self.pending.remove(executor_id);
        }
        true
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Creates a fresh executor incarnation. Fails if an executor with
    /// this id is still live.
    pub fn launch_executor(
        &mut self,
        info: ExecutorInfo,
        run_id: RunId,
        directory: PathBuf,
        checkpoint: bool,
    ) -> Result<&mut ExecutorRecord, String> {
        let executor_id = info.executor_id.clone();
        if self.executors.contains_key(&executor_id) {
            return Err(format!(
                "executor {executor_id} of framework {} already exists",
                self.id
            ));
        }

        let executor = ExecutorRecord::new(self.id.clone(), info, run_id, directory, checkpoint);
        Ok(self.executors.entry(executor_id).or_insert(executor))
    }

    /// Moves an executor into the bounded completed history.
    pub fn destroy_executor(&mut self, executor_id: &ExecutorId) -> bool {
        let Some(executor) = self.executors.remove(executor_id) else {
            return false;
        };
        if self.completed_executors.len() >= MAX_COMPLETED_EXECUTORS_PER_FRAMEWORK {
            self.completed_executors.pop_front();
        }
        self.completed_executors.push_back(executor);
        true
    }

    pub fn executor(&self, executor_id: &ExecutorId) -> Option<&ExecutorRecord> {
        self.executors.get(executor_id)
    }

    pub fn executor_mut(&mut self, executor_id: &ExecutorId) -> Option<&mut ExecutorRecord> {
        self.executors.get_mut(executor_id)
    }

    /// The authoritative reverse index from task to executor: a scan of
    /// every live executor's task tables.
    pub fn executor_by_task(&self, task_id: &TaskId) -> Option<&ExecutorRecord> {
        self.executors
            .values()
            .find(|executor| executor.contains_task(task_id))
    }

    pub fn executor_by_task_mut(&mut self, task_id: &TaskId) -> Option<&mut ExecutorRecord> {
        self.executors
            .values_mut()
            .find(|executor| executor.contains_task(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use skiff_messages::{CommandInfo, TaskInfo};
    use skiff_resources::Resources;

    fn framework() -> FrameworkRecord {
        FrameworkRecord::new(
            FrameworkId::new(),
            FrameworkInfo {
                name: "fw".to_string(),
                user: "test".to_string(),
                checkpoint: true,
            },
            Endpoint::from("scheduler-1"),
        )
    }

    fn executor_info(id: &str) -> ExecutorInfo {
        ExecutorInfo {
            executor_id: id.parse().unwrap(),
            framework_id: None,
            command: CommandInfo::new("run"),
            resources: Resources::parse("cpus:0.1").unwrap(),
        }
    }

    #[test]
    fn test_launch_executor_rejects_duplicate() {
        let mut framework = framework();
        framework
            .launch_executor(
                executor_info("e1"),
                RunId::new(),
                PathBuf::from("/tmp/a"),
                true,
            )
            .unwrap();

        let result = framework.launch_executor(
            executor_info("e1"),
            RunId::new(),
            PathBuf::from("/tmp/b"),
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_destroy_executor_moves_to_ring() {
        let mut framework = framework();
        framework
            .launch_executor(
                executor_info("e1"),
                RunId::new(),
                PathBuf::from("/tmp/a"),
                true,
            )
            .unwrap();

        assert!(framework.destroy_executor(&"e1".parse().unwrap()));
        assert!(framework.executors.is_empty());
        assert_eq!(framework.completed_executors.len(), 1);

        // A new incarnation of the same id is fine now.
        assert!(framework
            .launch_executor(
                executor_info("e1"),
                RunId::new(),
                PathBuf::from("/tmp/b"),
                true,
            )
            .is_ok());
    }

    #[test]
    fn test_executor_by_task_scans_tables() {
        let mut framework = framework();
        let executor = framework
            .launch_executor(
                executor_info("e1"),
                RunId::new(),
                PathBuf::from("/tmp/a"),
                true,
            )
            .unwrap();

        executor.add_task(TaskInfo {
            task_id: "t1".parse().unwrap(),
            name: "t1".to_string(),
            resources: Resources::parse("cpus:1").unwrap(),
            executor: None,
            command: Some(CommandInfo::new("sleep 1")),
            data: None,
        });

        assert!(framework.executor_by_task(&"t1".parse().unwrap()).is_some());
        assert!(framework.executor_by_task(&"t2".parse().unwrap()).is_none());
    }

    #[test]
    fn test_pending_bookkeeping() {
        let mut framework = framework();
        let executor_id: ExecutorId = "e1".parse().unwrap();
        let task_id: TaskId = "t1".parse().unwrap();

        framework.add_pending(&executor_id, task_id.clone());
        framework.add_pending(&executor_id, task_id.clone());
        assert!(framework.has_pending());

        assert!(framework.remove_pending(&executor_id, &task_id));
        assert!(framework.has_pending());
        assert!(framework.remove_pending(&executor_id, &task_id));
        assert!(!framework.has_pending());
        assert!(!framework.remove_pending(&executor_id, &task_id));
    }
}
