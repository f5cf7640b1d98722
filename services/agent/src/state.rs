//! Recovered state: what the checkpoint tree says the previous run of
//! the agent was doing.
//!
//! [`recover`] walks the meta directory and rebuilds a [`SlaveState`]
//! snapshot. Under `strict` any inconsistency is an error; otherwise the
//! offending subtree is dropped with a loud log and counted, and
//! recovery carries on with what remains.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use skiff_id::{ExecutorId, FrameworkId, RunId, SlaveId, TaskId, UpdateId};
use skiff_messages::{Endpoint, ExecutorInfo, FrameworkInfo, SlaveInfo, StatusUpdate, Task};

use crate::checkpoint::{self, CheckpointError, Record};
use crate::paths;

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt checkpoint state: {0}")]
    Corrupt(String),
}

/// Everything recovered for one task of one executor run.
#[derive(Debug, Clone, Default)]
pub struct TaskRunState {
    pub info: Option<Task>,
    /// Updates in log order, acknowledged or not.
    pub updates: Vec<StatusUpdate>,
    pub acks: HashSet<UpdateId>,
}

/// One incarnation of an executor.
#[derive(Debug, Clone)]
pub struct RunState {
    pub id: RunId,
    pub endpoint: Option<Endpoint>,
    pub tasks: HashMap<TaskId, TaskRunState>,
}

#[derive(Debug, Clone)]
pub struct ExecutorRunState {
    pub id: ExecutorId,
    pub info: Option<ExecutorInfo>,
    pub runs: HashMap<RunId, RunState>,
}

impl ExecutorRunState {
    /// The newest incarnation; run ids are time-ordered.
    pub fn latest_run(&self) -> Option<&RunState> {
        self.runs.values().max_by_key(|run| run.id)
    }
}

#[derive(Debug, Clone)]
pub struct FrameworkRunState {
    pub id: FrameworkId,
    pub info: Option<FrameworkInfo>,
    pub pid: Option<Endpoint>,
    pub executors: HashMap<ExecutorId, ExecutorRunState>,
}

/// The whole recovered snapshot.
#[derive(Debug, Clone)]
pub struct SlaveState {
    pub slave_id: SlaveId,
    pub info: Option<SlaveInfo>,
    pub frameworks: HashMap<FrameworkId, FrameworkRunState>,
    /// Subtrees dropped in non-strict mode.
    pub errors: usize,
}

/// Reads the checkpoint tree. `Ok(None)` when there is nothing to
/// recover (first boot, or checkpointing was off).
pub fn recover(meta_dir: &Path, strict: bool) -> Result<Option<SlaveState>, StateError> {
    let latest = paths::latest_slave_path(meta_dir);
    let slave_id = match checkpoint::read_checkpoint(&latest)? {
        Some(Record::SlaveId { slave_id }) => slave_id,
        Some(other) => {
            return Err(StateError::Corrupt(format!(
                "unexpected record {other:?} in {}",
                latest.display()
            )))
        }
        None => {
            info!(meta_dir = %meta_dir.display(), "No checkpointed state found");
            return Ok(None);
        }
    };

    let mut state = SlaveState {
        slave_id,
        info: None,
        frameworks: HashMap::new(),
        errors: 0,
    };

    match checkpoint::read_checkpoint(&paths::slave_info_path(meta_dir, &slave_id))? {
        Some(Record::SlaveInfo(info)) => state.info = Some(info),
        Some(other) => {
            return Err(StateError::Corrupt(format!(
                "unexpected record {other:?} for slave info"
            )))
        }
        None => {}
    }

    for (name, _dir) in list_dirs(&paths::frameworks_dir(meta_dir, &slave_id))? {
        let Ok(framework_id) = name.parse::<FrameworkId>() else {
            drop_or_fail(strict, &mut state.errors, &format!("bad framework dir {name:?}"))?;
            continue;
        };

        match recover_framework(meta_dir, &slave_id, &framework_id, strict, &mut state.errors) {
            Ok(framework) => {
                state.frameworks.insert(framework_id, framework);
            }
            Err(e) if strict => return Err(e),
            Err(e) => {
                warn!(framework_id = %framework_id, error = %e, "Dropping framework from recovery");
                state.errors += 1;
            }
        }
    }

    info!(
        slave_id = %state.slave_id,
        frameworks = state.frameworks.len(),
        errors = state.errors,
        "Recovered checkpointed state"
    );

    Ok(Some(state))
}

fn recover_framework(
    meta_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    strict: bool,
    errors: &mut usize,
) -> Result<FrameworkRunState, StateError> {
    let mut framework = FrameworkRunState {
        id: framework_id.clone(),
        info: None,
        pid: None,
        executors: HashMap::new(),
    };

    if let Some(Record::FrameworkInfo(info)) =
        checkpoint::read_checkpoint(&paths::framework_info_path(meta_dir, slave_id, framework_id))?
    {
        framework.info = Some(info);
    }
    if let Some(Record::FrameworkPid { pid }) =
        checkpoint::read_checkpoint(&paths::framework_pid_path(meta_dir, slave_id, framework_id))?
    {
        framework.pid = Some(pid);
    }

    for (name, _dir) in list_dirs(&paths::executors_dir(meta_dir, slave_id, framework_id))? {
        let Ok(executor_id) = name.parse::<ExecutorId>() else {
            drop_or_fail(strict, errors, &format!("bad executor dir {name:?}"))?;
            continue;
        };

        match recover_executor(meta_dir, slave_id, framework_id, &executor_id, strict, errors) {
            Ok(executor) => {
                framework.executors.insert(executor_id, executor);
            }
            Err(e) if strict => return Err(e),
            Err(e) => {
                warn!(
                    framework_id = %framework_id,
                    executor_id = %executor_id,
                    error = %e,
                    "Dropping executor from recovery"
                );
                *errors += 1;
            }
        }
    }

    Ok(framework)
}

fn recover_executor(
    meta_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    strict: bool,
    errors: &mut usize,
) -> Result<ExecutorRunState, StateError> {
    let mut executor = ExecutorRunState {
        id: executor_id.clone(),
        info: None,
        runs: HashMap::new(),
    };

    if let Some(Record::ExecutorInfo(info)) = checkpoint::read_checkpoint(
        &paths::executor_info_path(meta_dir, slave_id, framework_id, executor_id),
    )? {
        executor.info = Some(info);
    }

    for (name, _dir) in list_dirs(&paths::runs_dir(meta_dir, slave_id, framework_id, executor_id))? {
        let Ok(run_id) = name.parse::<RunId>() else {
            drop_or_fail(strict, errors, &format!("bad run dir {name:?}"))?;
            continue;
        };

        let mut run = RunState {
            id: run_id,
            endpoint: None,
            tasks: HashMap::new(),
        };

        if let Some(Record::ExecutorEndpoint { endpoint }) = checkpoint::read_checkpoint(
            &paths::run_endpoint_path(meta_dir, slave_id, framework_id, executor_id, &run_id),
        )? {
            run.endpoint = Some(endpoint);
        }

        for (task_name, _dir) in list_dirs(&paths::tasks_dir(
            meta_dir,
            slave_id,
            framework_id,
            executor_id,
            &run_id,
        ))? {
            let Ok(task_id) = task_name.parse::<TaskId>() else {
                drop_or_fail(strict, errors, &format!("bad task dir {task_name:?}"))?;
                continue;
            };

            let mut task = TaskRunState::default();

            if let Some(Record::Task(info)) = checkpoint::read_checkpoint(&paths::task_info_path(
                meta_dir,
                slave_id,
                framework_id,
                executor_id,
                &run_id,
                &task_id,
            ))? {
                task.info = Some(info);
            }

            let updates_path = paths::task_updates_path(
                meta_dir,
                slave_id,
                framework_id,
                executor_id,
                &run_id,
                &task_id,
            );
            if updates_path.exists() {
                for record in checkpoint::read_records(&updates_path)? {
                    match record {
                        Record::Update(update) => task.updates.push(update),
                        Record::Ack { update_id } => {
                            task.acks.insert(update_id);
                        }
                        other => {
                            drop_or_fail(
                                strict,
                                errors,
                                &format!("unexpected record {other:?} in updates log"),
                            )?;
                        }
                    }
                }
            }

            run.tasks.insert(task_id, task);
        }

        executor.runs.insert(run_id, run);
    }

    Ok(executor)
}

fn drop_or_fail(strict: bool, errors: &mut usize, message: &str) -> Result<(), StateError> {
    if strict {
        return Err(StateError::Corrupt(message.to_string()));
    }
    warn!(message, "Dropping inconsistent checkpoint entry");
    *errors += 1;
    Ok(())
}

/// Subdirectory names of `path`; empty if `path` does not exist.
fn list_dirs(path: &Path) -> Result<Vec<(String, PathBuf)>, StateError> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(StateError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StateError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let entry_path = entry.path();
        if entry_path.is_dir() {
            dirs.push((entry.file_name().to_string_lossy().into_owned(), entry_path));
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    use skiff_messages::{TaskState, TaskStatus};
    use skiff_resources::Resources;

    fn write_tree(meta: &Path) -> (SlaveId, FrameworkId, ExecutorId, RunId, TaskId, UpdateId) {
        let slave_id = SlaveId::new();
        let framework_id = FrameworkId::new();
        let executor_id: ExecutorId = "default".parse().unwrap();
        let run_id = RunId::new();
        let task_id: TaskId = "t-1".parse().unwrap();

        checkpoint::checkpoint(&paths::latest_slave_path(meta), &Record::SlaveId { slave_id })
            .unwrap();

        let info = SlaveInfo {
            hostname: "node-1".to_string(),
            resources: Resources::parse("cpus:4").unwrap(),
            attributes: Default::default(),
            checkpoint: true,
        };
        checkpoint::checkpoint(&paths::slave_info_path(meta, &slave_id), &Record::SlaveInfo(info))
            .unwrap();

        checkpoint::checkpoint(
            &paths::framework_info_path(meta, &slave_id, &framework_id),
            &Record::FrameworkInfo(FrameworkInfo {
                name: "fw".to_string(),
                user: "test".to_string(),
                checkpoint: true,
            }),
        )
        .unwrap();

        checkpoint::checkpoint(
            &paths::executor_info_path(meta, &slave_id, &framework_id, &executor_id),
            &Record::ExecutorInfo(ExecutorInfo {
                executor_id: executor_id.clone(),
                framework_id: Some(framework_id.clone()),
                command: skiff_messages::CommandInfo::new("run"),
                resources: Resources::parse("cpus:1").unwrap(),
            }),
        )
        .unwrap();

        checkpoint::checkpoint(
            &paths::run_endpoint_path(meta, &slave_id, &framework_id, &executor_id, &run_id),
            &Record::ExecutorEndpoint {
                endpoint: Endpoint::from("executor-1"),
            },
        )
        .unwrap();

        let update = StatusUpdate::new(
            framework_id.clone(),
            Some(executor_id.clone()),
            Some(slave_id),
            TaskStatus {
                task_id: task_id.clone(),
                state: TaskState::Finished,
                message: None,
                data: None,
            },
        );
        let update_id = update.update_id;

        let mut writer = checkpoint::RecordWriter::open(&paths::task_updates_path(
            meta,
            &slave_id,
            &framework_id,
            &executor_id,
            &run_id,
            &task_id,
        ))
        .unwrap();
        writer.append(&Record::Update(update)).unwrap();

        (slave_id, framework_id, executor_id, run_id, task_id, update_id)
    }

    #[test]
    fn test_recover_empty_tree_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(recover(dir.path(), true).unwrap().is_none());
    }

    #[test]
    fn test_recover_full_tree() {
        let dir = tempfile::tempdir().unwrap();
        let (slave_id, framework_id, executor_id, run_id, task_id, update_id) =
            write_tree(dir.path());

        let state = recover(dir.path(), true).unwrap().unwrap();
        assert_eq!(state.slave_id, slave_id);
        assert_eq!(state.errors, 0);
        assert!(state.info.is_some());

        let framework = &state.frameworks[&framework_id];
        assert_eq!(framework.info.as_ref().unwrap().name, "fw");

        let executor = &framework.executors[&executor_id];
        let run = executor.latest_run().unwrap();
        assert_eq!(run.id, run_id);
        assert_eq!(run.endpoint, Some(Endpoint::from("executor-1")));

        let task = &run.tasks[&task_id];
        assert_eq!(task.updates.len(), 1);
        assert_eq!(task.updates[0].update_id, update_id);
        assert!(task.acks.is_empty());
    }

    #[test]
    fn test_latest_run_picks_newest() {
        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path();
        let (slave_id, framework_id, executor_id, first_run, _, _) = write_tree(meta);

        std::thread::sleep(std::time::Duration::from_millis(2));
        let second_run = RunId::new();
        checkpoint::checkpoint(
            &paths::run_endpoint_path(meta, &slave_id, &framework_id, &executor_id, &second_run),
            &Record::ExecutorEndpoint {
                endpoint: Endpoint::from("executor-2"),
            },
        )
        .unwrap();

        let state = recover(meta, true).unwrap().unwrap();
        let executor = &state.frameworks[&framework_id].executors[&executor_id];
        assert_eq!(executor.runs.len(), 2);
        assert!(second_run > first_run);
        assert_eq!(executor.latest_run().unwrap().id, second_run);
    }

    #[test]
    fn test_non_strict_drops_bad_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path();
        let (slave_id, ..) = write_tree(meta);

        // A framework directory that is not a framework id.
        std::fs::create_dir_all(paths::frameworks_dir(meta, &slave_id).join("not-an-id"))
            .unwrap();

        let state = recover(meta, false).unwrap().unwrap();
        assert_eq!(state.errors, 1);
        assert_eq!(state.frameworks.len(), 1);

        assert!(recover(meta, true).is_err());
    }
}
