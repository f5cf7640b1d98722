//! On-disk layout of sandboxes and checkpointed state.
//!
//! The checkpoint tree under the meta directory is the contract the
//! recovery path reads:
//!
//! ```text
//! meta/
//!   slaves/
//!     latest                                 <- record: slave id
//!     <slave_id>/
//!       slave.info
//!       frameworks/<framework_id>/
//!         framework.info
//!         framework.pid
//!         executors/<executor_id>/
//!           executor.info
//!           runs/<run_id>/
//!             endpoint
//!             tasks/<task_id>/
//!               task.info
//!               updates                      <- append-only record log
//! ```
//!
//! Sandboxes mirror the same hierarchy under the work directory, minus
//! the per-node files.

use std::path::{Path, PathBuf};

use skiff_id::{ExecutorId, FrameworkId, RunId, SlaveId, TaskId};

pub const LATEST_MARKER: &str = "latest";

pub fn slaves_dir(meta_dir: &Path) -> PathBuf {
    meta_dir.join("slaves")
}

pub fn latest_slave_path(meta_dir: &Path) -> PathBuf {
    slaves_dir(meta_dir).join(LATEST_MARKER)
}

pub fn slave_dir(meta_dir: &Path, slave_id: &SlaveId) -> PathBuf {
    slaves_dir(meta_dir).join(slave_id.to_string())
}

pub fn slave_info_path(meta_dir: &Path, slave_id: &SlaveId) -> PathBuf {
    slave_dir(meta_dir, slave_id).join("slave.info")
}

pub fn frameworks_dir(meta_dir: &Path, slave_id: &SlaveId) -> PathBuf {
    slave_dir(meta_dir, slave_id).join("frameworks")
}

pub fn framework_dir(meta_dir: &Path, slave_id: &SlaveId, framework_id: &FrameworkId) -> PathBuf {
    frameworks_dir(meta_dir, slave_id).join(framework_id.to_string())
}

pub fn framework_info_path(
    meta_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
) -> PathBuf {
    framework_dir(meta_dir, slave_id, framework_id).join("framework.info")
}

pub fn framework_pid_path(
    meta_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
) -> PathBuf {
    framework_dir(meta_dir, slave_id, framework_id).join("framework.pid")
}

pub fn executors_dir(meta_dir: &Path, slave_id: &SlaveId, framework_id: &FrameworkId) -> PathBuf {
    framework_dir(meta_dir, slave_id, framework_id).join("executors")
}

pub fn executor_dir(
    meta_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> PathBuf {
    executors_dir(meta_dir, slave_id, framework_id).join(executor_id.as_str())
}

pub fn executor_info_path(
    meta_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> PathBuf {
    executor_dir(meta_dir, slave_id, framework_id, executor_id).join("executor.info")
}

pub fn runs_dir(
    meta_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> PathBuf {
    executor_dir(meta_dir, slave_id, framework_id, executor_id).join("runs")
}

pub fn run_dir(
    meta_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_id: &RunId,
) -> PathBuf {
    runs_dir(meta_dir, slave_id, framework_id, executor_id).join(run_id.to_string())
}

pub fn run_endpoint_path(
    meta_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_id: &RunId,
) -> PathBuf {
    run_dir(meta_dir, slave_id, framework_id, executor_id, run_id).join("endpoint")
}

pub fn tasks_dir(
    meta_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_id: &RunId,
) -> PathBuf {
    run_dir(meta_dir, slave_id, framework_id, executor_id, run_id).join("tasks")
}

pub fn task_dir(
    meta_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_id: &RunId,
    task_id: &TaskId,
) -> PathBuf {
    tasks_dir(meta_dir, slave_id, framework_id, executor_id, run_id).join(task_id.as_str())
}

pub fn task_info_path(
    meta_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_id: &RunId,
    task_id: &TaskId,
) -> PathBuf {
    task_dir(meta_dir, slave_id, framework_id, executor_id, run_id, task_id).join("task.info")
}

pub fn task_updates_path(
    meta_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_id: &RunId,
    task_id: &TaskId,
) -> PathBuf {
    task_dir(meta_dir, slave_id, framework_id, executor_id, run_id, task_id).join("updates")
}

// -----------------------------------------------------------------------------
// Sandboxes (work directory)
// -----------------------------------------------------------------------------

pub fn work_framework_dir(
    work_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
) -> PathBuf {
    work_dir
        .join("slaves")
        .join(slave_id.to_string())
        .join("frameworks")
        .join(framework_id.to_string())
}

pub fn work_executor_dir(
    work_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> PathBuf {
    work_framework_dir(work_dir, slave_id, framework_id)
        .join("executors")
        .join(executor_id.as_str())
}

/// The sandbox of one executor run.
pub fn work_run_dir(
    work_dir: &Path,
    slave_id: &SlaveId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_id: &RunId,
) -> PathBuf {
    work_executor_dir(work_dir, slave_id, framework_id, executor_id)
        .join("runs")
        .join(run_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_nests() {
        let meta = Path::new("/var/lib/skiff/meta");
        let slave_id = SlaveId::new();
        let framework_id = FrameworkId::new();
        let executor_id: ExecutorId = "default".parse().unwrap();
        let run_id = RunId::new();
        let task_id: TaskId = "t-1".parse().unwrap();

        let updates = task_updates_path(meta, &slave_id, &framework_id, &executor_id, &run_id, &task_id);
        let run = run_dir(meta, &slave_id, &framework_id, &executor_id, &run_id);

        assert!(updates.starts_with(&run));
        assert!(run.starts_with(slave_dir(meta, &slave_id)));
        assert!(updates.ends_with("updates"));
    }

    #[test]
    fn test_work_and_meta_trees_are_disjoint() {
        let slave_id = SlaveId::new();
        let framework_id = FrameworkId::new();
        let executor_id: ExecutorId = "default".parse().unwrap();
        let run_id = RunId::new();

        let work = Path::new("/var/lib/skiff");
        let meta = work.join("meta");

        let sandbox = work_run_dir(work, &slave_id, &framework_id, &executor_id, &run_id);
        let checkpoints = run_dir(&meta, &slave_id, &framework_id, &executor_id, &run_id);

        assert!(!sandbox.starts_with(&meta));
        assert!(checkpoints.starts_with(&meta));
    }
}
