//! Process-isolation interface and mock implementation.
//!
//! The isolator abstracts whatever actually hosts executor processes
//! (process groups, a container runtime). The agent drives it through
//! four operations and consumes a stream of exit events; everything
//! else about isolation is the backend's business.
//!
//! A mock implementation is provided for testing and local development,
//! with hooks to terminate "processes" and to fail launches.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use skiff_id::{ExecutorId, FrameworkId, RunId};
use skiff_messages::{ExecutorInfo, ResourceStatistics};

/// Identifies one hosted executor incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId {
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    pub run_id: RunId,
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.framework_id, self.executor_id, self.run_id)
    }
}

/// An executor process went away.
#[derive(Debug, Clone)]
pub struct ExecutorExit {
    pub container: ContainerId,
    /// Exit status; negative when killed by signal.
    pub status: i32,
    /// True when the isolator destroyed it rather than it exiting.
    pub destroyed: bool,
    pub message: String,
}

/// The isolation backend contract.
#[async_trait]
pub trait Isolator: Send + Sync {
    /// Start an executor in `directory`. Resolves to the OS pid.
    async fn launch(
        &self,
        container: &ContainerId,
        executor: &ExecutorInfo,
        directory: &Path,
    ) -> Result<u32>;

    /// Forcibly tear a container down. The exit surfaces through the
    /// exit stream like any other.
    async fn destroy(&self, container: &ContainerId) -> Result<()>;

    /// Sample current resource usage.
    async fn usage(&self, container: &ContainerId) -> Result<ResourceStatistics>;

    /// Tell the backend which containers a recovering agent still
    /// expects to exist.
    async fn recover(&self, containers: &[ContainerId]) -> Result<()>;

    /// The exit event stream. Yields `Some` exactly once.
    fn take_exits(&self) -> Option<mpsc::UnboundedReceiver<ExecutorExit>>;
}

// =============================================================================
// Mock isolator
// =============================================================================

struct Live {
    pid: u32,
    cpu_time_secs: f64,
}

/// Mock isolator for testing and local development.
pub struct MockIsolator {
    live: Mutex<HashMap<ContainerId, Live>>,
    next_pid: AtomicU32,
    exit_tx: mpsc::UnboundedSender<ExecutorExit>,
    exit_rx: Mutex<Option<mpsc::UnboundedReceiver<ExecutorExit>>>,
    fail_launches: bool,
}

impl MockIsolator {
    pub fn new() -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            live: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1000),
            exit_tx,
            exit_rx: Mutex::new(Some(exit_rx)),
            fail_launches: false,
        }
    }

    /// A mock that fails every launch.
    pub fn failing() -> Self {
        Self {
            fail_launches: true,
            ..Self::new()
        }
    }

    /// Test hook: make a hosted executor exit on its own.
    pub fn terminate(&self, container: &ContainerId, status: i32, message: &str) {
        let removed = self
            .live
            .lock()
            .expect("isolator lock poisoned")
            .remove(container)
            .is_some();
        if removed {
            let _ = self.exit_tx.send(ExecutorExit {
                container: container.clone(),
                status,
                destroyed: false,
                message: message.to_string(),
            });
        }
    }

    /// Test hook: whether a container is currently hosted.
    pub fn is_live(&self, container: &ContainerId) -> bool {
        self.live
            .lock()
            .expect("isolator lock poisoned")
            .contains_key(container)
    }

    /// Test hook: number of hosted containers.
    pub fn live_count(&self) -> usize {
        self.live.lock().expect("isolator lock poisoned").len()
    }
}

impl Default for MockIsolator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Isolator for MockIsolator {
    async fn launch(
        &self,
        container: &ContainerId,
        executor: &ExecutorInfo,
        directory: &Path,
    ) -> Result<u32> {
        if self.fail_launches {
            bail!("mock isolator configured to fail");
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.live.lock().expect("isolator lock poisoned").insert(
            container.clone(),
            Live {
                pid,
                cpu_time_secs: 0.0,
            },
        );

        info!(
            container = %container,
            executor_id = %executor.executor_id,
            directory = %directory.display(),
            pid,
            "[MOCK] Launched executor"
        );

        Ok(pid)
    }

    async fn destroy(&self, container: &ContainerId) -> Result<()> {
        let removed = self
            .live
            .lock()
            .expect("isolator lock poisoned")
            .remove(container)
            .is_some();

        info!(container = %container, removed, "[MOCK] Destroying executor");

        // Destroying something that is not (or no longer) hosted still
        // reports an exit, like a process reaper would.
        let _ = self.exit_tx.send(ExecutorExit {
            container: container.clone(),
            status: -9,
            destroyed: true,
            message: if removed {
                "destroyed by isolator".to_string()
            } else {
                "container was not running".to_string()
            },
        });
        Ok(())
    }

    async fn usage(&self, container: &ContainerId) -> Result<ResourceStatistics> {
        let mut live = self.live.lock().expect("isolator lock poisoned");
        let Some(entry) = live.get_mut(container) else {
            bail!("unknown container {container}");
        };

        entry.cpu_time_secs += 0.1;
        Ok(ResourceStatistics {
            timestamp: Utc::now(),
            cpus_user_time_secs: entry.cpu_time_secs,
            cpus_system_time_secs: entry.cpu_time_secs / 10.0,
            mem_rss_bytes: 64 * 1024 * 1024 + u64::from(entry.pid),
        })
    }

    async fn recover(&self, containers: &[ContainerId]) -> Result<()> {
        debug!(count = containers.len(), "[MOCK] Recovering containers");
        Ok(())
    }

    fn take_exits(&self) -> Option<mpsc::UnboundedReceiver<ExecutorExit>> {
        self.exit_rx.lock().expect("isolator lock poisoned").take()
    }
}
