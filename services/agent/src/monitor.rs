//! Per-executor resource usage sampling.
//!
//! The monitor keeps a watch list of hosted containers and periodically
//! asks the isolator for a usage sample of each, retaining the latest.
//! Sampling failures are expected around executor exit and are logged at
//! debug level only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use skiff_messages::ResourceStatistics;

use crate::actors::{Actor, ActorContext, ActorError, ActorHandle};
use crate::isolator::{ContainerId, Isolator};

const COLLECT_INTERVAL: Duration = Duration::from_secs(5);

/// Messages handled by the resource monitor.
#[derive(Debug)]
pub enum MonitorMessage {
    Watch { container: ContainerId },
    Unwatch { container: ContainerId },
    /// Internal sampling timer.
    Collect,
    /// Snapshot of the latest samples.
    Usage {
        reply: oneshot::Sender<Vec<ExecutorUsage>>,
    },
}

/// The latest sample for one watched executor.
#[derive(Debug, Clone)]
pub struct ExecutorUsage {
    pub container: ContainerId,
    pub statistics: Option<ResourceStatistics>,
}

/// The sampling actor.
pub struct ResourceMonitor {
    isolator: Arc<dyn Isolator>,
    watched: HashMap<ContainerId, Option<ResourceStatistics>>,
    collect_armed: bool,
}

impl ResourceMonitor {
    pub fn new(isolator: Arc<dyn Isolator>) -> Self {
        Self {
            isolator,
            watched: HashMap::new(),
            collect_armed: false,
        }
    }

    fn arm_collect(&mut self, ctx: &ActorContext<MonitorMessage>) {
        if !self.collect_armed && !self.watched.is_empty() {
            self.collect_armed = true;
            ctx.schedule(COLLECT_INTERVAL, MonitorMessage::Collect);
        }
    }
}

#[async_trait]
impl Actor for ResourceMonitor {
    type Message = MonitorMessage;

    fn name(&self) -> &str {
        "monitor"
    }

    async fn handle(
        &mut self,
        msg: MonitorMessage,
        ctx: &mut ActorContext<MonitorMessage>,
    ) -> Result<bool, ActorError> {
        match msg {
            MonitorMessage::Watch { container } => {
                debug!(container = %container, "Watching executor");
                self.watched.entry(container).or_insert(None);
                self.arm_collect(ctx);
            }

            MonitorMessage::Unwatch { container } => {
                debug!(container = %container, "Unwatching executor");
                self.watched.remove(&container);
            }

            MonitorMessage::Collect => {
                self.collect_armed = false;
                let containers: Vec<ContainerId> = self.watched.keys().cloned().collect();
                for container in containers {
                    match self.isolator.usage(&container).await {
                        Ok(statistics) => {
                            self.watched.insert(container, Some(statistics));
                        }
                        Err(e) => {
                            debug!(container = %container, error = %e, "Usage sample failed");
                        }
                    }
                }
                self.arm_collect(ctx);
            }

            MonitorMessage::Usage { reply } => {
                let usage = self
                    .watched
                    .iter()
                    .map(|(container, statistics)| ExecutorUsage {
                        container: container.clone(),
                        statistics: statistics.clone(),
                    })
                    .collect();
                let _ = reply.send(usage);
            }
        }

        Ok(true)
    }
}

/// Typed handle over the monitor's mailbox.
#[derive(Clone)]
pub struct MonitorHandle {
    handle: ActorHandle<MonitorMessage>,
}

impl MonitorHandle {
    pub fn new(handle: ActorHandle<MonitorMessage>) -> Self {
        Self { handle }
    }

    pub fn watch(&self, container: ContainerId) {
        let _ = self.handle.send(MonitorMessage::Watch { container });
    }

    pub fn unwatch(&self, container: ContainerId) {
        let _ = self.handle.send(MonitorMessage::Unwatch { container });
    }

    /// The latest sample per watched executor.
    pub async fn usage(&self) -> Vec<ExecutorUsage> {
        let (reply, rx) = oneshot::channel();
        if self.handle.send(MonitorMessage::Usage { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use skiff_id::{FrameworkId, RunId};
    use skiff_messages::CommandInfo;
    use skiff_resources::Resources;

    use crate::actors::spawn;
    use crate::isolator::MockIsolator;

    async fn launch(isolator: &MockIsolator) -> ContainerId {
        let container = ContainerId {
            framework_id: FrameworkId::new(),
            executor_id: "default".parse().unwrap(),
            run_id: RunId::new(),
        };
        let info = skiff_messages::ExecutorInfo {
            executor_id: container.executor_id.clone(),
            framework_id: Some(container.framework_id.clone()),
            command: CommandInfo::new("run"),
            resources: Resources::parse("cpus:1").unwrap(),
        };
        isolator
            .launch(&container, &info, std::path::Path::new("/tmp/sandbox"))
            .await
            .unwrap();
        container
    }

    #[tokio::test(start_paused = true)]
    async fn test_watched_executor_is_sampled() {
        let isolator = Arc::new(MockIsolator::new());
        let container = launch(&isolator).await;

        let (handle, _actor) = spawn(ResourceMonitor::new(isolator.clone()));
        let monitor = MonitorHandle::new(handle);

        monitor.watch(container.clone());
        tokio::time::sleep(COLLECT_INTERVAL + Duration::from_secs(1)).await;

        let usage = monitor.usage().await;
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].container, container);
        assert!(usage[0].statistics.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatch_drops_sample() {
        let isolator = Arc::new(MockIsolator::new());
        let container = launch(&isolator).await;

        let (handle, _actor) = spawn(ResourceMonitor::new(isolator.clone()));
        let monitor = MonitorHandle::new(handle);

        monitor.watch(container.clone());
        monitor.unwatch(container);

        let usage = monitor.usage().await;
        assert!(usage.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sample_is_tolerated() {
        let isolator = Arc::new(MockIsolator::new());
        let container = launch(&isolator).await;

        let (handle, _actor) = spawn(ResourceMonitor::new(isolator.clone()));
        let monitor = MonitorHandle::new(handle);

        monitor.watch(container.clone());
        isolator.terminate(&container, 0, "gone");
        tokio::time::sleep(COLLECT_INTERVAL + Duration::from_secs(1)).await;

        // Still watched, just no sample.
        let usage = monitor.usage().await;
        assert_eq!(usage.len(), 1);
        assert!(usage[0].statistics.is_none());
    }
}
