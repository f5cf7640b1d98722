//! Shared harness for agent integration tests: a scripted master and
//! executor on the same bus as a real agent runtime.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use skiff_agent::{AgentRuntime, AgentSnapshot, Flags, MockIsolator, StandaloneDetector};
use skiff_id::{ExecutorId, FrameworkId, SlaveId, TaskId, UpdateId};
use skiff_messages::{
    CommandInfo, Endpoint, FrameworkInfo, Mailbox, Message, MessageBus, StatusUpdate, TaskInfo,
    TaskState, TaskStatus,
};
use skiff_resources::Resources;

/// Virtual-time ceiling for every expectation; with the clock paused
/// this resolves in milliseconds of real time.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(300);

pub fn test_flags(work_dir: &Path) -> Flags {
    Flags {
        resources: Some(Resources::parse("cpus:8;mem:4096;ports:[31000-32000]").unwrap()),
        work_dir: work_dir.to_path_buf(),
        hostname: "test-node".to_string(),
        ..Flags::default()
    }
}

pub fn framework_info(checkpoint: bool) -> FrameworkInfo {
    FrameworkInfo {
        name: "test-framework".to_string(),
        user: "test".to_string(),
        checkpoint,
    }
}

pub fn command_task(id: &str, resources: &str) -> TaskInfo {
    TaskInfo {
        task_id: id.parse().unwrap(),
        name: id.to_string(),
        resources: Resources::parse(resources).unwrap(),
        executor: None,
        command: Some(CommandInfo::new("sleep 1000")),
        data: None,
    }
}

/// A scripted master endpoint.
pub struct TestMaster {
    bus: MessageBus,
    mailbox: Mailbox,
    pub endpoint: Endpoint,
    pub slave_id: SlaveId,
}

impl TestMaster {
    pub fn new(bus: &MessageBus) -> Self {
        let mailbox = bus.register("master");
        let endpoint = mailbox.endpoint().clone();
        Self {
            bus: bus.clone(),
            mailbox,
            endpoint,
            slave_id: SlaveId::new(),
        }
    }

    fn send_to_slave(&self, message: Message) {
        self.bus
            .send(&self.endpoint, &Endpoint::from(skiff_agent::SLAVE_ENDPOINT), message);
    }

    async fn recv(&mut self) -> Message {
        tokio::time::timeout(EXPECT_TIMEOUT, self.mailbox.recv())
            .await
            .expect("timed out waiting for a message to the master")
            .expect("master mailbox closed")
            .message
    }

    /// Answers the next (re-)registration attempt with the assigned id.
    pub async fn expect_registration(&mut self) -> SlaveId {
        loop {
            match self.recv().await {
                Message::RegisterSlave { .. } => {
                    self.send_to_slave(Message::Registered {
                        slave_id: self.slave_id,
                    });
                    return self.slave_id;
                }
                Message::ReregisterSlave { slave_id, .. } => {
                    self.slave_id = slave_id;
                    self.send_to_slave(Message::Reregistered { slave_id });
                    return slave_id;
                }
                other => {
                    // Retransmissions and unrelated traffic.
                    let _ = other;
                }
            }
        }
    }

    /// The next status update, skipping any other traffic.
    pub async fn next_status_update(&mut self) -> StatusUpdate {
        loop {
            if let Message::StatusUpdate { update } = self.recv().await {
                return update;
            }
        }
    }

    /// The next status update for the given task with the given state,
    /// skipping duplicates of earlier updates.
    pub async fn expect_task_state(&mut self, task_id: &str, state: TaskState) -> StatusUpdate {
        let task_id: TaskId = task_id.parse().unwrap();
        loop {
            let update = self.next_status_update().await;
            if update.status.task_id == task_id && update.status.state == state {
                return update;
            }
        }
    }

    pub fn acknowledge(&self, update: &StatusUpdate) {
        self.send_to_slave(Message::StatusUpdateAcknowledgement {
            slave_id: update.slave_id.expect("update carries a slave id"),
            framework_id: update.framework_id.clone(),
            task_id: update.status.task_id.clone(),
            update_id: update.update_id,
        });
    }

    pub fn run_task(&self, framework_id: &FrameworkId, info: FrameworkInfo, task: TaskInfo) {
        self.send_to_slave(Message::RunTask {
            framework_info: info,
            framework_id: framework_id.clone(),
            pid: Endpoint::from("scheduler"),
            task,
        });
    }

    pub fn kill_task(&self, framework_id: &FrameworkId, task_id: &str) {
        self.send_to_slave(Message::KillTask {
            framework_id: framework_id.clone(),
            task_id: task_id.parse().unwrap(),
        });
    }

    pub fn shutdown_framework(&self, framework_id: &FrameworkId) {
        self.send_to_slave(Message::ShutdownFramework {
            framework_id: framework_id.clone(),
        });
    }

    pub fn ping(&self) {
        self.send_to_slave(Message::Ping);
    }

    pub async fn expect_pong(&mut self) {
        loop {
            if matches!(self.recv().await, Message::Pong) {
                return;
            }
        }
    }
}

/// A scripted executor endpoint.
pub struct TestExecutor {
    bus: MessageBus,
    mailbox: Mailbox,
    pub endpoint: Endpoint,
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
}

impl TestExecutor {
    pub fn new(bus: &MessageBus, name: &str, framework_id: &FrameworkId, executor_id: &str) -> Self {
        let mailbox = bus.register(name);
        let endpoint = mailbox.endpoint().clone();
        Self {
            bus: bus.clone(),
            mailbox,
            endpoint,
            framework_id: framework_id.clone(),
            executor_id: executor_id.parse().unwrap(),
        }
    }

    fn send_to_slave(&self, message: Message) {
        self.bus
            .send(&self.endpoint, &Endpoint::from(skiff_agent::SLAVE_ENDPOINT), message);
    }

    async fn recv(&mut self) -> Message {
        tokio::time::timeout(EXPECT_TIMEOUT, self.mailbox.recv())
            .await
            .expect("timed out waiting for a message to the executor")
            .expect("executor mailbox closed")
            .message
    }

    pub fn register(&self) {
        self.send_to_slave(Message::RegisterExecutor {
            framework_id: self.framework_id.clone(),
            executor_id: self.executor_id.clone(),
        });
    }

    pub fn reregister(&self) {
        self.send_to_slave(Message::ReregisterExecutor {
            framework_id: self.framework_id.clone(),
            executor_id: self.executor_id.clone(),
            tasks: Vec::new(),
            updates: Vec::new(),
        });
    }

    pub async fn expect_run_task(&mut self) -> TaskInfo {
        loop {
            if let Message::RunTaskToExecutor { task } = self.recv().await {
                return task;
            }
        }
    }

    pub async fn expect_reconnect(&mut self) -> SlaveId {
        loop {
            if let Message::ReconnectExecutor { slave_id } = self.recv().await {
                return slave_id;
            }
        }
    }

    pub async fn expect_shutdown(&mut self) {
        loop {
            if matches!(self.recv().await, Message::ShutdownExecutor) {
                return;
            }
        }
    }

    pub async fn expect_kill_task(&mut self) -> TaskId {
        loop {
            if let Message::KillTask { task_id, .. } = self.recv().await {
                return task_id;
            }
        }
    }

    /// Sends a status update the way a real executor would and returns
    /// its acknowledgement key.
    pub fn send_status(&self, task_id: &str, state: TaskState) -> UpdateId {
        let update = StatusUpdate::new(
            self.framework_id.clone(),
            Some(self.executor_id.clone()),
            None,
            TaskStatus {
                task_id: task_id.parse().unwrap(),
                state,
                message: None,
                data: None,
            },
        );
        let update_id = update.update_id;
        self.send_to_slave(Message::StatusUpdate { update });
        update_id
    }

    pub async fn expect_update_acknowledged(&mut self) -> UpdateId {
        loop {
            if let Message::StatusUpdateAcknowledged { update_id, .. } = self.recv().await {
                return update_id;
            }
        }
    }
}

/// One agent with a scripted master, ready to drive.
pub struct TestCluster {
    pub bus: MessageBus,
    pub isolator: Arc<MockIsolator>,
    pub detector: StandaloneDetector,
    pub master: TestMaster,
    pub runtime: AgentRuntime,
}

impl TestCluster {
    /// Starts the agent and registers it with the scripted master.
    pub async fn start(flags: Flags) -> Self {
        let mut cluster = Self::start_detached(flags).await;
        cluster.detector.appoint(Some(cluster.master.endpoint.clone()));
        cluster.master.expect_registration().await;
        cluster
    }

    /// Starts the agent without appointing a master.
    pub async fn start_detached(flags: Flags) -> Self {
        let bus = MessageBus::new();
        let master = TestMaster::new(&bus);
        let isolator = Arc::new(MockIsolator::new());
        let detector = StandaloneDetector::new(None);

        let runtime = AgentRuntime::start(flags, bus.clone(), isolator.clone(), &detector);

        Self {
            bus,
            isolator,
            detector,
            master,
            runtime,
        }
    }

    pub async fn snapshot(&self) -> AgentSnapshot {
        self.runtime.inspect().await.expect("agent is running")
    }

    /// Polls until the snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> AgentSnapshot
    where
        F: Fn(&AgentSnapshot) -> bool,
    {
        tokio::time::timeout(EXPECT_TIMEOUT, async {
            loop {
                let snapshot = self.snapshot().await;
                if predicate(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for agent state")
    }
}
