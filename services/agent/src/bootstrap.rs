//! Wires the agent and its support actors together.
//!
//! One call builds the whole per-node runtime: the garbage collector,
//! the resource monitor, the status-update manager, the agent actor
//! itself, and the pumps that turn bus traffic, isolator exits, and
//! detector appointments into agent events.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use skiff_messages::{Endpoint, MessageBus};

use crate::actors::{mailbox, spawn, spawn_on, ActorHandle, ActorRef};
use crate::agent::{Agent, AgentEvent, AgentSnapshot, SLAVE_ENDPOINT};
use crate::config::Flags;
use crate::detector::MasterDetector;
use crate::gc::{GarbageCollector, GcHandle};
use crate::isolator::Isolator;
use crate::monitor::{MonitorHandle, ResourceMonitor};
use crate::status_update::StatusUpdateManager;

/// A running agent and the levers to drive it.
pub struct AgentRuntime {
    pub handle: ActorHandle<AgentEvent>,
    pub endpoint: Endpoint,
    agent_ref: ActorRef,
    support: Vec<ActorRef>,
    pumps: Vec<JoinHandle<()>>,
    exit: oneshot::Receiver<Result<(), String>>,
}

impl AgentRuntime {
    /// Builds and starts everything.
    pub fn start(
        flags: Flags,
        bus: MessageBus,
        isolator: Arc<dyn Isolator>,
        detector: &dyn MasterDetector,
    ) -> Self {
        let slave_mailbox = bus.register(SLAVE_ENDPOINT);
        let endpoint = slave_mailbox.endpoint().clone();

        let (agent_handle, agent_mailbox) = mailbox::<AgentEvent>("agent");

        let (gc_handle, gc_ref) = spawn(GarbageCollector::new());
        let (monitor_handle, monitor_ref) = spawn(ResourceMonitor::new(isolator.clone()));
        let (updates_handle, updates_ref) = spawn(StatusUpdateManager::new(
            flags.meta_dir(),
            flags.strict,
            flags.status_update_retry_interval,
            bus.clone(),
            endpoint.clone(),
            agent_handle.clone(),
        ));

        let mut pumps = Vec::new();

        // Bus traffic -> agent events.
        {
            let handle = agent_handle.clone();
            let mut slave_mailbox = slave_mailbox;
            pumps.push(tokio::spawn(async move {
                while let Some(envelope) = slave_mailbox.recv().await {
                    if handle.send(AgentEvent::Protocol(envelope)).is_err() {
                        break;
                    }
                }
            }));
        }

        // Isolator exits -> agent events.
        if let Some(mut exits) = isolator.take_exits() {
            let handle = agent_handle.clone();
            pumps.push(tokio::spawn(async move {
                while let Some(exit) = exits.recv().await {
                    let sent = handle.send(AgentEvent::ExecutorTerminated {
                        container: exit.container,
                        status: exit.status,
                        destroyed: exit.destroyed,
                        message: exit.message,
                    });
                    if sent.is_err() {
                        break;
                    }
                }
            }));
        }

        // Detector appointments -> agent events.
        {
            let handle = agent_handle.clone();
            let mut appointments = detector.subscribe();
            pumps.push(tokio::spawn(async move {
                let initial = appointments.borrow_and_update().clone();
                if handle.send(AgentEvent::MasterChanged(initial)).is_err() {
                    return;
                }
                while appointments.changed().await.is_ok() {
                    let master = appointments.borrow_and_update().clone();
                    if handle.send(AgentEvent::MasterChanged(master)).is_err() {
                        break;
                    }
                }
            }));
        }

        let (exit_tx, exit) = oneshot::channel();
        let agent = Agent::new(
            flags,
            bus,
            endpoint.clone(),
            isolator,
            GcHandle::new(gc_handle),
            MonitorHandle::new(monitor_handle),
            updates_handle,
            exit_tx,
        );
        let agent_ref = spawn_on(agent, agent_mailbox);

        Self {
            handle: agent_handle,
            endpoint,
            agent_ref,
            support: vec![gc_ref, monitor_ref, updates_ref],
            pumps,
            exit,
        }
    }

    /// Asks the agent to shut down cleanly.
    pub fn shutdown(&self) {
        let _ = self.handle.send(AgentEvent::Shutdown);
    }

    /// A point-in-time view of the agent's records, for inspection.
    pub async fn inspect(&self) -> Option<AgentSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.handle.send(AgentEvent::Inspect { reply }).ok()?;
        rx.await.ok()
    }

    /// Kills the whole runtime without any shutdown protocol, as a
    /// crash would. Checkpointed state stays on disk; bus endpoints are
    /// torn down.
    pub fn crash(self) {
        self.agent_ref.abort();
        for actor in &self.support {
            actor.abort();
        }
        for pump in &self.pumps {
            pump.abort();
        }
    }

    /// Waits for the agent to stop. `Err` carries a fatal error (e.g. a
    /// strict-mode recovery failure) and maps to a non-zero exit.
    pub async fn wait(self) -> Result<(), String> {
        let result = self.exit.await.unwrap_or(Ok(()));

        self.agent_ref.stop();
        self.agent_ref.wait().await;
        for actor in &self.support {
            actor.stop();
        }
        for pump in &self.pumps {
            pump.abort();
        }

        result
    }
}
