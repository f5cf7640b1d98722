//! The protocol message set.

use serde::{Deserialize, Serialize};

use skiff_id::{ExecutorId, FrameworkId, SlaveId, TaskId, UpdateId};

use crate::bus::Endpoint;
use crate::types::{ExecutorInfo, FrameworkInfo, SlaveInfo, StatusUpdate, Task, TaskInfo};

/// Every message that travels between the master, the agent, and
/// executors. One enum rather than per-pair types: receivers dispatch on
/// kind and count unexpected kinds as invalid traffic, the same way a
/// protobuf-over-bus protocol would.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // -------------------------------------------------------------------------
    // Master -> agent
    // -------------------------------------------------------------------------
    /// The master accepted our registration and assigned a slave id.
    Registered { slave_id: SlaveId },

    /// The master accepted our re-registration.
    Reregistered { slave_id: SlaveId },

    /// Launch a task on behalf of a framework.
    RunTask {
        framework_info: FrameworkInfo,
        framework_id: FrameworkId,
        /// The framework scheduler's endpoint, recorded for direct traffic.
        pid: Endpoint,
        task: TaskInfo,
    },

    /// Kill a task. Sent master -> agent and forwarded agent -> executor.
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },

    /// Tear down everything belonging to a framework.
    ShutdownFramework { framework_id: FrameworkId },

    /// The framework scheduler failed over to a new endpoint.
    UpdateFramework {
        framework_id: FrameworkId,
        pid: Endpoint,
    },

    /// Opaque data from a scheduler for one of its executors.
    SchedulerMessage {
        slave_id: SlaveId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },

    /// The master acknowledges a status update on behalf of a framework.
    StatusUpdateAcknowledgement {
        slave_id: SlaveId,
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
    },

    /// Keepalive probe.
    Ping,

    // -------------------------------------------------------------------------
    // Agent -> master
    // -------------------------------------------------------------------------
    /// First-time registration announcing the slave.
    RegisterSlave { slave: SlaveInfo },

    /// Registration after a restart, carrying surviving state.
    ReregisterSlave {
        slave_id: SlaveId,
        slave: SlaveInfo,
        executors: Vec<ExecutorInfo>,
        tasks: Vec<Task>,
    },

    /// A (possibly retransmitted) task status update.
    StatusUpdate { update: StatusUpdate },

    /// Opaque data from an executor for its framework.
    ExecutorToFramework {
        slave_id: SlaveId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },

    /// Keepalive response.
    Pong,

    // -------------------------------------------------------------------------
    // Executor -> agent
    // -------------------------------------------------------------------------
    /// A freshly launched executor announces itself.
    RegisterExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    },

    /// A surviving executor reconnects after an agent restart, reporting
    /// the tasks and updates it still knows about.
    ReregisterExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        tasks: Vec<Task>,
        updates: Vec<StatusUpdate>,
    },

    // -------------------------------------------------------------------------
    // Agent -> executor
    // -------------------------------------------------------------------------
    /// Hand a queued task to its (now running) executor.
    RunTaskToExecutor { task: TaskInfo },

    /// Ask a recovered executor to re-register.
    ReconnectExecutor { slave_id: SlaveId },

    /// Opaque data from a scheduler, forwarded to the executor.
    FrameworkToExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },

    /// The agent has durably handled an update; the executor may drop it.
    StatusUpdateAcknowledged {
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
    },

    /// Soft shutdown request (phase one of the two-phase shutdown).
    ShutdownExecutor,

    // -------------------------------------------------------------------------
    // Bus-synthesised
    // -------------------------------------------------------------------------
    /// A linked endpoint went away.
    Exited { endpoint: Endpoint },
}

impl Message {
    /// Short kind name for logging and statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Registered { .. } => "registered",
            Message::Reregistered { .. } => "reregistered",
            Message::RunTask { .. } => "run_task",
            Message::KillTask { .. } => "kill_task",
            Message::ShutdownFramework { .. } => "shutdown_framework",
            Message::UpdateFramework { .. } => "update_framework",
            Message::SchedulerMessage { .. } => "scheduler_message",
            Message::StatusUpdateAcknowledgement { .. } => "status_update_acknowledgement",
            Message::Ping => "ping",
            Message::RegisterSlave { .. } => "register_slave",
            Message::ReregisterSlave { .. } => "reregister_slave",
            Message::StatusUpdate { .. } => "status_update",
            Message::ExecutorToFramework { .. } => "executor_to_framework",
            Message::Pong => "pong",
            Message::RegisterExecutor { .. } => "register_executor",
            Message::ReregisterExecutor { .. } => "reregister_executor",
            Message::RunTaskToExecutor { .. } => "run_task_to_executor",
            Message::ReconnectExecutor { .. } => "reconnect_executor",
            Message::FrameworkToExecutor { .. } => "framework_to_executor",
            Message::StatusUpdateAcknowledged { .. } => "status_update_acknowledged",
            Message::ShutdownExecutor => "shutdown_executor",
            Message::Exited { .. } => "exited",
        }
    }
}
