//! The node agent: the top-level state machine.
//!
//! The agent is one actor. Everything that happens to it (protocol
//! traffic from the master and executors, master detection, isolator
//! completions and exits, timer expiries, completions from the
//! status-update manager, the recovery result) arrives in its mailbox
//! as an [`AgentEvent`] and is handled one at a time. Handlers that
//! start asynchronous work (an isolator launch, a GC unschedule, the
//! disk probe) hand their continuation back to the mailbox and
//! re-validate the records they touch when it arrives, so a record torn
//! down in the meantime turns the continuation into a no-op.
//!
//! ## States
//!
//! ```text
//! RECOVERING ──▶ DISCONNECTED ──▶ RUNNING ──▶ TERMINATING
//!                     ▲              │
//!                     └──────────────┘  (master loss / failover)
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use skiff_id::{FrameworkId, RunId, SlaveId, TaskId, UpdateId};
use skiff_messages::{
    CommandInfo, Endpoint, Envelope, ExecutorInfo, FrameworkInfo, Message, MessageBus, SlaveInfo,
    StatusUpdate, Task, TaskInfo, TaskState,
};
use skiff_resources::Resources;

use crate::actors::{Actor, ActorContext, ActorError, ActorHandle, BackoffPolicy};
use crate::checkpoint::{self, Record};
use crate::config::{Flags, RecoveryMode, MAX_COMPLETED_FRAMEWORKS};
use crate::executor::{synthesised_status, ExecutorRecord, ExecutorState};
use crate::framework::{FrameworkRecord, FrameworkState};
use crate::gc::GcHandle;
use crate::isolator::{ContainerId, Isolator};
use crate::monitor::MonitorHandle;
use crate::paths;
use crate::state::{self, FrameworkRunState, SlaveState};
use crate::status_update::UpdateManagerMessage;

/// The well-known endpoint name the agent registers on the bus.
pub const SLAVE_ENDPOINT: &str = "slave";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Replaying checkpoints and reconciling with executors.
    Recovering,
    /// Not connected to a master.
    Disconnected,
    /// (Re-)registered with the master.
    Running,
    /// Shutting down.
    Terminating,
}

/// Message and task counters, surfaced through [`AgentSnapshot`].
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub tasks: BTreeMap<TaskState, u64>,
    pub valid_status_updates: u64,
    pub invalid_status_updates: u64,
    pub valid_framework_messages: u64,
    pub invalid_framework_messages: u64,
}

/// Everything that can happen to the agent.
#[derive(Debug)]
pub enum AgentEvent {
    /// Protocol traffic from the bus.
    Protocol(Envelope),

    /// The master detector announced (or withdrew) a master.
    MasterChanged(Option<Endpoint>),

    /// Reliable-registration retry timer.
    RegistrationTick { epoch: u64 },

    /// GC unscheduling for a task's executor directories finished.
    RunTaskReady {
        framework_id: FrameworkId,
        task: TaskInfo,
        executor_info: ExecutorInfo,
    },

    /// The isolator finished (or failed) launching an executor.
    ExecutorLaunched {
        container: ContainerId,
        result: Result<u32, String>,
    },

    /// An executor process went away.
    ExecutorTerminated {
        container: ContainerId,
        status: i32,
        destroyed: bool,
        message: String,
    },

    /// A launched executor failed to register in time.
    RegistrationTimeout { container: ContainerId },

    /// Phase two of the executor shutdown: force destroy.
    ShutdownTimeout { container: ContainerId },

    /// Recovered executors that have not re-registered are torn down.
    ReregisterTimeout,

    /// Disk-pressure probe timer.
    CheckDiskUsage,

    /// Disk-pressure probe result.
    DiskUsage { result: Result<f64, String> },

    /// The status-update manager finished handling an update.
    UpdateHandled {
        update: StatusUpdate,
        source: Option<Endpoint>,
        result: Result<(), String>,
    },

    /// The status-update manager processed an acknowledgement;
    /// `Ok(true)` means the stream is complete.
    AckHandled {
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
        result: Result<bool, String>,
    },

    /// The checkpoint read finished.
    RecoveryComplete {
        result: Result<Option<Box<SlaveState>>, String>,
    },

    /// Clean shutdown request.
    Shutdown,

    /// Introspection for tests and the state endpoint.
    Inspect { reply: oneshot::Sender<AgentSnapshot> },
}

// -----------------------------------------------------------------------------
// Snapshots
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutorSnapshot {
    pub id: skiff_id::ExecutorId,
    pub run_id: RunId,
    pub state: ExecutorState,
    pub resources: Resources,
    pub queued: Vec<TaskId>,
    pub launched: Vec<TaskId>,
    pub terminated: Vec<TaskId>,
    pub completed: Vec<TaskId>,
}

#[derive(Debug, Clone)]
pub struct FrameworkSnapshot {
    pub id: FrameworkId,
    pub state: FrameworkState,
    pub executors: Vec<ExecutorSnapshot>,
    pub completed_executors: usize,
}

#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub state: AgentState,
    pub slave_id: Option<SlaveId>,
    pub master: Option<Endpoint>,
    pub stats: Stats,
    pub frameworks: Vec<FrameworkSnapshot>,
    pub completed_frameworks: usize,
}

// -----------------------------------------------------------------------------
// The agent
// -----------------------------------------------------------------------------

pub struct Agent {
    flags: Flags,
    state: AgentState,
    info: SlaveInfo,
    slave_id: Option<SlaveId>,
    master: Option<Endpoint>,
    frameworks: HashMap<FrameworkId, FrameworkRecord>,
    completed_frameworks: VecDeque<FrameworkRecord>,
    stats: Stats,
    bus: MessageBus,
    endpoint: Endpoint,
    isolator: Arc<dyn Isolator>,
    gc: GcHandle,
    monitor: MonitorHandle,
    updates: ActorHandle<UpdateManagerMessage>,
    registration_backoff: BackoffPolicy,
    registration_epoch: u64,
    registration_attempt: u32,
    exit_tx: Option<oneshot::Sender<Result<(), String>>>,
    stop_requested: bool,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flags: Flags,
        bus: MessageBus,
        endpoint: Endpoint,
        isolator: Arc<dyn Isolator>,
        gc: GcHandle,
        monitor: MonitorHandle,
        updates: ActorHandle<UpdateManagerMessage>,
        exit_tx: oneshot::Sender<Result<(), String>>,
    ) -> Self {
        let info = flags.slave_info();
        Self {
            flags,
            state: AgentState::Recovering,
            info,
            slave_id: None,
            master: None,
            frameworks: HashMap::new(),
            completed_frameworks: VecDeque::new(),
            stats: Stats::default(),
            bus,
            endpoint,
            isolator,
            gc,
            monitor,
            updates,
            registration_backoff: BackoffPolicy {
                base: std::time::Duration::from_secs(1),
                max: std::time::Duration::from_secs(60),
                jitter: 0.25,
            },
            registration_epoch: 0,
            registration_attempt: 0,
            exit_tx: Some(exit_tx),
            stop_requested: false,
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle helpers
    // -------------------------------------------------------------------------

    fn fatal(&mut self, message: String) {
        error!(message = %message, "Fatal agent error");
        if let Some(tx) = self.exit_tx.take() {
            let _ = tx.send(Err(message));
        }
        self.stop_requested = true;
    }

    fn finish(&mut self) {
        if let Some(tx) = self.exit_tx.take() {
            let _ = tx.send(Ok(()));
        }
        self.stop_requested = true;
    }

    fn send_to_master(&self, message: Message) {
        if let Some(master) = &self.master {
            self.bus.send(&self.endpoint, master, message);
        }
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    fn handle_recovery_complete(
        &mut self,
        result: Result<Option<Box<SlaveState>>, String>,
        ctx: &ActorContext<AgentEvent>,
    ) {
        let recovered = match result {
            Ok(recovered) => recovered,
            Err(e) => {
                if self.flags.strict {
                    self.fatal(format!("recovery failed: {e}"));
                    return;
                }
                warn!(error = %e, "Recovery failed, starting clean");
                None
            }
        };

        if let Some(slave_state) = recovered {
            if let Some(info) = &slave_state.info {
                if info != &self.info {
                    let message = format!(
                        "checkpointed slave info does not match (was {:?}, now {:?})",
                        info, self.info
                    );
                    if self.flags.strict {
                        self.fatal(message);
                        return;
                    }
                    warn!(message, "Discarding incompatible checkpointed state");
                    self.complete_recovery(ctx);
                    return;
                }
            }

            self.slave_id = Some(slave_state.slave_id);

            for framework_state in slave_state.frameworks.values() {
                self.recover_framework(framework_state);
            }

            let containers: Vec<ContainerId> = self
                .frameworks
                .values()
                .flat_map(|f| f.executors.values().map(|e| e.container_id()))
                .collect();
            {
                let isolator = self.isolator.clone();
                tokio::spawn(async move {
                    if let Err(e) = isolator.recover(&containers).await {
                        warn!(error = %e, "Isolator recovery failed");
                    }
                });
            }

            self.updates
                .send(UpdateManagerMessage::Recover { state: slave_state })
                .ok();

            match self.flags.recover {
                RecoveryMode::Reconnect => self.reconnect_executors(ctx),
                RecoveryMode::Cleanup => self.cleanup_executors(ctx),
            }
        }

        self.complete_recovery(ctx);
    }

    fn complete_recovery(&mut self, ctx: &ActorContext<AgentEvent>) {
        info!(
            slave_id = ?self.slave_id,
            frameworks = self.frameworks.len(),
            "Recovery complete"
        );
        self.state = AgentState::Disconnected;
        if self.master.is_some() {
            self.start_registration(ctx);
        }
    }

    fn recover_framework(&mut self, recovered: &FrameworkRunState) {
        let (Some(info), Some(pid)) = (recovered.info.clone(), recovered.pid.clone()) else {
            warn!(framework_id = %recovered.id, "Skipping recovered framework without info");
            return;
        };

        let mut framework = FrameworkRecord::new(recovered.id.clone(), info, pid);

        for executor_state in recovered.executors.values() {
            let Some(executor_info) = executor_state.info.clone() else {
                warn!(executor_id = %executor_state.id, "Skipping recovered executor without info");
                continue;
            };
            let Some(run) = executor_state.latest_run() else {
                warn!(executor_id = %executor_state.id, "Skipping recovered executor without runs");
                continue;
            };
            let Some(slave_id) = self.slave_id else {
                return;
            };

            let directory = paths::work_run_dir(
                &self.flags.work_dir,
                &slave_id,
                &framework.id,
                &executor_state.id,
                &run.id,
            );

            let mut executor = ExecutorRecord::new(
                framework.id.clone(),
                executor_info,
                run.id,
                directory,
                true,
            );
            executor.recovered = true;
            executor.endpoint = run.endpoint.clone();

            for task_state in run.tasks.values() {
                executor.recover_task(task_state);
            }

            info!(
                framework_id = %framework.id,
                executor_id = %executor.id,
                run_id = %executor.run_id,
                tasks = executor.launched_tasks.len(),
                "Recovered executor"
            );

            framework.executors.insert(executor.id.clone(), executor);
        }

        self.frameworks.insert(framework.id.clone(), framework);
    }

    fn reconnect_executors(&mut self, ctx: &ActorContext<AgentEvent>) {
        let Some(slave_id) = self.slave_id else {
            return;
        };

        let mut waiting = 0usize;
        for framework in self.frameworks.values() {
            for executor in framework.executors.values() {
                if let Some(endpoint) = &executor.endpoint {
                    debug!(
                        executor_id = %executor.id,
                        endpoint = %endpoint,
                        "Asking executor to re-register"
                    );
                    self.bus.link(&self.endpoint, endpoint);
                    self.bus
                        .send(&self.endpoint, endpoint, Message::ReconnectExecutor { slave_id });
                    waiting += 1;
                }
            }
        }

        info!(waiting, "Waiting for executors to re-register");
        ctx.schedule(
            self.flags.executor_reregistration_timeout,
            AgentEvent::ReregisterTimeout,
        );
    }

    fn cleanup_executors(&mut self, ctx: &ActorContext<AgentEvent>) {
        let ids: Vec<(FrameworkId, skiff_id::ExecutorId)> = self
            .frameworks
            .values()
            .flat_map(|f| f.executors.keys().map(|e| (f.id.clone(), e.clone())))
            .collect();

        info!(executors = ids.len(), "Cleanup recovery: shutting down recovered executors");
        for (framework_id, executor_id) in ids {
            self.shutdown_executor(&framework_id, &executor_id, ctx);
        }
    }

    fn handle_reregister_timeout(&mut self, ctx: &ActorContext<AgentEvent>) {
        let stragglers: Vec<(FrameworkId, skiff_id::ExecutorId)> = self
            .frameworks
            .values()
            .flat_map(|f| {
                f.executors
                    .values()
                    .filter(|e| e.recovered && e.state == ExecutorState::Registering)
                    .map(|e| (f.id.clone(), e.id.clone()))
            })
            .collect();

        for (framework_id, executor_id) in stragglers {
            warn!(
                framework_id = %framework_id,
                executor_id = %executor_id,
                "Recovered executor did not re-register in time, shutting down"
            );
            self.shutdown_executor(&framework_id, &executor_id, ctx);
        }
    }

    // -------------------------------------------------------------------------
    // Master detection and registration
    // -------------------------------------------------------------------------

    fn handle_master_changed(&mut self, master: Option<Endpoint>, ctx: &ActorContext<AgentEvent>) {
        self.registration_epoch += 1;

        match master {
            Some(endpoint) => {
                info!(master = %endpoint, "New master detected");
                if self.state == AgentState::Running {
                    // Failover: re-register with the new master.
                    self.state = AgentState::Disconnected;
                    self.updates
                        .send(UpdateManagerMessage::NewMaster { master: None })
                        .ok();
                }
                self.bus.link(&self.endpoint, &endpoint);
                self.master = Some(endpoint);

                if self.state == AgentState::Disconnected {
                    self.start_registration(ctx);
                }
            }
            None => {
                info!("Lost master");
                self.master = None;
                if self.state == AgentState::Running {
                    self.state = AgentState::Disconnected;
                }
                self.updates
                    .send(UpdateManagerMessage::NewMaster { master: None })
                    .ok();
            }
        }
    }

    fn start_registration(&mut self, ctx: &ActorContext<AgentEvent>) {
        self.registration_epoch += 1;
        self.registration_attempt = 0;
        self.try_register(ctx);
    }

    /// One registration announcement plus the retry timer for the next.
    fn try_register(&mut self, ctx: &ActorContext<AgentEvent>) {
        if self.state != AgentState::Disconnected || self.master.is_none() {
            return;
        }

        let attempt = self.registration_attempt;
        match self.slave_id {
            None => {
                debug!(attempt, "Sending registration");
                self.send_to_master(Message::RegisterSlave {
                    slave: self.info.clone(),
                });
            }
            Some(slave_id) => {
                let mut executors = Vec::new();
                let mut tasks = Vec::new();
                for framework in self.frameworks.values() {
                    for executor in framework.executors.values() {
                        executors.push(executor.info.clone());
                        tasks.extend(executor.launched_tasks.values().cloned());
                        tasks.extend(executor.terminated_tasks.values().cloned());
                    }
                }
                debug!(attempt, executors = executors.len(), tasks = tasks.len(), "Sending re-registration");
                self.send_to_master(Message::ReregisterSlave {
                    slave_id,
                    slave: self.info.clone(),
                    executors,
                    tasks,
                });
            }
        }

        let delay = self.registration_backoff.delay(attempt);
        ctx.schedule(
            delay,
            AgentEvent::RegistrationTick {
                epoch: self.registration_epoch,
            },
        );
    }

    fn handle_registration_tick(&mut self, epoch: u64, ctx: &ActorContext<AgentEvent>) {
        if epoch != self.registration_epoch {
            return; // Superseded by a newer master or a registration.
        }
        self.registration_attempt += 1;
        self.try_register(ctx);
    }

    fn handle_registered(&mut self, slave_id: SlaveId, reregistration: bool) {
        match self.state {
            AgentState::Disconnected => {}
            AgentState::Running => {
                debug!("Ignoring duplicate registration acknowledgement");
                return;
            }
            _ => {
                warn!(state = ?self.state, "Ignoring registration in current state");
                return;
            }
        }

        if let Some(existing) = self.slave_id {
            if existing != slave_id {
                self.fatal(format!(
                    "master assigned slave id {slave_id} but this agent is {existing}"
                ));
                return;
            }
        }

        info!(slave_id = %slave_id, reregistration, "Registered with master");
        self.slave_id = Some(slave_id);
        self.state = AgentState::Running;
        self.registration_epoch += 1;

        if self.flags.checkpoint {
            let meta_dir = self.flags.meta_dir();
            if let Err(e) = checkpoint::checkpoint(
                &paths::latest_slave_path(&meta_dir),
                &Record::SlaveId { slave_id },
            )
            .and_then(|_| {
                checkpoint::checkpoint(
                    &paths::slave_info_path(&meta_dir, &slave_id),
                    &Record::SlaveInfo(self.info.clone()),
                )
            }) {
                if self.flags.strict {
                    self.fatal(format!("cannot checkpoint slave info: {e}"));
                    return;
                }
                warn!(error = %e, "Cannot checkpoint slave info");
            }
        }

        self.updates
            .send(UpdateManagerMessage::NewMaster {
                master: self.master.clone(),
            })
            .ok();
    }

    // -------------------------------------------------------------------------
    // Task launch path
    // -------------------------------------------------------------------------

    fn handle_run_task(
        &mut self,
        framework_info: FrameworkInfo,
        framework_id: FrameworkId,
        pid: Endpoint,
        task: TaskInfo,
        ctx: &ActorContext<AgentEvent>,
    ) {
        if self.state != AgentState::Running {
            warn!(task_id = %task.task_id, state = ?self.state, "Dropping task launch while not running");
            self.stats.invalid_framework_messages += 1;
            return;
        }

        info!(
            framework_id = %framework_id,
            task_id = %task.task_id,
            resources = %task.resources,
            "Got assigned task"
        );

        if !self.frameworks.contains_key(&framework_id) {
            if framework_info.checkpoint && self.flags.checkpoint {
                self.checkpoint_framework(&framework_id, &framework_info, &pid);
            }
            let framework =
                FrameworkRecord::new(framework_id.clone(), framework_info, pid.clone());
            self.frameworks.insert(framework_id.clone(), framework);
        }

        let framework = self
            .frameworks
            .get_mut(&framework_id)
            .expect("framework just ensured");
        framework.pid = pid;

        if framework.state == FrameworkState::Terminating {
            warn!(framework_id = %framework_id, task_id = %task.task_id, "Framework is terminating");
            self.synthesize_update(
                framework_id,
                task.task_id.clone(),
                TaskState::Lost,
                "framework is terminating",
            );
            return;
        }

        // The offer bookkeeping lives in the master; the agent enforces
        // containment against its own advertised bundle.
        if !self.info.resources.contains(&task.resources) {
            self.synthesize_update(
                framework_id,
                task.task_id.clone(),
                TaskState::Lost,
                "task resources exceed the slave's resources",
            );
            return;
        }

        let executor_info = match executor_info_for(&framework_id, &task) {
            Ok(info) => info,
            Err(message) => {
                self.synthesize_update(framework_id, task.task_id.clone(), TaskState::Lost, &message);
                return;
            }
        };

        let framework = self
            .frameworks
            .get_mut(&framework_id)
            .expect("framework ensured above");
        framework.add_pending(&executor_info.executor_id, task.task_id.clone());

        // Make sure a pending deletion of a previous incarnation's
        // directories cannot shadow the new executor's work directory.
        let unschedule_paths = self.slave_id.map(|slave_id| {
            vec![
                paths::work_executor_dir(
                    &self.flags.work_dir,
                    &slave_id,
                    &framework_id,
                    &executor_info.executor_id,
                ),
                paths::executor_dir(
                    &self.flags.meta_dir(),
                    &slave_id,
                    &framework_id,
                    &executor_info.executor_id,
                ),
            ]
        });

        let gc = self.gc.clone();
        let handle = ctx.self_handle();
        tokio::spawn(async move {
            for path in unschedule_paths.unwrap_or_default() {
                gc.unschedule(path).await;
            }
            let _ = handle.send(AgentEvent::RunTaskReady {
                framework_id,
                task,
                executor_info,
            });
        });
    }

    /// The second half of the task launch, after GC unscheduling. All
    /// records are re-validated: anything may have happened in between.
    fn handle_run_task_ready(
        &mut self,
        framework_id: FrameworkId,
        task: TaskInfo,
        executor_info: ExecutorInfo,
        ctx: &ActorContext<AgentEvent>,
    ) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            warn!(task_id = %task.task_id, "Framework removed while task launch was pending");
            return;
        };

        if !framework.remove_pending(&executor_info.executor_id, &task.task_id) {
            // Killed while pending; the kill path already answered.
            warn!(task_id = %task.task_id, "Task no longer pending, dropping launch");
            return;
        }

        if framework.state == FrameworkState::Terminating {
            self.synthesize_update(
                framework_id,
                task.task_id.clone(),
                TaskState::Lost,
                "framework is terminating",
            );
            return;
        }

        match framework.executor_mut(&executor_info.executor_id) {
            None => self.launch_executor(framework_id, executor_info, task, ctx),

            Some(executor) => match executor.state {
                ExecutorState::Registering => {
                    executor.add_task(task.clone());
                    self.checkpoint_queued_task(&framework_id, &executor_info.executor_id, &task);
                    info!(task_id = %task.task_id, "Queued task for registering executor");
                }

                ExecutorState::Running => {
                    executor.launch_task(&task, self.slave_id);
                    let endpoint = executor.endpoint.clone();
                    self.checkpoint_queued_task(&framework_id, &executor_info.executor_id, &task);
                    if let Some(endpoint) = endpoint {
                        self.bus.send(
                            &self.endpoint,
                            &endpoint,
                            Message::RunTaskToExecutor { task },
                        );
                    }
                }

                ExecutorState::Terminating | ExecutorState::Terminated => {
                    self.synthesize_update(
                        framework_id,
                        task.task_id.clone(),
                        TaskState::Lost,
                        "executor is terminating",
                    );
                }
            },
        }
    }

    fn launch_executor(
        &mut self,
        framework_id: FrameworkId,
        executor_info: ExecutorInfo,
        task: TaskInfo,
        ctx: &ActorContext<AgentEvent>,
    ) {
        let Some(slave_id) = self.slave_id else {
            warn!("Cannot launch executor without a slave id");
            return;
        };

        let run_id = RunId::new();
        let directory = paths::work_run_dir(
            &self.flags.work_dir,
            &slave_id,
            &framework_id,
            &executor_info.executor_id,
            &run_id,
        );

        if let Err(e) = std::fs::create_dir_all(&directory) {
            error!(directory = %directory.display(), error = %e, "Cannot create sandbox");
            self.synthesize_update(
                framework_id,
                task.task_id.clone(),
                TaskState::Lost,
                "cannot create executor sandbox",
            );
            return;
        }

        let framework = self
            .frameworks
            .get_mut(&framework_id)
            .expect("framework checked by caller");
        let checkpoint_executor = framework.checkpoints() && self.flags.checkpoint;

        let executor = match framework.launch_executor(
            executor_info.clone(),
            run_id,
            directory.clone(),
            checkpoint_executor,
        ) {
            Ok(executor) => executor,
            Err(e) => {
                warn!(error = %e, "Cannot launch executor");
                self.synthesize_update(
                    framework_id,
                    task.task_id.clone(),
                    TaskState::Lost,
                    "executor already exists",
                );
                return;
            }
        };

        executor.add_task(task.clone());
        let container = executor.container_id();

        info!(
            framework_id = %framework_id,
            executor_id = %executor_info.executor_id,
            run_id = %run_id,
            directory = %directory.display(),
            "Launching executor"
        );

        if checkpoint_executor {
            let meta_dir = self.flags.meta_dir();
            let result = checkpoint::checkpoint(
                &paths::executor_info_path(
                    &meta_dir,
                    &slave_id,
                    &framework_id,
                    &executor_info.executor_id,
                ),
                &Record::ExecutorInfo(executor_info.clone()),
            );
            self.handle_checkpoint_result(result);
            self.checkpoint_queued_task(&framework_id, &executor_info.executor_id, &task);
        }

        {
            let isolator = self.isolator.clone();
            let handle = ctx.self_handle();
            let container = container.clone();
            tokio::spawn(async move {
                let result = isolator
                    .launch(&container, &executor_info, &directory)
                    .await
                    .map_err(|e| e.to_string());
                let _ = handle.send(AgentEvent::ExecutorLaunched { container, result });
            });
        }

        ctx.schedule(
            self.flags.executor_registration_timeout,
            AgentEvent::RegistrationTimeout { container },
        );
    }

    fn handle_executor_launched(&mut self, container: ContainerId, result: Result<u32, String>) {
        let executor = executor_mut_by_container(&mut self.frameworks, &container);

        match (executor, result) {
            (Some(executor), Ok(pid)) => {
                if matches!(
                    executor.state,
                    ExecutorState::Terminating | ExecutorState::Terminated
                ) {
                    // Launch finished after the executor was given up on.
                    let isolator = self.isolator.clone();
                    tokio::spawn(async move {
                        let _ = isolator.destroy(&container).await;
                    });
                    return;
                }
                debug!(container = %container, pid, "Executor started");
                executor.os_pid = Some(pid);
            }
            (Some(_), Err(e)) => {
                error!(container = %container, error = %e, "Executor launch failed");
                self.handle_executor_terminated(
                    container,
                    -1,
                    false,
                    format!("executor launch failed: {e}"),
                );
            }
            (None, Ok(_)) => {
                // The records are gone; the process must not linger.
                let isolator = self.isolator.clone();
                tokio::spawn(async move {
                    let _ = isolator.destroy(&container).await;
                });
            }
            (None, Err(_)) => {}
        }
    }

    // -------------------------------------------------------------------------
    // Executor registration and teardown
    // -------------------------------------------------------------------------

    fn handle_register_executor(
        &mut self,
        framework_id: FrameworkId,
        executor_id: skiff_id::ExecutorId,
        from: Endpoint,
    ) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            warn!(framework_id = %framework_id, "Executor registered for unknown framework");
            self.bus.send(&self.endpoint, &from, Message::ShutdownExecutor);
            return;
        };

        let Some(executor) = framework.executor_mut(&executor_id) else {
            warn!(executor_id = %executor_id, "Unknown executor registered");
            self.bus.send(&self.endpoint, &from, Message::ShutdownExecutor);
            return;
        };

        if executor.state != ExecutorState::Registering {
            warn!(
                executor_id = %executor_id,
                state = ?executor.state,
                "Executor registered in unexpected state"
            );
            self.bus.send(&self.endpoint, &from, Message::ShutdownExecutor);
            return;
        }

        info!(framework_id = %framework_id, executor_id = %executor_id, endpoint = %from, "Executor registered");

        executor.state = ExecutorState::Running;
        executor.endpoint = Some(from.clone());
        let container = executor.container_id();
        let run_id = executor.run_id;
        let checkpoint_endpoint = executor.checkpoint;
        let infos = executor.flush_queued(self.slave_id);

        self.bus.link(&self.endpoint, &from);
        self.monitor.watch(container);

        if checkpoint_endpoint {
            if let Some(slave_id) = self.slave_id {
                let result = checkpoint::checkpoint(
                    &paths::run_endpoint_path(
                        &self.flags.meta_dir(),
                        &slave_id,
                        &framework_id,
                        &executor_id,
                        &run_id,
                    ),
                    &Record::ExecutorEndpoint {
                        endpoint: from.clone(),
                    },
                );
                self.handle_checkpoint_result(result);
            }
        }

        for task in infos {
            debug!(task_id = %task.task_id, "Flushing queued task to executor");
            self.bus
                .send(&self.endpoint, &from, Message::RunTaskToExecutor { task });
        }
    }

    fn handle_reregister_executor(
        &mut self,
        framework_id: FrameworkId,
        executor_id: skiff_id::ExecutorId,
        tasks: Vec<Task>,
        updates: Vec<StatusUpdate>,
        from: Endpoint,
    ) {
        let executor = self
            .frameworks
            .get_mut(&framework_id)
            .and_then(|f| f.executor_mut(&executor_id));

        let Some(executor) = executor else {
            warn!(executor_id = %executor_id, "Unknown executor tried to re-register");
            self.bus.send(&self.endpoint, &from, Message::ShutdownExecutor);
            return;
        };

        if !executor.recovered || executor.state != ExecutorState::Registering {
            warn!(
                executor_id = %executor_id,
                state = ?executor.state,
                "Executor re-registered in unexpected state"
            );
            self.bus.send(&self.endpoint, &from, Message::ShutdownExecutor);
            return;
        }

        info!(
            framework_id = %framework_id,
            executor_id = %executor_id,
            tasks = tasks.len(),
            replayed_updates = updates.len(),
            "Executor re-registered"
        );

        executor.state = ExecutorState::Running;
        executor.endpoint = Some(from.clone());

        // Trust the executor's view of still-running tasks.
        for reported in tasks {
            if let Some(known) = executor.launched_tasks.get_mut(&reported.task_id) {
                known.state = reported.state;
                known.latest_status = reported.latest_status;
            }
        }

        let container = executor.container_id();
        self.bus.link(&self.endpoint, &from);
        self.monitor.watch(container);
    }

    fn shutdown_executor(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &skiff_id::ExecutorId,
        ctx: &ActorContext<AgentEvent>,
    ) {
        let Some(executor) = self
            .frameworks
            .get_mut(framework_id)
            .and_then(|f| f.executor_mut(executor_id))
        else {
            return;
        };

        if matches!(
            executor.state,
            ExecutorState::Terminating | ExecutorState::Terminated
        ) {
            return;
        }

        info!(framework_id = %framework_id, executor_id = %executor_id, "Shutting down executor");
        executor.state = ExecutorState::Terminating;

        if let Some(endpoint) = executor.endpoint.clone() {
            self.bus
                .send(&self.endpoint, &endpoint, Message::ShutdownExecutor);
        }

        // Phase two: force destroy if it has not exited by then. The
        // container id carries the run id, so a timer outliving this
        // incarnation cannot touch the next one.
        ctx.schedule(
            self.flags.executor_shutdown_grace_period,
            AgentEvent::ShutdownTimeout {
                container: executor.container_id(),
            },
        );
    }

    fn handle_registration_timeout(&mut self, container: ContainerId, ctx: &ActorContext<AgentEvent>) {
        let still_registering = executor_mut_by_container(&mut self.frameworks, &container)
            .map(|e| e.state == ExecutorState::Registering && !e.recovered)
            .unwrap_or(false);

        if still_registering {
            warn!(container = %container, "Executor did not register in time, shutting down");
            let ContainerId {
                framework_id,
                executor_id,
                ..
            } = container;
            self.shutdown_executor(&framework_id, &executor_id, ctx);
        }
    }

    fn handle_shutdown_timeout(&mut self, container: ContainerId) {
        let still_terminating = executor_mut_by_container(&mut self.frameworks, &container)
            .map(|e| e.state == ExecutorState::Terminating)
            .unwrap_or(false);

        if still_terminating {
            warn!(container = %container, "Executor did not exit in time, destroying");
            let isolator = self.isolator.clone();
            tokio::spawn(async move {
                if let Err(e) = isolator.destroy(&container).await {
                    warn!(container = %container, error = %e, "Isolator destroy failed");
                }
            });
        }
    }

    fn handle_executor_terminated(
        &mut self,
        container: ContainerId,
        status: i32,
        destroyed: bool,
        message: String,
    ) {
        let framework_terminating = self
            .frameworks
            .get(&container.framework_id)
            .map(|f| f.state == FrameworkState::Terminating)
            .unwrap_or(false);

        let Some(executor) = executor_mut_by_container(&mut self.frameworks, &container) else {
            debug!(container = %container, "Exit for unknown executor run");
            return;
        };

        info!(
            container = %container,
            status,
            destroyed,
            message = %message,
            "Executor terminated"
        );

        executor.state = ExecutorState::Terminated;
        executor.endpoint = None;

        // Every task the executor still answered for is now lost (or
        // failed, if we destroyed it).
        let live: Vec<TaskId> = executor
            .queued_tasks
            .keys()
            .chain(executor.launched_tasks.keys())
            .cloned()
            .collect();

        let terminal = if destroyed {
            TaskState::Failed
        } else {
            TaskState::Lost
        };

        if framework_terminating {
            // The framework's update streams were dropped; nobody will
            // acknowledge. Resolve the tasks locally.
            for task_id in live {
                let status = synthesised_status(
                    task_id.clone(),
                    terminal,
                    &format!("executor terminated: {message}"),
                );
                executor.terminate_task(&task_id, status);
                executor.complete_task(&task_id);
            }
            self.monitor.unwatch(container.clone());
        } else {
            self.monitor.unwatch(container.clone());
            for task_id in live {
                self.synthesize_update(
                    container.framework_id.clone(),
                    task_id,
                    terminal,
                    &format!("executor terminated: {message}"),
                );
            }
        }

        self.try_remove_executor(&container.framework_id, &container.executor_id);
    }

    /// Removes the executor once its process has exited and every
    /// terminal update has been acknowledged; then the framework, if it
    /// was terminating and this was its last executor.
    fn try_remove_executor(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &skiff_id::ExecutorId,
    ) {
        let Some(framework) = self.frameworks.get_mut(framework_id) else {
            return;
        };
        let Some(executor) = framework.executor(executor_id) else {
            return;
        };

        if executor.state != ExecutorState::Terminated || executor.has_incomplete_tasks() {
            return;
        }

        let run_id = executor.run_id;
        let checkpointed = executor.checkpoint;
        self.monitor.unwatch(ContainerId {
            framework_id: framework_id.clone(),
            executor_id: executor_id.clone(),
            run_id,
        });

        framework.destroy_executor(executor_id);
        info!(framework_id = %framework_id, executor_id = %executor_id, "Removed executor");

        if let Some(slave_id) = self.slave_id {
            let work = &self.flags.work_dir;
            self.gc.schedule(
                paths::work_run_dir(work, &slave_id, framework_id, executor_id, &run_id),
                self.flags.gc_delay,
            );
            self.gc.schedule(
                paths::work_executor_dir(work, &slave_id, framework_id, executor_id),
                self.flags.gc_delay,
            );
            if checkpointed {
                let meta = self.flags.meta_dir();
                self.gc.schedule(
                    paths::run_dir(&meta, &slave_id, framework_id, executor_id, &run_id),
                    self.flags.gc_delay,
                );
                self.gc.schedule(
                    paths::executor_dir(&meta, &slave_id, framework_id, executor_id),
                    self.flags.gc_delay,
                );
            }
        }

        let framework = self
            .frameworks
            .get(framework_id)
            .expect("framework checked above");
        if framework.state == FrameworkState::Terminating
            && framework.executors.is_empty()
            && !framework.has_pending()
        {
            self.remove_framework(framework_id.clone());
        }
    }

    fn remove_framework(&mut self, framework_id: FrameworkId) {
        let Some(framework) = self.frameworks.remove(&framework_id) else {
            return;
        };

        info!(framework_id = %framework_id, "Removed framework");

        if let Some(slave_id) = self.slave_id {
            self.gc.schedule(
                paths::work_framework_dir(&self.flags.work_dir, &slave_id, &framework_id),
                self.flags.gc_delay,
            );
            if framework.checkpoints() && self.flags.checkpoint {
                self.gc.schedule(
                    paths::framework_dir(&self.flags.meta_dir(), &slave_id, &framework_id),
                    self.flags.gc_delay,
                );
            }
        }

        if self.completed_frameworks.len() >= MAX_COMPLETED_FRAMEWORKS {
            self.completed_frameworks.pop_front();
        }
        self.completed_frameworks.push_back(framework);

        if self.state == AgentState::Terminating && self.frameworks.is_empty() {
            info!("Last framework removed, terminating");
            self.finish();
        }
    }

    // -------------------------------------------------------------------------
    // Status updates
    // -------------------------------------------------------------------------

    fn handle_status_update(&mut self, mut update: StatusUpdate, source: Option<Endpoint>) {
        let task_id = update.status.task_id.clone();

        let Some(framework) = self.frameworks.get_mut(&update.framework_id) else {
            warn!(
                framework_id = %update.framework_id,
                task_id = %task_id,
                "Status update for unknown framework"
            );
            self.stats.invalid_status_updates += 1;
            return;
        };

        // Updates for a framework being torn down are dropped by
        // policy: its streams are discarded and nobody is listening.
        if framework.state == FrameworkState::Terminating {
            warn!(
                framework_id = %update.framework_id,
                task_id = %task_id,
                "Dropping status update for terminating framework"
            );
            self.stats.invalid_status_updates += 1;
            return;
        }

        let checkpoint_framework = framework.checkpoints();
        update.slave_id = self.slave_id;

        let (run_id, checkpoint) = match framework.executor_by_task_mut(&task_id) {
            Some(executor) => {
                update.executor_id = Some(executor.id.clone());
                if update.status.state.is_terminal() {
                    executor.terminate_task(&task_id, update.status.clone());
                } else {
                    executor.update_task_state(&update.status);
                }
                (
                    Some(executor.run_id),
                    checkpoint_framework && executor.checkpoint,
                )
            }
            // A task that never reached an executor (dropped launch);
            // forwarded without durable logging.
            None => (None, false),
        };

        debug!(
            framework_id = %update.framework_id,
            task_id = %task_id,
            state = %update.status.state,
            "Handling status update"
        );

        *self.stats.tasks.entry(update.status.state).or_insert(0) += 1;
        self.stats.valid_status_updates += 1;

        self.updates
            .send(UpdateManagerMessage::Update {
                update,
                source,
                run_id,
                checkpoint: checkpoint && self.flags.checkpoint,
            })
            .ok();
    }

    /// Builds and routes a status update the agent must answer with
    /// itself (dropped launches, lost executors).
    fn synthesize_update(
        &mut self,
        framework_id: FrameworkId,
        task_id: TaskId,
        state: TaskState,
        message: &str,
    ) {
        let update = StatusUpdate::new(
            framework_id,
            None,
            self.slave_id,
            synthesised_status(task_id, state, message),
        );
        self.handle_status_update(update, None);
    }

    fn handle_update_handled(
        &mut self,
        update: StatusUpdate,
        source: Option<Endpoint>,
        result: Result<(), String>,
    ) {
        if let Err(e) = result {
            if self.flags.strict {
                self.fatal(format!("status update handling failed: {e}"));
                return;
            }
            warn!(error = %e, "Status update handling failed");
            return;
        }

        // Acknowledge the executor so it can drop the update, provided
        // it is still the executor we heard it from.
        let Some(source) = source else {
            return;
        };
        let endpoint_matches = self
            .frameworks
            .get(&update.framework_id)
            .and_then(|f| update.executor_id.as_ref().and_then(|id| f.executor(id)))
            .map(|e| e.endpoint.as_ref() == Some(&source))
            .unwrap_or(false);

        if endpoint_matches {
            self.bus.send(
                &self.endpoint,
                &source,
                Message::StatusUpdateAcknowledged {
                    framework_id: update.framework_id.clone(),
                    task_id: update.status.task_id.clone(),
                    update_id: update.update_id,
                },
            );
        }
    }

    fn handle_acknowledgement(
        &mut self,
        slave_id: SlaveId,
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
    ) {
        if self.slave_id != Some(slave_id) {
            warn!(slave_id = %slave_id, "Acknowledgement for a different slave");
            self.stats.invalid_status_updates += 1;
            return;
        }

        self.updates
            .send(UpdateManagerMessage::Acknowledgement {
                framework_id,
                task_id,
                update_id,
            })
            .ok();
    }

    fn handle_ack_handled(
        &mut self,
        framework_id: FrameworkId,
        task_id: TaskId,
        result: Result<bool, String>,
    ) {
        let stream_complete = match result {
            Ok(complete) => complete,
            Err(e) => {
                warn!(
                    framework_id = %framework_id,
                    task_id = %task_id,
                    error = %e,
                    "Dropping invalid acknowledgement"
                );
                self.stats.invalid_status_updates += 1;
                return;
            }
        };

        if !stream_complete {
            return;
        }

        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            return;
        };
        let Some(executor) = framework.executor_by_task_mut(&task_id) else {
            return;
        };

        executor.complete_task(&task_id);
        let executor_id = executor.id.clone();
        self.try_remove_executor(&framework_id, &executor_id);
    }

    // -------------------------------------------------------------------------
    // Kill / shutdown / messages
    // -------------------------------------------------------------------------

    fn handle_kill_task(&mut self, framework_id: FrameworkId, task_id: TaskId) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            warn!(framework_id = %framework_id, task_id = %task_id, "Kill for unknown framework");
            // Nothing to route through the reliable path; answer the
            // master directly, best effort.
            let update = StatusUpdate::new(
                framework_id,
                None,
                self.slave_id,
                synthesised_status(task_id, TaskState::Lost, "cannot find framework"),
            );
            self.send_to_master(Message::StatusUpdate { update });
            self.stats.invalid_framework_messages += 1;
            return;
        };

        // A task still pending validation: forget it; the launch
        // continuation will find it gone.
        let pending_executor = framework
            .pending
            .iter()
            .find(|(_, tasks)| tasks.contains(&task_id))
            .map(|(executor_id, _)| executor_id.clone());
        if let Some(executor_id) = pending_executor {
            framework.remove_pending(&executor_id, &task_id);
            self.synthesize_update(
                framework_id,
                task_id,
                TaskState::Killed,
                "killed before launch",
            );
            return;
        }

        let Some(executor) = framework.executor_by_task_mut(&task_id) else {
            warn!(task_id = %task_id, "Kill for unknown task");
            self.synthesize_update(framework_id, task_id, TaskState::Lost, "cannot find task");
            return;
        };

        match executor.state {
            ExecutorState::Registering => {
                // Not launched yet; answer for it ourselves.
                self.synthesize_update(
                    framework_id,
                    task_id,
                    TaskState::Killed,
                    "killed before executor registered",
                );
            }
            ExecutorState::Running => {
                if let Some(endpoint) = executor.endpoint.clone() {
                    self.bus.send(
                        &self.endpoint,
                        &endpoint,
                        Message::KillTask {
                            framework_id,
                            task_id,
                        },
                    );
                }
            }
            ExecutorState::Terminating | ExecutorState::Terminated => {
                debug!(task_id = %task_id, "Executor already terminating, exit will resolve the task");
            }
        }
    }

    fn handle_shutdown_framework(&mut self, framework_id: FrameworkId, ctx: &ActorContext<AgentEvent>) {
        let Some(framework) = self.frameworks.get_mut(&framework_id) else {
            warn!(framework_id = %framework_id, "Shutdown for unknown framework");
            return;
        };

        info!(framework_id = %framework_id, "Shutting down framework");
        framework.state = FrameworkState::Terminating;
        framework.pending.clear();

        self.updates
            .send(UpdateManagerMessage::DropFramework {
                framework_id: framework_id.clone(),
            })
            .ok();

        let executor_ids: Vec<skiff_id::ExecutorId> =
            self.frameworks[&framework_id].executors.keys().cloned().collect();

        if executor_ids.is_empty() {
            self.remove_framework(framework_id);
            return;
        }

        for executor_id in executor_ids {
            self.shutdown_executor(&framework_id, &executor_id, ctx);
        }
    }

    fn handle_scheduler_message(
        &mut self,
        slave_id: SlaveId,
        framework_id: FrameworkId,
        executor_id: skiff_id::ExecutorId,
        data: Vec<u8>,
    ) {
        let endpoint = if self.slave_id == Some(slave_id) {
            self.frameworks
                .get(&framework_id)
                .and_then(|f| f.executor(&executor_id))
                .filter(|e| e.state == ExecutorState::Running)
                .and_then(|e| e.endpoint.clone())
        } else {
            None
        };

        let Some(endpoint) = endpoint else {
            warn!(
                framework_id = %framework_id,
                executor_id = %executor_id,
                "Dropping scheduler message"
            );
            self.stats.invalid_framework_messages += 1;
            return;
        };

        self.bus.send(
            &self.endpoint,
            &endpoint,
            Message::FrameworkToExecutor {
                framework_id,
                executor_id,
                data,
            },
        );
        self.stats.valid_framework_messages += 1;
    }

    fn handle_executor_message(
        &mut self,
        framework_id: FrameworkId,
        executor_id: skiff_id::ExecutorId,
        data: Vec<u8>,
    ) {
        let (Some(slave_id), Some(_)) = (self.slave_id, self.master.as_ref()) else {
            self.stats.invalid_framework_messages += 1;
            return;
        };

        self.send_to_master(Message::ExecutorToFramework {
            slave_id,
            framework_id,
            executor_id,
            data,
        });
        self.stats.valid_framework_messages += 1;
    }

    // -------------------------------------------------------------------------
    // Disk watch
    // -------------------------------------------------------------------------

    fn handle_check_disk_usage(&mut self, ctx: &ActorContext<AgentEvent>) {
        let work_dir = self.flags.work_dir.clone();
        let handle = ctx.self_handle();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || crate::system::disk_usage(&work_dir))
                .await
                .map_err(|e| e.to_string())
                .and_then(|r| r.map_err(|e| e.to_string()));
            let _ = handle.send(AgentEvent::DiskUsage { result });
        });

        ctx.schedule(self.flags.disk_watch_interval, AgentEvent::CheckDiskUsage);
    }

    fn handle_disk_usage(&mut self, result: Result<f64, String>) {
        match result {
            Ok(usage) => {
                // The fuller the disk, the shorter directories may live.
                let age = self.flags.gc_delay.mul_f64((1.0 - usage).clamp(0.0, 1.0));
                debug!(usage, allowed_age_secs = age.as_secs(), "Disk usage sampled");
                self.gc.prune(age);
            }
            Err(e) => {
                warn!(error = %e, "Disk usage probe failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown and snapshot
    // -------------------------------------------------------------------------

    fn handle_shutdown(&mut self, ctx: &ActorContext<AgentEvent>) {
        info!("Agent shutting down");
        self.state = AgentState::Terminating;

        let framework_ids: Vec<FrameworkId> = self.frameworks.keys().cloned().collect();
        if framework_ids.is_empty() {
            self.finish();
            return;
        }

        for framework_id in framework_ids {
            self.handle_shutdown_framework(framework_id, ctx);
        }

        if self.frameworks.is_empty() {
            self.finish();
        }
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            state: self.state,
            slave_id: self.slave_id,
            master: self.master.clone(),
            stats: self.stats.clone(),
            completed_frameworks: self.completed_frameworks.len(),
            frameworks: self
                .frameworks
                .values()
                .map(|framework| FrameworkSnapshot {
                    id: framework.id.clone(),
                    state: framework.state,
                    completed_executors: framework.completed_executors.len(),
                    executors: framework
                        .executors
                        .values()
                        .map(|executor| ExecutorSnapshot {
                            id: executor.id.clone(),
                            run_id: executor.run_id,
                            state: executor.state,
                            resources: executor.resources.clone(),
                            queued: executor.queued_tasks.keys().cloned().collect(),
                            launched: executor.launched_tasks.keys().cloned().collect(),
                            terminated: executor.terminated_tasks.keys().cloned().collect(),
                            completed: executor
                                .completed_tasks
                                .iter()
                                .map(|t| t.task_id.clone())
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    // -------------------------------------------------------------------------
    // Checkpointing helpers
    // -------------------------------------------------------------------------

    fn checkpoint_framework(
        &mut self,
        framework_id: &FrameworkId,
        info: &FrameworkInfo,
        pid: &Endpoint,
    ) {
        let Some(slave_id) = self.slave_id else {
            return;
        };
        let meta_dir = self.flags.meta_dir();
        let result = checkpoint::checkpoint(
            &paths::framework_info_path(&meta_dir, &slave_id, framework_id),
            &Record::FrameworkInfo(info.clone()),
        )
        .and_then(|_| {
            checkpoint::checkpoint(
                &paths::framework_pid_path(&meta_dir, &slave_id, framework_id),
                &Record::FrameworkPid { pid: pid.clone() },
            )
        });
        self.handle_checkpoint_result(result);
    }

    fn checkpoint_queued_task(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &skiff_id::ExecutorId,
        task: &TaskInfo,
    ) {
        let Some(slave_id) = self.slave_id else {
            return;
        };
        let Some(executor) = self
            .frameworks
            .get(framework_id)
            .and_then(|f| f.executor(executor_id))
        else {
            return;
        };
        if !executor.checkpoint || !self.flags.checkpoint {
            return;
        }

        let record = Task::from_info(task, framework_id.clone(), executor_id.clone(), Some(slave_id));
        let result = executor.checkpoint_task(&self.flags.meta_dir(), &slave_id, &record);
        self.handle_checkpoint_result(result);
    }

    fn handle_checkpoint_result<E: std::fmt::Display>(&mut self, result: Result<(), E>) {
        if let Err(e) = result {
            if self.flags.strict {
                self.fatal(format!("checkpoint write failed: {e}"));
            } else {
                warn!(error = %e, "Checkpoint write failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Protocol dispatch
    // -------------------------------------------------------------------------

    fn handle_protocol(&mut self, envelope: Envelope, ctx: &ActorContext<AgentEvent>) {
        let Envelope { from, message } = envelope;

        // While replaying checkpoints nothing but liveness traffic is
        // safe to act on.
        if self.state == AgentState::Recovering
            && !matches!(message, Message::Ping | Message::Exited { .. })
        {
            warn!(kind = message.kind(), "Dropping message while recovering");
            return;
        }

        match message {
            Message::Registered { slave_id } => self.handle_registered(slave_id, false),
            Message::Reregistered { slave_id } => self.handle_registered(slave_id, true),

            Message::RunTask {
                framework_info,
                framework_id,
                pid,
                task,
            } => self.handle_run_task(framework_info, framework_id, pid, task, ctx),

            Message::KillTask {
                framework_id,
                task_id,
            } => self.handle_kill_task(framework_id, task_id),

            Message::ShutdownFramework { framework_id } => {
                self.handle_shutdown_framework(framework_id, ctx)
            }

            Message::UpdateFramework { framework_id, pid } => {
                if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                    info!(framework_id = %framework_id, pid = %pid, "Framework failed over");
                    framework.pid = pid.clone();
                    let info = framework.info.clone();
                    if info.checkpoint && self.flags.checkpoint {
                        self.checkpoint_framework(&framework_id, &info, &pid);
                    }
                } else {
                    warn!(framework_id = %framework_id, "Update for unknown framework");
                    self.stats.invalid_framework_messages += 1;
                }
            }

            Message::SchedulerMessage {
                slave_id,
                framework_id,
                executor_id,
                data,
            } => self.handle_scheduler_message(slave_id, framework_id, executor_id, data),

            Message::StatusUpdateAcknowledgement {
                slave_id,
                framework_id,
                task_id,
                update_id,
            } => self.handle_acknowledgement(slave_id, framework_id, task_id, update_id),

            Message::Ping => {
                self.bus.send(&self.endpoint, &from, Message::Pong);
            }

            Message::RegisterExecutor {
                framework_id,
                executor_id,
            } => self.handle_register_executor(framework_id, executor_id, from),

            Message::ReregisterExecutor {
                framework_id,
                executor_id,
                tasks,
                updates,
            } => self.handle_reregister_executor(framework_id, executor_id, tasks, updates, from),

            Message::StatusUpdate { update } => self.handle_status_update(update, Some(from)),

            Message::ExecutorToFramework {
                framework_id,
                executor_id,
                data,
                ..
            } => self.handle_executor_message(framework_id, executor_id, data),

            Message::Exited { endpoint } => {
                if self.master.as_ref() == Some(&endpoint) {
                    warn!(master = %endpoint, "Master endpoint exited");
                    self.handle_master_changed(None, ctx);
                } else {
                    // Executor endpoints come and go; the isolator's
                    // exit notification is authoritative.
                    debug!(endpoint = %endpoint, "Linked endpoint exited");
                }
            }

            other => {
                warn!(kind = other.kind(), "Unexpected message");
                self.stats.invalid_framework_messages += 1;
            }
        }
    }
}

#[async_trait]
impl Actor for Agent {
    type Message = AgentEvent;

    fn name(&self) -> &str {
        "agent"
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<AgentEvent>) -> Result<(), ActorError> {
        info!(
            hostname = %self.info.hostname,
            resources = %self.info.resources,
            checkpoint = self.flags.checkpoint,
            recover = ?self.flags.recover,
            "Agent starting"
        );

        ctx.schedule(self.flags.disk_watch_interval, AgentEvent::CheckDiskUsage);

        // Recovery runs off-actor; the result arrives as an event.
        let handle = ctx.self_handle();
        if self.flags.checkpoint {
            let meta_dir = self.flags.meta_dir();
            let strict = self.flags.strict;
            tokio::spawn(async move {
                let result = tokio::task::spawn_blocking(move || state::recover(&meta_dir, strict))
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|r| r.map_err(|e| e.to_string()))
                    .map(|option| option.map(Box::new));
                let _ = handle.send(AgentEvent::RecoveryComplete { result });
            });
        } else {
            let _ = handle.send(AgentEvent::RecoveryComplete { result: Ok(None) });
        }

        Ok(())
    }

    async fn handle(
        &mut self,
        event: AgentEvent,
        ctx: &mut ActorContext<AgentEvent>,
    ) -> Result<bool, ActorError> {
        match event {
            AgentEvent::Protocol(envelope) => self.handle_protocol(envelope, ctx),
            AgentEvent::MasterChanged(master) => self.handle_master_changed(master, ctx),
            AgentEvent::RegistrationTick { epoch } => self.handle_registration_tick(epoch, ctx),
            AgentEvent::RunTaskReady {
                framework_id,
                task,
                executor_info,
            } => self.handle_run_task_ready(framework_id, task, executor_info, ctx),
            AgentEvent::ExecutorLaunched { container, result } => {
                self.handle_executor_launched(container, result)
            }
            AgentEvent::ExecutorTerminated {
                container,
                status,
                destroyed,
                message,
            } => self.handle_executor_terminated(container, status, destroyed, message),
            AgentEvent::RegistrationTimeout { container } => {
                self.handle_registration_timeout(container, ctx)
            }
            AgentEvent::ShutdownTimeout { container } => self.handle_shutdown_timeout(container),
            AgentEvent::ReregisterTimeout => self.handle_reregister_timeout(ctx),
            AgentEvent::CheckDiskUsage => self.handle_check_disk_usage(ctx),
            AgentEvent::DiskUsage { result } => self.handle_disk_usage(result),
            AgentEvent::UpdateHandled {
                update,
                source,
                result,
            } => self.handle_update_handled(update, source, result),
            AgentEvent::AckHandled {
                framework_id,
                task_id,
                result,
                ..
            } => self.handle_ack_handled(framework_id, task_id, result),
            AgentEvent::RecoveryComplete { result } => self.handle_recovery_complete(result, ctx),
            AgentEvent::Shutdown => self.handle_shutdown(ctx),
            AgentEvent::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }

        Ok(!self.stop_requested)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<AgentEvent>) {
        if let Some(tx) = self.exit_tx.take() {
            let _ = tx.send(Ok(()));
        }
        info!("Agent stopped");
    }
}

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

/// Looks an executor up by container id; the run id must match, so a
/// stale event for a previous incarnation resolves to `None`.
fn executor_mut_by_container<'a>(
    frameworks: &'a mut HashMap<FrameworkId, FrameworkRecord>,
    container: &ContainerId,
) -> Option<&'a mut ExecutorRecord> {
    frameworks
        .get_mut(&container.framework_id)
        .and_then(|framework| framework.executor_mut(&container.executor_id))
        .filter(|executor| executor.run_id == container.run_id)
}

/// The executor a task runs under: the explicit one, or a command
/// executor shim keyed by the task id so task-level commands each get
/// their own executor.
fn executor_info_for(framework_id: &FrameworkId, task: &TaskInfo) -> Result<ExecutorInfo, String> {
    if let Some(executor) = &task.executor {
        let mut executor = executor.clone();
        executor.framework_id = Some(framework_id.clone());
        return Ok(executor);
    }

    let Some(command) = &task.command else {
        return Err("task has neither an executor nor a command".to_string());
    };

    let executor_id = task
        .task_id
        .as_str()
        .parse()
        .map_err(|e| format!("cannot derive executor id from task id: {e}"))?;

    Ok(ExecutorInfo {
        executor_id,
        framework_id: Some(framework_id.clone()),
        command: CommandInfo::new(command.value.clone()),
        resources: task.resources.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_info_for_explicit_executor() {
        let framework_id = FrameworkId::new();
        let task = TaskInfo {
            task_id: "t1".parse().unwrap(),
            name: "t1".to_string(),
            resources: Resources::parse("cpus:1").unwrap(),
            executor: Some(ExecutorInfo {
                executor_id: "custom".parse().unwrap(),
                framework_id: None,
                command: CommandInfo::new("./executor"),
                resources: Resources::parse("cpus:0.1").unwrap(),
            }),
            command: None,
            data: None,
        };

        let info = executor_info_for(&framework_id, &task).unwrap();
        assert_eq!(info.executor_id.as_str(), "custom");
        assert_eq!(info.framework_id, Some(framework_id));
    }

    #[test]
    fn test_executor_info_for_command_task() {
        let framework_id = FrameworkId::new();
        let task = TaskInfo {
            task_id: "t1".parse().unwrap(),
            name: "t1".to_string(),
            resources: Resources::parse("cpus:1").unwrap(),
            executor: None,
            command: Some(CommandInfo::new("echo hello")),
            data: None,
        };

        let info = executor_info_for(&framework_id, &task).unwrap();
        // Command tasks get a dedicated executor keyed by task id.
        assert_eq!(info.executor_id.as_str(), "t1");
        assert_eq!(info.command.value, "echo hello");
        assert_eq!(info.resources, task.resources);
    }

    #[test]
    fn test_executor_info_for_invalid_task() {
        let framework_id = FrameworkId::new();
        let task = TaskInfo {
            task_id: "t1".parse().unwrap(),
            name: "t1".to_string(),
            resources: Resources::parse("cpus:1").unwrap(),
            executor: None,
            command: None,
            data: None,
        };

        assert!(executor_info_for(&framework_id, &task).is_err());
    }
}
