//! Reliable, ordered delivery of task status updates.
//!
//! One stream exists per (framework, task). Within a stream updates are
//! forwarded to the master strictly in the order the executor produced
//! them, with at most one in flight; the master acknowledges by update
//! id and is responsible for idempotence across retransmissions.
//!
//! For checkpointing frameworks every update and acknowledgement is
//! appended to the task's durable log *before* handling is reported
//! complete, so a restarted agent can rebuild the streams and resume
//! retransmission exactly where it stopped.
//!
//! Retransmission backs off exponentially up to a ceiling and keeps
//! going until the head is acknowledged. When the terminal update of a
//! stream is acknowledged the stream is garbage collected.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use skiff_id::{FrameworkId, RunId, TaskId, UpdateId};
use skiff_messages::{Endpoint, Message, MessageBus, StatusUpdate};

use crate::actors::{Actor, ActorContext, ActorError, ActorHandle, BackoffPolicy};
use crate::agent::AgentEvent;
use crate::checkpoint::{Record, RecordWriter};
use crate::paths;
use crate::state::SlaveState;

/// Ceiling for retransmission backoff.
const RETRY_MAX: Duration = Duration::from_secs(10 * 60);

/// Messages handled by the status-update manager.
#[derive(Debug)]
pub enum UpdateManagerMessage {
    /// A new (or replayed-by-the-executor) status update.
    Update {
        update: StatusUpdate,
        /// Executor endpoint to acknowledge, when there is one.
        source: Option<Endpoint>,
        run_id: Option<RunId>,
        checkpoint: bool,
    },

    /// The master acknowledged the head of a stream.
    Acknowledgement {
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
    },

    /// Retransmission timer. Ignored if the named update is no longer
    /// the in-flight head.
    Retry {
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
    },

    /// Start (or stop, on `None`) forwarding to this master.
    NewMaster { master: Option<Endpoint> },

    /// Rebuild streams from recovered checkpoint state.
    Recover { state: Box<SlaveState> },

    /// Discard every stream of a framework being torn down.
    DropFramework { framework_id: FrameworkId },
}

struct StatusUpdateStream {
    framework_id: FrameworkId,
    task_id: TaskId,
    /// Updates seen, for duplicate suppression across executor replays.
    received: HashSet<UpdateId>,
    acked: HashSet<UpdateId>,
    /// Non-acknowledged updates in order; the front is in flight.
    pending: VecDeque<StatusUpdate>,
    /// Retransmission attempt for the current head.
    attempt: u32,
    /// `None` for best-effort streams: non-checkpointing frameworks, or
    /// streams degraded after a durable-log failure in non-strict mode.
    writer: Option<RecordWriter>,
}

impl StatusUpdateStream {
    fn head(&self) -> Option<&StatusUpdate> {
        self.pending.front()
    }

    /// Appends a record, honouring the error policy: under `strict` the
    /// failure propagates; otherwise the stream degrades to best-effort.
    fn append(&mut self, record: &Record, strict: bool) -> Result<(), String> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        match writer.append(record) {
            Ok(()) => Ok(()),
            Err(e) if strict => Err(e.to_string()),
            Err(e) => {
                warn!(
                    framework_id = %self.framework_id,
                    task_id = %self.task_id,
                    error = %e,
                    "Durable log write failed, degrading stream to best-effort"
                );
                self.writer = None;
                Ok(())
            }
        }
    }
}

/// The status-update manager actor.
pub struct StatusUpdateManager {
    meta_dir: PathBuf,
    strict: bool,
    backoff: BackoffPolicy,
    bus: MessageBus,
    /// The agent's endpoint; updates are sent in its name.
    endpoint: Endpoint,
    agent: ActorHandle<AgentEvent>,
    master: Option<Endpoint>,
    streams: HashMap<(FrameworkId, TaskId), StatusUpdateStream>,
}

impl StatusUpdateManager {
    pub fn new(
        meta_dir: PathBuf,
        strict: bool,
        retry_interval: Duration,
        bus: MessageBus,
        endpoint: Endpoint,
        agent: ActorHandle<AgentEvent>,
    ) -> Self {
        Self {
            meta_dir,
            strict,
            backoff: BackoffPolicy {
                base: retry_interval,
                max: RETRY_MAX,
                jitter: 0.1,
            },
            bus,
            endpoint,
            agent,
            master: None,
            streams: HashMap::new(),
        }
    }

    fn forward_head(&mut self, key: &(FrameworkId, TaskId), ctx: &ActorContext<UpdateManagerMessage>) {
        let Some(master) = self.master.clone() else {
            return;
        };
        let Some(stream) = self.streams.get(key) else {
            return;
        };
        let Some(head) = stream.head().cloned() else {
            return;
        };

        debug!(
            framework_id = %head.framework_id,
            task_id = %head.status.task_id,
            update_id = %head.update_id,
            state = %head.status.state,
            attempt = stream.attempt,
            "Forwarding status update to master"
        );

        let update_id = head.update_id;
        self.bus
            .send(&self.endpoint, &master, Message::StatusUpdate { update: head });

        let delay = self.backoff.delay(self.streams[key].attempt);
        ctx.schedule(
            delay,
            UpdateManagerMessage::Retry {
                framework_id: key.0.clone(),
                task_id: key.1.clone(),
                update_id,
            },
        );
    }

    fn handle_update(
        &mut self,
        update: StatusUpdate,
        source: Option<Endpoint>,
        run_id: Option<RunId>,
        checkpoint: bool,
        ctx: &ActorContext<UpdateManagerMessage>,
    ) {
        let key = (update.framework_id.clone(), update.status.task_id.clone());

        if !self.streams.contains_key(&key) {
            let writer = self.open_writer(&update, run_id, checkpoint);
            self.streams.insert(
                key.clone(),
                StatusUpdateStream {
                    framework_id: key.0.clone(),
                    task_id: key.1.clone(),
                    received: HashSet::new(),
                    acked: HashSet::new(),
                    pending: VecDeque::new(),
                    attempt: 0,
                    writer,
                },
            );
        }

        let stream = self.streams.get_mut(&key).expect("stream just inserted");

        // Executor replays after a restart re-deliver updates we already
        // hold; handling succeeds so the executor gets its ack, but
        // nothing is logged or queued twice.
        if stream.received.contains(&update.update_id) {
            debug!(
                framework_id = %update.framework_id,
                task_id = %update.status.task_id,
                update_id = %update.update_id,
                "Ignoring duplicate status update"
            );
            self.notify_update_handled(update, source, Ok(()));
            return;
        }

        let result = stream.append(&Record::Update(update.clone()), self.strict);
        if result.is_err() {
            self.notify_update_handled(update, source, result);
            return;
        }

        stream.received.insert(update.update_id);
        stream.pending.push_back(update.clone());

        if stream.pending.len() == 1 {
            self.forward_head(&key, ctx);
        }

        self.notify_update_handled(update, source, Ok(()));
    }

    fn handle_acknowledgement(
        &mut self,
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
        ctx: &ActorContext<UpdateManagerMessage>,
    ) {
        let key = (framework_id.clone(), task_id.clone());

        let result = (|| -> Result<bool, String> {
            let Some(stream) = self.streams.get_mut(&key) else {
                return Err(format!(
                    "no status-update stream for task {task_id} of framework {framework_id}"
                ));
            };

            if stream.acked.contains(&update_id) {
                return Err(format!(
                    "update {update_id} for task {task_id} was already acknowledged"
                ));
            }

            let Some(head) = stream.head() else {
                return Err(format!(
                    "acknowledgement {update_id} for task {task_id}: nothing in flight"
                ));
            };
            if head.update_id != update_id {
                return Err(format!(
                    "acknowledgement {update_id} does not match in-flight update {} for task {task_id}",
                    head.update_id
                ));
            }

            stream.append(&Record::Ack { update_id }, self.strict)?;

            let acked = stream.pending.pop_front().expect("head checked above");
            stream.acked.insert(update_id);
            stream.attempt = 0;

            Ok(acked.status.state.is_terminal() && stream.pending.is_empty())
        })();

        match &result {
            Ok(true) => {
                info!(
                    framework_id = %framework_id,
                    task_id = %task_id,
                    "Status update stream complete, removing"
                );
                self.streams.remove(&key);
            }
            Ok(false) => {
                self.forward_head(&key, ctx);
            }
            Err(e) => {
                warn!(
                    framework_id = %framework_id,
                    task_id = %task_id,
                    error = %e,
                    "Rejecting status-update acknowledgement"
                );
            }
        }

        let _ = self.agent.send(AgentEvent::AckHandled {
            framework_id,
            task_id,
            update_id,
            result,
        });
    }

    fn handle_retry(
        &mut self,
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
        ctx: &ActorContext<UpdateManagerMessage>,
    ) {
        if self.master.is_none() {
            return;
        }

        let key = (framework_id, task_id);
        let in_flight = self
            .streams
            .get(&key)
            .and_then(|stream| stream.head())
            .map(|head| head.update_id == update_id)
            .unwrap_or(false);

        // A stale timer for an already-acknowledged update.
        if !in_flight {
            return;
        }

        if let Some(stream) = self.streams.get_mut(&key) {
            stream.attempt += 1;
            debug!(
                framework_id = %key.0,
                task_id = %key.1,
                update_id = %update_id,
                attempt = stream.attempt,
                "Retransmitting status update"
            );
        }
        self.forward_head(&key, ctx);
    }

    fn handle_new_master(
        &mut self,
        master: Option<Endpoint>,
        ctx: &ActorContext<UpdateManagerMessage>,
    ) {
        self.master = master;

        if self.master.is_some() {
            info!(
                streams = self.streams.len(),
                "Master available, resuming status-update forwarding"
            );
            let keys: Vec<(FrameworkId, TaskId)> = self
                .streams
                .iter()
                .filter(|(_, stream)| !stream.pending.is_empty())
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(stream) = self.streams.get_mut(&key) {
                    stream.attempt = 0;
                }
                self.forward_head(&key, ctx);
            }
        } else {
            info!("Master lost, buffering status updates");
        }
    }

    fn handle_recover(&mut self, state: &SlaveState) {
        let slave_id = state.slave_id;

        for framework in state.frameworks.values() {
            let checkpointing = framework
                .info
                .as_ref()
                .map(|info| info.checkpoint)
                .unwrap_or(true);
            if !checkpointing {
                continue;
            }

            for executor in framework.executors.values() {
                let Some(run) = executor.latest_run() else {
                    continue;
                };

                for (task_id, task) in &run.tasks {
                    let pending: VecDeque<StatusUpdate> = task
                        .updates
                        .iter()
                        .filter(|update| !task.acks.contains(&update.update_id))
                        .cloned()
                        .collect();

                    let terminal_acked = task.updates.iter().any(|update| {
                        update.status.state.is_terminal() && task.acks.contains(&update.update_id)
                    });
                    if terminal_acked && pending.is_empty() {
                        continue; // Fully delivered before the restart.
                    }

                    let log_path = paths::task_updates_path(
                        &self.meta_dir,
                        &slave_id,
                        &framework.id,
                        &executor.id,
                        &run.id,
                        task_id,
                    );
                    let writer = match RecordWriter::open(&log_path) {
                        Ok(writer) => Some(writer),
                        Err(e) => {
                            warn!(
                                task_id = %task_id,
                                error = %e,
                                "Cannot reopen update log, stream degraded"
                            );
                            None
                        }
                    };

                    info!(
                        framework_id = %framework.id,
                        task_id = %task_id,
                        pending = pending.len(),
                        "Recovered status-update stream"
                    );

                    self.streams.insert(
                        (framework.id.clone(), task_id.clone()),
                        StatusUpdateStream {
                            framework_id: framework.id.clone(),
                            task_id: task_id.clone(),
                            received: task.updates.iter().map(|u| u.update_id).collect(),
                            acked: task.acks.clone(),
                            writer,
                            pending,
                            attempt: 0,
                        },
                    );
                }
            }
        }
    }

    fn open_writer(
        &self,
        update: &StatusUpdate,
        run_id: Option<RunId>,
        checkpoint: bool,
    ) -> Option<RecordWriter> {
        if !checkpoint {
            return None;
        }
        let (Some(slave_id), Some(executor_id), Some(run_id)) =
            (update.slave_id, update.executor_id.as_ref(), run_id)
        else {
            return None;
        };

        let path = paths::task_updates_path(
            &self.meta_dir,
            &slave_id,
            &update.framework_id,
            executor_id,
            &run_id,
            &update.status.task_id,
        );
        match RecordWriter::open(&path) {
            Ok(writer) => Some(writer),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot open update log");
                None
            }
        }
    }

    fn notify_update_handled(
        &self,
        update: StatusUpdate,
        source: Option<Endpoint>,
        result: Result<(), String>,
    ) {
        let _ = self.agent.send(AgentEvent::UpdateHandled {
            update,
            source,
            result,
        });
    }
}

#[async_trait]
impl Actor for StatusUpdateManager {
    type Message = UpdateManagerMessage;

    fn name(&self) -> &str {
        "status-update-manager"
    }

    async fn handle(
        &mut self,
        msg: UpdateManagerMessage,
        ctx: &mut ActorContext<UpdateManagerMessage>,
    ) -> Result<bool, ActorError> {
        eprintln!("DEBUG handle entry: {:?}", msg);
        match msg {
            UpdateManagerMessage::Update {
                update,
                source,
                run_id,
                checkpoint,
            } => {
                self.handle_update(update, source, run_id, checkpoint, ctx);
            }

            UpdateManagerMessage::Acknowledgement {
                framework_id,
                task_id,
                update_id,
            } => {
                self.handle_acknowledgement(framework_id, task_id, update_id, ctx);
            }

            UpdateManagerMessage::Retry {
                framework_id,
                task_id,
                update_id,
            } => {
                self.handle_retry(framework_id, task_id, update_id, ctx);
            }

            UpdateManagerMessage::NewMaster { master } => {
                self.handle_new_master(master, ctx);
            }

            UpdateManagerMessage::Recover { state } => {
                self.handle_recover(&state);
            }

            UpdateManagerMessage::DropFramework { framework_id } => {
                let before = self.streams.len();
                self.streams.retain(|(fw, _), _| fw != &framework_id);
                info!(
                    framework_id = %framework_id,
                    dropped = before - self.streams.len(),
                    "Dropped status-update streams for framework"
                );
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use skiff_id::SlaveId;
    use skiff_messages::{TaskState, TaskStatus};

    use crate::actors::{mailbox, spawn, PendingMailbox};

    struct Harness {
        manager: ActorHandle<UpdateManagerMessage>,
        agent_rx: PendingMailbox<AgentEvent>,
        master: skiff_messages::Mailbox,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn next_agent_event(&mut self) -> AgentEvent {
            self.agent_rx.recv().await.expect("agent event")
        }
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let bus = MessageBus::new();
        let master = bus.register("master");
        let (agent_handle, agent_rx) = mailbox::<AgentEvent>("agent");

        eprintln!("DEBUG before StatusUpdateManager::new");
        let manager = StatusUpdateManager::new(
            dir.path().to_path_buf(),
            false,
            Duration::from_secs(10),
            bus.clone(),
            Endpoint::from("slave"),
            agent_handle,
        );
        let (handle, _actor) = spawn(manager);
        eprintln!("DEBUG after spawn");

        Harness {
            manager: handle,
            agent_rx,
            master,
            _dir: dir,
        }
    }

    fn update(framework_id: &FrameworkId, task: &str, state: TaskState) -> StatusUpdate {
        StatusUpdate::new(
            framework_id.clone(),
            Some("default".parse().unwrap()),
            Some(SlaveId::new()),
            TaskStatus {
                task_id: task.parse().unwrap(),
                state,
                message: None,
                data: None,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_forwarded_once_master_known() {
        let mut h = harness();
        let framework_id = FrameworkId::new();

        h.manager
            .send(UpdateManagerMessage::NewMaster {
                master: Some(Endpoint::from("master")),
            })
            .unwrap();

        let u = update(&framework_id, "t1", TaskState::Running);
        h.manager
            .send(UpdateManagerMessage::Update {
                update: u.clone(),
                source: None,
                run_id: None,
                checkpoint: false,
            })
            .unwrap();

        // Agent is told handling succeeded.
        match h.next_agent_event().await {
            AgentEvent::UpdateHandled { update, result, .. } => {
                assert_eq!(update.update_id, u.update_id);
                assert!(result.is_ok());
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Master received it.
        let envelope = h.master.recv().await.unwrap();
        match envelope.message {
            Message::StatusUpdate { update } => assert_eq!(update.update_id, u.update_id),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_per_stream() {
        let mut h = harness();
        let framework_id = FrameworkId::new();

        h.manager
            .send(UpdateManagerMessage::NewMaster {
                master: Some(Endpoint::from("master")),
            })
            .unwrap();

        let first = update(&framework_id, "t1", TaskState::Running);
        let second = update(&framework_id, "t1", TaskState::Finished);
        for u in [&first, &second] {
            h.manager
                .send(UpdateManagerMessage::Update {
                    update: u.clone(),
                    source: None,
                    run_id: None,
                    checkpoint: false,
                })
                .unwrap();
            h.next_agent_event().await;
        }

        // Only the head is in flight.
        let envelope = h.master.recv().await.unwrap();
        let Message::StatusUpdate { update } = envelope.message else {
            panic!()
        };
        assert_eq!(update.update_id, first.update_id);
        assert!(h.master.try_recv().is_none());

        // Ack the head: the second goes out.
        h.manager
            .send(UpdateManagerMessage::Acknowledgement {
                framework_id: framework_id.clone(),
                task_id: "t1".parse().unwrap(),
                update_id: first.update_id,
            })
            .unwrap();

        match h.next_agent_event().await {
            AgentEvent::AckHandled { result, .. } => assert_eq!(result.unwrap(), false),
            other => panic!("unexpected event {other:?}"),
        }

        let envelope = h.master.recv().await.unwrap();
        let Message::StatusUpdate { update } = envelope.message else {
            panic!()
        };
        assert_eq!(update.update_id, second.update_id);

        // Ack the terminal update: stream is done.
        h.manager
            .send(UpdateManagerMessage::Acknowledgement {
                framework_id,
                task_id: "t1".parse().unwrap(),
                update_id: second.update_id,
            })
            .unwrap();
        match h.next_agent_event().await {
            AgentEvent::AckHandled { result, .. } => assert_eq!(result.unwrap(), true),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_mismatch_is_rejected() {
        let mut h = harness();
        let framework_id = FrameworkId::new();

        h.manager
            .send(UpdateManagerMessage::Update {
                update: update(&framework_id, "t1", TaskState::Running),
                source: None,
                run_id: None,
                checkpoint: false,
            })
            .unwrap();
        h.next_agent_event().await;

        h.manager
            .send(UpdateManagerMessage::Acknowledgement {
                framework_id,
                task_id: "t1".parse().unwrap(),
                update_id: UpdateId::new(),
            })
            .unwrap();

        match h.next_agent_event().await {
            AgentEvent::AckHandled { result, .. } => assert!(result.is_err()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_update_not_requeued() {
        let mut h = harness();
        let framework_id = FrameworkId::new();
        let u = update(&framework_id, "t1", TaskState::Running);

        for _ in 0..2 {
            h.manager
                .send(UpdateManagerMessage::Update {
                    update: u.clone(),
                    source: None,
                    run_id: None,
                    checkpoint: false,
                })
                .unwrap();
            match h.next_agent_event().await {
                AgentEvent::UpdateHandled { result, .. } => assert!(result.is_ok()),
                other => panic!("unexpected event {other:?}"),
            }
        }

        h.manager
            .send(UpdateManagerMessage::NewMaster {
                master: Some(Endpoint::from("master")),
            })
            .unwrap();

        let envelope = h.master.recv().await.unwrap();
        assert!(matches!(envelope.message, Message::StatusUpdate { .. }));
        assert!(h.master.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_until_acked() {
        let mut h = harness();
        let framework_id = FrameworkId::new();

        h.manager
            .send(UpdateManagerMessage::NewMaster {
                master: Some(Endpoint::from("master")),
            })
            .unwrap();
        h.manager
            .send(UpdateManagerMessage::Update {
                update: update(&framework_id, "t1", TaskState::Running),
                source: None,
                run_id: None,
                checkpoint: false,
            })
            .unwrap();
        h.next_agent_event().await;

        // First transmission.
        assert!(h.master.recv().await.is_some());

        // No ack: the retry timer fires and retransmits.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(h.master.try_recv().is_some());
    }
}
