//! Core actor types and traits.
//!
//! Provides the building blocks the agent's components are written
//! against:
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for sending messages to actors
//! - `ActorContext` for self-sends and timer arming
//! - Backoff policy for retries
//!
//! Every actor processes one message at a time; anything asynchronous a
//! handler starts (an isolator launch, a durable write, a timer)
//! reports back by sending a message to the actor's own mailbox, so all
//! state mutation stays single-threaded.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on
    /// failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext<Self::Message>,
    ) -> Result<bool, ActorError>;

    /// Called when the actor starts.
    async fn on_start(&mut self, _ctx: &mut ActorContext<Self::Message>) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {
        // Default: no cleanup
    }
}

/// Context provided to actors during message handling.
pub struct ActorContext<M: Message> {
    /// Actor's name, for logging.
    pub actor_id: String,

    /// Shutdown signal receiver.
    shutdown: watch::Receiver<bool>,

    /// Sender into this actor's own mailbox.
    self_tx: mpsc::UnboundedSender<M>,

    /// Message counter.
    pub messages_processed: u64,
}

impl<M: Message> ActorContext<M> {
    fn new(actor_id: String, shutdown: watch::Receiver<bool>, self_tx: mpsc::UnboundedSender<M>) -> Self {
        Self {
            actor_id,
            shutdown,
            self_tx,
            messages_processed: 0,
        }
    }

    /// A handle addressing this actor's own mailbox.
    pub fn self_handle(&self) -> ActorHandle<M> {
        ActorHandle {
            tx: self.self_tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }

    /// Enqueues a message to self.
    pub fn send_to_self(&self, msg: M) {
        let _ = self.self_tx.send(msg);
    }

    /// Arms a timer: `msg` is enqueued after `delay`. The timer cannot
    /// be cancelled; handlers are expected to recognise and ignore
    /// superseded timer messages.
    pub fn schedule(&self, delay: Duration, msg: M) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        });
    }

    /// Check if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Transient error; the actor keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent error; the actor stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// The target actor has stopped.
    #[error("actor stopped")]
    ActorStopped,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    /// Sender for the actor's mailbox.
    tx: mpsc::UnboundedSender<M>,

    /// Actor name for logging.
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor.
    pub fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).map_err(|_| ActorError::ActorStopped)
    }

    /// Get the actor name.
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// A running actor: its task plus the shutdown lever.
pub struct ActorRef {
    /// Actor name.
    pub actor_id: String,

    /// Task handle.
    task_handle: tokio::task::JoinHandle<()>,

    /// Shutdown sender.
    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Check if the actor task is still running.
    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Abort the actor task immediately.
    pub fn abort(&self) {
        self.task_handle.abort();
    }

    /// Wait for the actor task to finish.
    pub async fn wait(self) {
        let _ = self.task_handle.await;
    }
}

// =============================================================================
// Spawning
// =============================================================================

/// Creates a mailbox ahead of spawning, so components that message each
/// other can be wired up before any of them runs.
pub fn mailbox<M: Message>(actor_id: &str) -> (ActorHandle<M>, PendingMailbox<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ActorHandle {
        tx: tx.clone(),
        actor_id: actor_id.to_string(),
    };
    (
        handle,
        PendingMailbox {
            actor_id: actor_id.to_string(),
            tx,
            rx,
        },
    )
}

/// A mailbox waiting for its actor.
pub struct PendingMailbox<M: Message> {
    actor_id: String,
    tx: mpsc::UnboundedSender<M>,
    rx: mpsc::UnboundedReceiver<M>,
}

impl<M: Message> PendingMailbox<M> {
    /// Receives directly from the mailbox, for harnesses that stand in
    /// for the actor.
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }
}

/// Spawn an actor onto a pre-created mailbox.
pub fn spawn_on<A: Actor>(actor: A, mailbox: PendingMailbox<A::Message>) -> ActorRef {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let actor_id = mailbox.actor_id.clone();

    let task_handle = tokio::spawn(run_actor_loop(
        actor,
        mailbox.rx,
        mailbox.tx,
        shutdown_rx,
        actor_id.clone(),
    ));

    ActorRef {
        actor_id,
        task_handle,
        shutdown_tx,
    }
}

/// Spawn an actor with a fresh mailbox.
pub fn spawn<A: Actor>(actor: A) -> (ActorHandle<A::Message>, ActorRef) {
    let (handle, pending) = mailbox(actor.name());
    let actor_ref = spawn_on(actor, pending);
    (handle, actor_ref)
}

/// Run the main actor loop.
async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::UnboundedReceiver<A::Message>,
    tx: mpsc::UnboundedSender<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone(), shutdown.clone(), tx);

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    debug!(actor_id = %actor_id, "Actor started");

    loop {
        tokio::select! {
            biased;

            // Check shutdown first
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            // Process messages
            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        ctx.messages_processed += 1;

                        match actor.handle(msg, &mut ctx).await {
                            Ok(true) => {}
                            Ok(false) => {
                                info!(actor_id = %actor_id, "Actor requested stop");
                                break;
                            }
                            Err(e) => {
                                error!(actor_id = %actor_id, error = %e, "Actor error");
                                if matches!(e, ActorError::Permanent(_)) {
                                    break;
                                }
                            }
                        }
                    }
                    None => {
                        debug!(actor_id = %actor_id, "Actor mailbox closed");
                        break;
                    }
                }
            }
        }
    }

    actor.on_stop(&mut ctx).await;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(32) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter;
        let jitter = rand_jitter(jitter_range);
        let final_delay = (delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Simple jitter using a basic LCG (for no external deps).
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = (seed.wrapping_mul(6364136223846793005).wrapping_add(1)) as f64;
    let normalized = (random / u64::MAX as f64) * 2.0 - 1.0; // -1.0 to 1.0
    normalized * range
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum CounterMessage {
        Add(u64),
        Report(tokio::sync::oneshot::Sender<u64>),
        Stop,
    }

    struct Counter {
        total: u64,
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = CounterMessage;

        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(
            &mut self,
            msg: CounterMessage,
            _ctx: &mut ActorContext<CounterMessage>,
        ) -> Result<bool, ActorError> {
            match msg {
                CounterMessage::Add(n) => {
                    self.total += n;
                    Ok(true)
                }
                CounterMessage::Report(reply) => {
                    let _ = reply.send(self.total);
                    Ok(true)
                }
                CounterMessage::Stop => Ok(false),
            }
        }
    }

    #[tokio::test]
    async fn test_actor_processes_in_order() {
        let (handle, actor_ref) = spawn(Counter { total: 0 });

        handle.send(CounterMessage::Add(1)).unwrap();
        handle.send(CounterMessage::Add(2)).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        handle.send(CounterMessage::Report(tx)).unwrap();
        assert_eq!(rx.await.unwrap(), 3);

        handle.send(CounterMessage::Stop).unwrap();
        actor_ref.wait().await;
    }

    #[tokio::test]
    async fn test_send_to_stopped_actor_fails() {
        let (handle, actor_ref) = spawn(Counter { total: 0 });
        handle.send(CounterMessage::Stop).unwrap();
        actor_ref.wait().await;

        assert!(matches!(
            handle.send(CounterMessage::Add(1)),
            Err(ActorError::ActorStopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_message_arrives() {
        #[derive(Debug)]
        enum TickMessage {
            Arm(Duration),
            Tick(tokio::sync::oneshot::Sender<()>),
        }

        struct Ticker {
            reply: Option<tokio::sync::oneshot::Sender<()>>,
        }

        #[async_trait]
        impl Actor for Ticker {
            type Message = TickMessage;

            fn name(&self) -> &str {
                "ticker"
            }

            async fn handle(
                &mut self,
                msg: TickMessage,
                ctx: &mut ActorContext<TickMessage>,
            ) -> Result<bool, ActorError> {
                match msg {
                    TickMessage::Arm(delay) => {
                        let reply = self.reply.take().unwrap();
                        ctx.schedule(delay, TickMessage::Tick(reply));
                        Ok(true)
                    }
                    TickMessage::Tick(reply) => {
                        let _ = reply.send(());
                        Ok(false)
                    }
                }
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        let (handle, actor_ref) = spawn(Ticker { reply: Some(tx) });

        handle.send(TickMessage::Arm(Duration::from_secs(60))).unwrap();
        rx.await.unwrap();
        actor_ref.wait().await;
    }

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.5,
        };

        let d = policy.delay(2);
        assert!(d >= Duration::from_secs(2));
        assert!(d <= Duration::from_secs(6));
    }
}
