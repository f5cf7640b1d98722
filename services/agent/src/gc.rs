//! Scheduled deletion of sandbox and checkpoint directories.
//!
//! Paths are enqueued with a delay; a periodic tick removes whatever has
//! come due, oldest first. Disk-pressure feedback arrives as
//! [`GcMessage::Prune`] with a maximum allowed age: anything older is
//! deleted immediately.
//!
//! Deletion failure is logged and retried once on a later tick;
//! persistent failure stays a warning, never fatal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::actors::{Actor, ActorContext, ActorError, ActorHandle};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Messages handled by the garbage collector.
#[derive(Debug)]
pub enum GcMessage {
    /// Delete `path` once `delay` has elapsed.
    Schedule { path: PathBuf, delay: Duration },

    /// Take `path` back off the queue. Replies whether it was queued.
    Unschedule {
        path: PathBuf,
        reply: oneshot::Sender<bool>,
    },

    /// Disk pressure: delete everything older than `max_age` now.
    Prune { max_age: Duration },

    /// Internal timer.
    Tick,
}

#[derive(Debug, Clone)]
struct GcEntry {
    scheduled_at: Instant,
    due: Instant,
    failed_once: bool,
}

/// The garbage collection actor.
pub struct GarbageCollector {
    entries: HashMap<PathBuf, GcEntry>,
    tick_armed: bool,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            tick_armed: false,
        }
    }

    fn arm_tick(&mut self, ctx: &ActorContext<GcMessage>) {
        if !self.tick_armed && !self.entries.is_empty() {
            self.tick_armed = true;
            ctx.schedule(TICK_INTERVAL, GcMessage::Tick);
        }
    }

    /// Deletes every entry selected by `eligible`, oldest first.
    async fn sweep<F>(&mut self, eligible: F)
    where
        F: Fn(&GcEntry) -> bool,
    {
        let mut due: Vec<(PathBuf, GcEntry)> = self
            .entries
            .iter()
            .filter(|(_, entry)| eligible(entry))
            .map(|(path, entry)| (path.clone(), entry.clone()))
            .collect();
        due.sort_by_key(|(_, entry)| entry.scheduled_at);

        for (path, entry) in due {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), "Garbage collected path");
                    self.entries.remove(&path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Path already gone");
                    self.entries.remove(&path);
                }
                Err(e) if !entry.failed_once => {
                    warn!(path = %path.display(), error = %e, "Failed to delete path, will retry once");
                    if let Some(entry) = self.entries.get_mut(&path) {
                        entry.failed_once = true;
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete path again, giving up");
                    self.entries.remove(&path);
                }
            }
        }
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Actor for GarbageCollector {
    type Message = GcMessage;

    fn name(&self) -> &str {
        "gc"
    }

    async fn handle(
        &mut self,
        msg: GcMessage,
        ctx: &mut ActorContext<GcMessage>,
    ) -> Result<bool, ActorError> {
        match msg {
            GcMessage::Schedule { path, delay } => {
                debug!(path = %path.display(), delay_secs = delay.as_secs(), "Scheduled path for deletion");
                let now = Instant::now();
                self.entries.insert(
                    path,
                    GcEntry {
                        scheduled_at: now,
                        due: now + delay,
                        failed_once: false,
                    },
                );
                self.arm_tick(ctx);
            }

            GcMessage::Unschedule { path, reply } => {
                let removed = self.entries.remove(&path).is_some();
                if removed {
                    debug!(path = %path.display(), "Unscheduled path");
                }
                let _ = reply.send(removed);
            }

            GcMessage::Prune { max_age } => {
                let now = Instant::now();
                info!(max_age_secs = max_age.as_secs(), queued = self.entries.len(), "Pruning by age");
                self.sweep(|entry| now.duration_since(entry.scheduled_at) > max_age)
                    .await;
            }

            GcMessage::Tick => {
                self.tick_armed = false;
                let now = Instant::now();
                self.sweep(|entry| entry.due <= now).await;
                self.arm_tick(ctx);
            }
        }

        Ok(true)
    }
}

/// Typed handle over the GC actor's mailbox.
#[derive(Clone)]
pub struct GcHandle {
    handle: ActorHandle<GcMessage>,
}

impl GcHandle {
    pub fn new(handle: ActorHandle<GcMessage>) -> Self {
        Self { handle }
    }

    pub fn schedule(&self, path: PathBuf, delay: Duration) {
        let _ = self.handle.send(GcMessage::Schedule { path, delay });
    }

    /// Awaits the collector's answer: true if the path had been queued.
    pub async fn unschedule(&self, path: PathBuf) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.handle.send(GcMessage::Unschedule { path, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn prune(&self, max_age: Duration) {
        let _ = self.handle.send(GcMessage::Prune { max_age });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::actors::spawn;

    fn make_dir(root: &std::path::Path, name: &str) -> PathBuf {
        let path = root.join(name);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("file"), b"x").unwrap();
        path
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_path_deleted_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let victim = make_dir(dir.path(), "sandbox");

        let (handle, _actor) = spawn(GarbageCollector::new());
        let gc = GcHandle::new(handle);

        gc.schedule(victim.clone(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(victim.exists());

        tokio::time::sleep(Duration::from_secs(31)).await;
        // Give the tick a moment to run.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!victim.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unschedule_prevents_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let victim = make_dir(dir.path(), "sandbox");

        let (handle, _actor) = spawn(GarbageCollector::new());
        let gc = GcHandle::new(handle);

        gc.schedule(victim.clone(), Duration::from_secs(10));
        assert!(gc.unschedule(victim.clone()).await);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(victim.exists());

        // A second unschedule finds nothing.
        assert!(!gc.unschedule(victim.clone()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_deletes_old_entries_first() {
        let dir = tempfile::tempdir().unwrap();
        let old = make_dir(dir.path(), "old");
        let young = make_dir(dir.path(), "young");

        let (handle, _actor) = spawn(GarbageCollector::new());
        let gc = GcHandle::new(handle);

        gc.schedule(old.clone(), Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_secs(100)).await;
        gc.schedule(young.clone(), Duration::from_secs(3600));

        // Disk pressure: everything older than 50s goes now.
        gc.prune(Duration::from_secs(50));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!old.exists());
        assert!(young.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleting_missing_path_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let ghost = dir.path().join("ghost");

        let (handle, _actor) = spawn(GarbageCollector::new());
        let gc = GcHandle::new(handle);

        gc.schedule(ghost, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(5)).await;
        // Nothing to assert beyond "did not crash": the entry is dropped.
    }
}
