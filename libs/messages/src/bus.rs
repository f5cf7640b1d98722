//! In-process message bus.
//!
//! Each participant registers a named endpoint and receives an owned
//! mailbox. Delivery is in send order per (sender, receiver) pair
//! (stronger here: per receiver), never blocks the sender, and silently
//! drops traffic for unknown endpoints; the protocol treats that the
//! same as a network partition.
//!
//! `link` mirrors a process link: once `a` links against `b`, `a`
//! receives [`Message::Exited`] when `b`'s mailbox is deregistered or
//! dropped. Linking against an unknown endpoint fires `Exited`
//! immediately.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::messages::Message;

/// The address of a mailbox on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// One delivered message plus its sender.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: Endpoint,
    pub message: Message,
}

struct Inner {
    endpoints: HashMap<Endpoint, mpsc::UnboundedSender<Envelope>>,
    /// target -> endpoints observing it.
    links: HashMap<Endpoint, HashSet<Endpoint>>,
}

/// A cheaply cloneable handle to the shared bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                endpoints: HashMap::new(),
                links: HashMap::new(),
            })),
        }
    }

    /// Registers (or replaces) the named endpoint and returns its
    /// mailbox. Replacing an endpoint notifies observers of the old one.
    pub fn register(&self, name: impl Into<String>) -> Mailbox {
        let endpoint = Endpoint::new(name);
        let (tx, rx) = mpsc::unbounded_channel();

        let observers = {
            let mut inner = self.inner.lock().expect("bus lock poisoned");
            let replaced = inner.endpoints.insert(endpoint.clone(), tx.clone()).is_some();
            if replaced {
                self.collect_observers(&mut inner, &endpoint)
            } else {
                Vec::new()
            }
        };
        self.notify_exited(&endpoint, observers);

        Mailbox {
            endpoint,
            rx,
            tx,
            bus: self.clone(),
        }
    }

    /// Removes the endpoint, notifying everything linked against it.
    pub fn deregister(&self, endpoint: &Endpoint) {
        let observers = {
            let mut inner = self.inner.lock().expect("bus lock poisoned");
            if inner.endpoints.remove(endpoint).is_none() {
                return;
            }
            self.collect_observers(&mut inner, endpoint)
        };
        self.notify_exited(endpoint, observers);
    }

    /// Delivers a message. Returns false (after a debug log) if the
    /// destination is unknown or its mailbox is gone.
    pub fn send(&self, from: &Endpoint, to: &Endpoint, message: Message) -> bool {
        let tx = {
            let inner = self.inner.lock().expect("bus lock poisoned");
            inner.endpoints.get(to).cloned()
        };

        match tx {
            Some(tx) => tx
                .send(Envelope {
                    from: from.clone(),
                    message,
                })
                .is_ok(),
            None => {
                debug!(from = %from, to = %to, "Dropping message for unknown endpoint");
                false
            }
        }
    }

    /// Observes `target`: `observer` receives [`Message::Exited`] when
    /// `target` deregisters. Fires immediately if `target` is unknown.
    pub fn link(&self, observer: &Endpoint, target: &Endpoint) {
        let alive = {
            let mut inner = self.inner.lock().expect("bus lock poisoned");
            let alive = inner.endpoints.contains_key(target);
            if alive {
                inner
                    .links
                    .entry(target.clone())
                    .or_default()
                    .insert(observer.clone());
            }
            alive
        };

        if !alive {
            self.notify_exited(target, vec![observer.clone()]);
        }
    }

    /// Whether the endpoint currently has a mailbox.
    pub fn is_registered(&self, endpoint: &Endpoint) -> bool {
        let inner = self.inner.lock().expect("bus lock poisoned");
        inner.endpoints.contains_key(endpoint)
    }

    fn collect_observers(&self, inner: &mut Inner, target: &Endpoint) -> Vec<Endpoint> {
        inner
            .links
            .remove(target)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    fn notify_exited(&self, target: &Endpoint, observers: Vec<Endpoint>) {
        for observer in observers {
            self.send(
                target,
                &observer,
                Message::Exited {
                    endpoint: target.clone(),
                },
            );
        }
    }
}

/// An owned mailbox; dropping it deregisters the endpoint (unless the
/// name has since been re-registered by a newer mailbox).
pub struct Mailbox {
    endpoint: Endpoint,
    rx: mpsc::UnboundedReceiver<Envelope>,
    tx: mpsc::UnboundedSender<Envelope>,
    bus: MessageBus,
}

impl Mailbox {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Receives the next envelope; `None` once deregistered elsewhere.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for draining in tests.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        let observers = {
            let mut inner = self.bus.inner.lock().expect("bus lock poisoned");
            match inner.endpoints.get(&self.endpoint) {
                Some(current) if current.same_channel(&self.tx) => {
                    inner.endpoints.remove(&self.endpoint);
                    self.bus.collect_observers(&mut inner, &self.endpoint)
                }
                _ => return,
            }
        };
        self.bus.notify_exited(&self.endpoint, observers);
    }
}
