//! Master detection seam.
//!
//! Leader election lives elsewhere; the agent only consumes a stream of
//! appointments. The standalone detector is the trivial implementation:
//! whoever holds it appoints the master by hand (tests, single-master
//! deployments).

use tokio::sync::watch;

use skiff_messages::Endpoint;

/// A source of master appointments. `None` means no master is known.
pub trait MasterDetector: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<Option<Endpoint>>;
}

/// Detector driven by explicit appointments.
pub struct StandaloneDetector {
    tx: watch::Sender<Option<Endpoint>>,
}

impl StandaloneDetector {
    pub fn new(initial: Option<Endpoint>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Appoints a new master (or withdraws the current one).
    pub fn appoint(&self, master: Option<Endpoint>) {
        let _ = self.tx.send(master);
    }
}

impl Default for StandaloneDetector {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MasterDetector for StandaloneDetector {
    fn subscribe(&self) -> watch::Receiver<Option<Endpoint>> {
        self.tx.subscribe()
    }
}
