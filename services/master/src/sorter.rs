//! Fair-share sorting of allocator clients.
//!
//! A sorter tracks a set of named clients, each with a computed *share*
//! of the total resource pool, and yields them in ascending share order.
//! The Dominant Resource Fairness implementation defines a client's
//! share as the maximum over scalar resource kinds of
//! `allocated / total`; non-scalar kinds do not participate.
//!
//! Changing the total pool marks the sorter dirty and defers the
//! recomputation of every share to the next [`Sorter::sort`] call, so a
//! burst of pool updates is paid for once.

use std::collections::{BTreeSet, HashMap};

use tracing::warn;

use skiff_resources::{Resources, Value};

/// The ordering seam between the allocator driver and its fairness
/// policy.
///
/// Client names are opaque to the sorter; the allocator keys clients by
/// framework id. A client may be *deactivated* (removed from sort order
/// while keeping its allocation), which models a framework that is
/// connected but currently refusing offers.
pub trait Sorter: Send {
    /// Introduces a client with an empty allocation and zero share.
    /// No-op if the client already exists.
    fn add(&mut self, name: &str);

    /// Forgets a client and its allocation. Idempotent.
    fn remove(&mut self, name: &str);

    /// Re-inserts a known client into the sort order with a freshly
    /// computed share. Calling this for an unknown client is a
    /// programming error.
    fn activate(&mut self, name: &str);

    /// Removes a client from the sort order, keeping its allocation.
    /// Idempotent.
    fn deactivate(&mut self, name: &str);

    /// Records resources handed to a client.
    fn allocated(&mut self, name: &str, resources: &Resources);

    /// Records resources returned by a client.
    fn unallocated(&mut self, name: &str, resources: &Resources);

    /// The client's current allocation (empty for unknown clients).
    fn allocation(&self, name: &str) -> Resources;

    /// Grows the total pool shares are computed against.
    fn add_total(&mut self, resources: &Resources);

    /// Shrinks the total pool. Not clamped: during re-advertisement the
    /// pool may transiently go negative.
    fn remove_total(&mut self, resources: &Resources);

    /// Active client names in ascending share order, ties broken by
    /// name. Recomputes shares first if the pool changed.
    fn sort(&mut self) -> Vec<String>;

    /// Whether the client is known (active or not).
    fn contains(&self, name: &str) -> bool;

    /// Number of known clients.
    fn count(&self) -> usize;
}

/// One entry in the sort order. Total order: share, then name.
#[derive(Debug, Clone)]
struct ClientEntry {
    name: String,
    share: f64,
}

impl PartialEq for ClientEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for ClientEntry {}

impl PartialOrd for ClientEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClientEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.share
            .total_cmp(&other.share)
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// Dominant Resource Fairness sorter.
#[derive(Default)]
pub struct DrfSorter {
    /// Active clients, ordered by (share, name).
    clients: BTreeSet<ClientEntry>,

    /// Allocation per known client, active or not.
    allocations: HashMap<String, Resources>,

    /// The pool shares are computed against.
    total: Resources,

    /// Set when the pool changed; shares are stale until the next sort.
    dirty: bool,
}

impl DrfSorter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current total pool.
    pub fn total(&self) -> &Resources {
        &self.total
    }

    /// A client's dominant share: the maximum over scalar resource
    /// kinds in the pool of `allocated / total`, considering only kinds
    /// with a positive total. Non-scalar kinds do not contribute.
    fn calculate_share(&self, name: &str) -> f64 {
        let Some(allocation) = self.allocations.get(name) else {
            return 0.0;
        };

        let mut share: f64 = 0.0;
        for resource in self.total.iter() {
            if let Value::Scalar(total) = resource.value {
                if total > 0.0 {
                    let allocated = allocation.scalar(&resource.name).unwrap_or(0.0);
                    share = share.max(allocated / total);
                }
            }
        }
        share
    }

    fn find(&self, name: &str) -> Option<ClientEntry> {
        self.clients.iter().find(|c| c.name == name).cloned()
    }

    /// Re-keys an active client after its allocation changed.
    fn update(&mut self, name: &str) {
        if let Some(entry) = self.find(name) {
            self.clients.remove(&entry);
            self.clients.insert(ClientEntry {
                name: name.to_string(),
                share: self.calculate_share(name),
            });
        }
    }
}

impl Sorter for DrfSorter {
    fn add(&mut self, name: &str) {
        if self.allocations.contains_key(name) {
            return;
        }

        self.clients.insert(ClientEntry {
            name: name.to_string(),
            share: 0.0,
        });
        self.allocations.insert(name.to_string(), Resources::empty());
    }

    fn remove(&mut self, name: &str) {
        if let Some(entry) = self.find(name) {
            self.clients.remove(&entry);
        }
        self.allocations.remove(name);
    }

    fn activate(&mut self, name: &str) {
        debug_assert!(
            self.allocations.contains_key(name),
            "activating unknown client {name}"
        );
        if !self.allocations.contains_key(name) {
            warn!(client = %name, "Refusing to activate unknown client");
            return;
        }

        if let Some(entry) = self.find(name) {
            self.clients.remove(&entry);
        }
        self.clients.insert(ClientEntry {
            name: name.to_string(),
            share: self.calculate_share(name),
        });
    }

    fn deactivate(&mut self, name: &str) {
        if let Some(entry) = self.find(name) {
            self.clients.remove(&entry);
        }
    }

    fn allocated(&mut self, name: &str, resources: &Resources) {
        *self.allocations.entry(name.to_string()).or_default() += resources;

        // The pool changed too: every share is stale and will be
        // recomputed on the next sort, so skip the per-client re-key.
        if !self.dirty {
            self.update(name);
        }
    }

    fn unallocated(&mut self, name: &str, resources: &Resources) {
        *self.allocations.entry(name.to_string()).or_default() -= resources;

        if !self.dirty {
            self.update(name);
        }
    }

    fn allocation(&self, name: &str) -> Resources {
        self.allocations.get(name).cloned().unwrap_or_default()
    }

    fn add_total(&mut self, resources: &Resources) {
        self.total += resources;
        self.dirty = true;
    }

    fn remove_total(&mut self, resources: &Resources) {
        self.total -= resources;
        self.dirty = true;
    }

    fn sort(&mut self) -> Vec<String> {
        if self.dirty {
            let names: Vec<String> = self.clients.iter().map(|c| c.name.clone()).collect();
            let mut rebuilt = BTreeSet::new();
            for name in names {
                let share = self.calculate_share(&name);
                rebuilt.insert(ClientEntry { name, share });
            }
            self.clients = rebuilt;
            self.dirty = false;
        }

        self.clients.iter().map(|c| c.name.clone()).collect()
    }

    fn contains(&self, name: &str) -> bool {
        self.allocations.contains_key(name)
    }

    fn count(&self) -> usize {
        self.allocations.len()
    }
}
