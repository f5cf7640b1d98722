//! The allocator driver.
//!
//! Sits between cluster membership (out of scope here) and the fairness
//! policy: framework and slave lifecycle events are mirrored into the
//! sorter, and each allocation pass walks the sorter's ascending-share
//! order to decide which framework is offered each slave's idle
//! resources next.
//!
//! The driver owns its sorter exclusively; callers serialise access.

use std::collections::HashMap;

use tracing::{debug, info};

use skiff_id::{FrameworkId, OfferId, SlaveId};
use skiff_messages::{FrameworkInfo, Offer, SlaveInfo};
use skiff_resources::Resources;

use crate::sorter::Sorter;

struct SlaveEntry {
    info: SlaveInfo,
    total: Resources,
    /// Resources not currently offered or in use.
    available: Resources,
}

/// Drives a [`Sorter`] and produces resource offers.
pub struct Allocator {
    sorter: Box<dyn Sorter>,
    frameworks: HashMap<FrameworkId, FrameworkInfo>,
    slaves: HashMap<SlaveId, SlaveEntry>,
}

impl Allocator {
    pub fn new(sorter: Box<dyn Sorter>) -> Self {
        Self {
            sorter,
            frameworks: HashMap::new(),
            slaves: HashMap::new(),
        }
    }

    /// Registers a framework as an allocation client. No-op for a
    /// framework that is already known.
    pub fn add_framework(&mut self, framework_id: &FrameworkId, info: FrameworkInfo) {
        self.sorter.add(&framework_id.to_string());
        self.frameworks.insert(framework_id.clone(), info);
        info!(framework_id = %framework_id, "Added framework to allocator");
    }

    /// Forgets a framework. Resources it still held must be returned
    /// separately via [`Allocator::resources_recovered`] as its tasks
    /// and executors wind down.
    pub fn remove_framework(&mut self, framework_id: &FrameworkId) {
        self.sorter.remove(&framework_id.to_string());
        self.frameworks.remove(framework_id);
        info!(framework_id = %framework_id, "Removed framework from allocator");
    }

    /// Resumes offering resources to a framework.
    pub fn activate_framework(&mut self, framework_id: &FrameworkId) {
        self.sorter.activate(&framework_id.to_string());
    }

    /// Stops offering resources to a framework without forgetting its
    /// current allocation.
    pub fn deactivate_framework(&mut self, framework_id: &FrameworkId) {
        self.sorter.deactivate(&framework_id.to_string());
    }

    /// Adds a slave and its advertised resources to the pool.
    pub fn add_slave(&mut self, slave_id: &SlaveId, info: SlaveInfo) {
        let total = info.resources.clone();
        self.sorter.add_total(&total);
        self.slaves.insert(
            slave_id.clone(),
            SlaveEntry {
                available: total.clone(),
                total,
                info,
            },
        );
        info!(slave_id = %slave_id, "Added slave to allocator");
    }

    /// Removes a slave, withdrawing its advertised resources from the
    /// pool. The pool is not clamped; it may run negative until
    /// outstanding allocations against this slave are recovered.
    pub fn remove_slave(&mut self, slave_id: &SlaveId) {
        if let Some(entry) = self.slaves.remove(slave_id) {
            self.sorter.remove_total(&entry.total);
            info!(slave_id = %slave_id, "Removed slave from allocator");
        }
    }

    /// Returns resources a framework no longer holds on a slave
    /// (declined offer, finished task, lost executor).
    pub fn resources_recovered(
        &mut self,
        framework_id: &FrameworkId,
        slave_id: &SlaveId,
        resources: &Resources,
    ) {
        if resources.is_empty() {
            return;
        }

        self.sorter
            .unallocated(&framework_id.to_string(), resources);

        if let Some(entry) = self.slaves.get_mut(slave_id) {
            entry.available += resources;
        }

        debug!(
            framework_id = %framework_id,
            slave_id = %slave_id,
            resources = %resources,
            "Recovered resources"
        );
    }

    /// The sorter's record of what a framework currently holds.
    pub fn framework_allocation(&self, framework_id: &FrameworkId) -> Resources {
        self.sorter.allocation(&framework_id.to_string())
    }

    /// Runs one allocation pass: every slave with idle resources is
    /// offered, whole, to the active framework with the lowest share at
    /// that point in the pass. Deterministic: slaves are visited in id
    /// order and ties between frameworks break on name.
    pub fn allocate(&mut self) -> Vec<Offer> {
        let mut offers = Vec::new();

        let mut slave_ids: Vec<SlaveId> = self.slaves.keys().cloned().collect();
        slave_ids.sort();

        for slave_id in slave_ids {
            let available = match self.slaves.get(&slave_id) {
                Some(entry) if !entry.available.is_empty() => entry.available.clone(),
                _ => continue,
            };

            let Some(name) = self.sorter.sort().into_iter().next() else {
                break; // No active frameworks.
            };

            let Ok(framework_id) = name.parse::<FrameworkId>() else {
                continue;
            };

            self.sorter.allocated(&name, &available);
            if let Some(entry) = self.slaves.get_mut(&slave_id) {
                entry.available = Resources::empty();
            }

            debug!(
                framework_id = %framework_id,
                slave_id = %slave_id,
                resources = %available,
                "Offering resources"
            );

            offers.push(Offer {
                offer_id: OfferId::new(),
                framework_id,
                slave_id,
                resources: available,
            });
        }

        offers
    }

    /// Number of registered frameworks.
    pub fn framework_count(&self) -> usize {
        self.frameworks.len()
    }

    /// Number of registered slaves.
    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    /// Hostname lookup for offer presentation.
    pub fn slave_hostname(&self, slave_id: &SlaveId) -> Option<&str> {
        self.slaves
            .get(slave_id)
            .map(|entry| entry.info.hostname.as_str())
    }
}
