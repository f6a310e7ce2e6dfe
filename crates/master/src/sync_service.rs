//! Named sync groups and one-shot barriers
//!
//! Sync groups coordinate multi-party setup phases outside the
//! training rendezvous. A barrier latches once all expected
//! participants arrived or an admin notified it; clients poll
//! `barrier` until it reads true.

use node_core::{NodeId, NodeType};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::info;

#[derive(Debug, Default)]
struct SyncGroup {
    participants: HashSet<(NodeType, NodeId)>,
    finished: bool,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: HashSet<(NodeType, NodeId)>,
    notified: bool,
}

/// Sync and barrier coordination, independent of the training
/// rendezvous
#[derive(Debug, Default)]
pub struct SyncService {
    groups: Mutex<HashMap<String, SyncGroup>>,
    barriers: Mutex<HashMap<String, BarrierState>>,
}

impl SyncService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the named group. Joins after completion are
    /// accepted but change nothing.
    pub fn join_sync(&self, sync_name: &str, node_type: NodeType, node_id: NodeId) -> bool {
        let mut groups = self.groups.lock();
        let group = groups.entry(sync_name.to_string()).or_default();
        if group.participants.insert((node_type, node_id)) {
            info!(
                sync = sync_name,
                node = %node_type,
                node_id = node_id,
                members = group.participants.len(),
                "Node joined sync group"
            );
        }
        true
    }

    /// Mark the named group complete
    pub fn sync_finished(&self, sync_name: &str) -> bool {
        let mut groups = self.groups.lock();
        let group = groups.entry(sync_name.to_string()).or_default();
        group.finished = true;
        info!(sync = sync_name, "Sync group finished");
        true
    }

    /// True once the named group has been marked complete
    pub fn sync_completed(&self, sync_name: &str) -> bool {
        self.groups
            .lock()
            .get(sync_name)
            .map(|g| g.finished)
            .unwrap_or(false)
    }

    /// Register the caller at the barrier and report whether it has
    /// fired. A barrier fires when notified, or when a sync group of
    /// the same name exists and every participant has arrived.
    pub fn barrier(&self, barrier_name: &str, node_type: NodeType, node_id: NodeId) -> bool {
        let expected = self
            .groups
            .lock()
            .get(barrier_name)
            .map(|g| g.participants.clone());

        let mut barriers = self.barriers.lock();
        let barrier = barriers.entry(barrier_name.to_string()).or_default();
        barrier.arrived.insert((node_type, node_id));

        if barrier.notified {
            return true;
        }
        match expected {
            Some(expected) if !expected.is_empty() => {
                let complete = expected.iter().all(|p| barrier.arrived.contains(p));
                if complete {
                    barrier.notified = true;
                    info!(barrier = barrier_name, "Barrier fired on full arrival");
                }
                complete
            }
            _ => false,
        }
    }

    /// Unlatch the barrier immediately
    pub fn notify_barrier(&self, barrier_name: &str) -> bool {
        let mut barriers = self.barriers.lock();
        barriers
            .entry(barrier_name.to_string())
            .or_default()
            .notified = true;
        info!(barrier = barrier_name, "Barrier notified");
        true
    }
}
