//! Pairwise network-check diagnosis
//!
//! Nodes run a connectivity check inside 2-node groups assembled from
//! the published world. The pairing rotates between check rounds, so a
//! node that fails two consecutive rounds is isolated as the common
//! member of the failing groups.

use crate::manager::{NodeMeta, RendezvousManager};
use node_core::constants::STRAGGLER_TIME_RATIO_DEFAULT;
use node_core::{NetworkFailureReason, NodeId, RendezvousName};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

struct CheckState {
    /// Success flag per reporting node rank
    node_status: HashMap<i64, bool>,

    /// Check elapsed seconds per reporting node rank
    node_times: HashMap<i64, f64>,

    /// Group number the current results belong to
    result_group: u64,

    /// Fault sets of completed check rounds, oldest first
    fault_rounds: Vec<HashSet<NodeId>>,

    /// Group number of the last recorded round
    recorded_group: u64,

    /// Group whose re-joins already opened the next round
    advanced_group: u64,
}

/// The network-check rendezvous: the base state machine plus fault and
/// straggler diagnosis over reported check results
pub struct NetworkCheckManager {
    base: RendezvousManager,
    straggler_ratio: f64,
    state: Mutex<CheckState>,
}

impl NetworkCheckManager {
    pub fn new() -> Self {
        Self::with_straggler_ratio(STRAGGLER_TIME_RATIO_DEFAULT)
    }

    pub fn with_straggler_ratio(straggler_ratio: f64) -> Self {
        Self {
            base: RendezvousManager::new(RendezvousName::NetworkCheck),
            straggler_ratio,
            state: Mutex::new(CheckState {
                node_status: HashMap::new(),
                node_times: HashMap::new(),
                result_group: 0,
                fault_rounds: Vec::new(),
                recorded_group: 0,
                advanced_group: 0,
            }),
        }
    }

    /// The underlying rendezvous shared with join/world/waiting paths
    pub fn rendezvous(&self) -> &RendezvousManager {
        &self.base
    }

    /// Join the check rendezvous. A member coming back after its round
    /// has been fully diagnosed starts the next check round.
    pub fn join_rendezvous(
        &self,
        node_id: NodeId,
        node_rank: i64,
        local_world_size: u32,
        node_ip: &str,
    ) -> node_core::RdzvRound {
        let advance = {
            let (_, group, world) = self.base.get_comm_world(node_id);
            let mut state = self.state.lock();
            if !world.is_empty()
                && self.base.is_frozen()
                && state.recorded_group == group
                && state.advanced_group != group
            {
                state.advanced_group = group;
                true
            } else {
                false
            }
        };
        if advance {
            self.base.clear_waiting_nodes();
        }
        self.base.join_rendezvous(node_id, node_rank, local_world_size, node_ip)
    }

    /// Record one node's check outcome for the current round
    pub fn report_network_check_result(&self, node_rank: i64, succeed: bool, elapsed_time: f64) {
        let (_, group, _) = self.base.get_comm_world(node_rank);
        let mut state = self.state.lock();
        if state.result_group != group {
            // First report of a new check round drops stale results
            state.node_status.clear();
            state.node_times.clear();
            state.result_group = group;
        }
        state
            .node_status
            .entry(node_rank)
            .and_modify(|s| *s = *s && succeed)
            .or_insert(succeed);
        state.node_times.insert(node_rank, elapsed_time);
        info!(
            node_rank = node_rank,
            succeed = succeed,
            elapsed = elapsed_time,
            "Collected network check result"
        );
    }

    /// Nodes that failed two consecutive check rounds.
    ///
    /// Returns `NO_INIT` before the first world, `WAITING_NODE` while a
    /// round is incomplete or unconfirmed, `FAULT_NODE` with the
    /// offending nodes, or `NONE` when every group succeeded.
    pub fn check_fault_node(&self) -> (Vec<NodeId>, NetworkFailureReason) {
        let (_, group, world) = self.base.get_comm_world(0);
        if world.is_empty() {
            return (Vec::new(), NetworkFailureReason::NoInit);
        }
        let members: Vec<NodeMeta> = world.values().cloned().collect();

        let mut state = self.state.lock();
        if state.result_group != group || !Self::round_complete(&state, &members) {
            return (Vec::new(), NetworkFailureReason::WaitingNode);
        }

        if state.recorded_group != group {
            let parity = state.fault_rounds.len();
            let mut faults = HashSet::new();
            for check_group in Self::group_nodes(&members, parity) {
                let ok = check_group
                    .iter()
                    .all(|m| state.node_status.get(&m.node_rank).copied().unwrap_or(false));
                if !ok {
                    faults.extend(check_group.iter().map(|m| m.node_id));
                }
            }
            if !faults.is_empty() {
                warn!(group = group, faults = ?faults, "Network check groups failed");
            }
            state.fault_rounds.push(faults);
            state.recorded_group = group;
        }

        let rounds = &state.fault_rounds;
        let Some(current) = rounds.last() else {
            return (Vec::new(), NetworkFailureReason::WaitingNode);
        };
        if current.is_empty() {
            return (Vec::new(), NetworkFailureReason::None);
        }
        if rounds.len() < 2 {
            // One failing round alone is not conclusive
            return (Vec::new(), NetworkFailureReason::WaitingNode);
        }
        let previous = &rounds[rounds.len() - 2];
        let mut confirmed: Vec<NodeId> = current.intersection(previous).copied().collect();
        confirmed.sort_unstable();
        if confirmed.is_empty() {
            (Vec::new(), NetworkFailureReason::None)
        } else {
            (confirmed, NetworkFailureReason::FaultNode)
        }
    }

    /// Nodes whose check time exceeds the group median by the
    /// configured factor
    pub fn get_straggler(&self) -> (Vec<NodeId>, NetworkFailureReason) {
        let (_, group, world) = self.base.get_comm_world(0);
        if world.is_empty() {
            return (Vec::new(), NetworkFailureReason::NoInit);
        }
        let members: Vec<NodeMeta> = world.values().cloned().collect();

        let state = self.state.lock();
        if state.result_group != group
            || members
                .iter()
                .any(|m| !state.node_times.contains_key(&m.node_rank))
        {
            return (Vec::new(), NetworkFailureReason::WaitingNode);
        }

        let mut times: Vec<f64> = members
            .iter()
            .map(|m| state.node_times[&m.node_rank])
            .collect();
        times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = times[times.len() / 2];

        let mut stragglers: Vec<NodeId> = members
            .iter()
            .filter(|m| state.node_times[&m.node_rank] > median * self.straggler_ratio)
            .map(|m| m.node_id)
            .collect();
        stragglers.sort_unstable();
        if stragglers.is_empty() {
            (Vec::new(), NetworkFailureReason::None)
        } else {
            (stragglers, NetworkFailureReason::Straggler)
        }
    }

    fn round_complete(state: &CheckState, members: &[NodeMeta]) -> bool {
        members
            .iter()
            .all(|m| state.node_status.contains_key(&m.node_rank))
    }

    /// Pair members into 2-node groups in world-rank order. Odd check
    /// rounds rotate the list by one so consecutive rounds never repeat
    /// a pairing; a leftover member joins the last group.
    fn group_nodes(members: &[NodeMeta], parity: usize) -> Vec<Vec<NodeMeta>> {
        let mut ordered: Vec<NodeMeta> = members.to_vec();
        if parity % 2 == 1 && ordered.len() > 2 {
            ordered.rotate_left(1);
        }
        let mut groups: Vec<Vec<NodeMeta>> = Vec::new();
        for pair in ordered.chunks(2) {
            if pair.len() == 1 && !groups.is_empty() {
                let last = groups.last_mut().expect("non-empty");
                last.push(pair[0].clone());
            } else {
                groups.push(pair.to_vec());
            }
        }
        groups
    }
}

impl Default for NetworkCheckManager {
    fn default() -> Self {
        Self::new()
    }
}
