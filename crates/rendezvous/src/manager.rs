//! The rendezvous state machine
//!
//! Rounds move OPEN -> WAITING -> FROZEN. Deadlines are evaluated
//! lazily on access, so no timer thread mutates the state; every
//! observable transition happens under the manager lock.

use node_core::constants::{RDZV_JOIN_TIMEOUT_DEFAULT, RDZV_WAITING_TIMEOUT_DEFAULT};
use node_core::{NodeId, RdzvRound, RendezvousName};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Quorum and timing parameters of a rendezvous, updatable at runtime
#[derive(Debug, Clone)]
pub struct RendezvousParameters {
    pub min_nodes: usize,
    pub max_nodes: usize,

    /// Countdown after the last join once quorum is met
    pub waiting_timeout: Duration,

    /// How long an under-quorum round may stay open
    pub join_timeout: Duration,

    /// World size must be a multiple of this
    pub node_unit: usize,
}

impl Default for RendezvousParameters {
    fn default() -> Self {
        Self {
            min_nodes: 1,
            max_nodes: 1,
            waiting_timeout: RDZV_WAITING_TIMEOUT_DEFAULT,
            join_timeout: RDZV_JOIN_TIMEOUT_DEFAULT,
            node_unit: 1,
        }
    }
}

/// A member of a rendezvous round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeMeta {
    pub node_id: NodeId,
    pub node_rank: i64,

    /// Number of local training processes
    pub process_num: u32,

    pub node_ip: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundStatus {
    Open,
    Waiting,
    Frozen,
}

/// The world published when a round froze; never mutated afterwards
#[derive(Debug, Clone)]
struct PublishedWorld {
    round: RdzvRound,
    group: u64,
    world: BTreeMap<u64, NodeMeta>,
}

struct RdzvState {
    round: RdzvRound,
    status: RoundStatus,
    waiting: BTreeMap<NodeId, NodeMeta>,

    /// When the current round opened (join-timeout base)
    open_time: Instant,

    /// Most recent join (waiting-timeout base)
    last_join: Instant,

    published: Option<PublishedWorld>,
    group_seq: u64,

    /// Latest checkpoint step reported per node
    ckpt_steps: HashMap<NodeId, u64>,

    /// Nodes already warned about the deprecated rank fallback
    legacy_rank_warned: HashSet<NodeId>,
}

/// One rendezvous flavour: membership, round numbering, world assembly
pub struct RendezvousManager {
    name: RendezvousName,
    params: Mutex<RendezvousParameters>,
    state: Mutex<RdzvState>,
}

impl RendezvousManager {
    pub fn new(name: RendezvousName) -> Self {
        let now = Instant::now();
        Self {
            name,
            params: Mutex::new(RendezvousParameters::default()),
            state: Mutex::new(RdzvState {
                round: 0,
                status: RoundStatus::Open,
                waiting: BTreeMap::new(),
                open_time: now,
                last_join: now,
                published: None,
                group_seq: 0,
                ckpt_steps: HashMap::new(),
                legacy_rank_warned: HashSet::new(),
            }),
        }
    }

    pub fn name(&self) -> RendezvousName {
        self.name
    }

    /// Replace the quorum and timing parameters
    pub fn update_rdzv_params(
        &self,
        min_nodes: usize,
        max_nodes: usize,
        waiting_timeout: Duration,
        join_timeout: Duration,
        node_unit: usize,
    ) {
        let mut params = self.params.lock();
        params.min_nodes = min_nodes.max(1);
        params.max_nodes = max_nodes.max(min_nodes.max(1));
        params.waiting_timeout = waiting_timeout;
        params.join_timeout = join_timeout;
        params.node_unit = node_unit.max(1);
        info!(
            rdzv = %self.name,
            min = params.min_nodes,
            max = params.max_nodes,
            node_unit = params.node_unit,
            "Updated rendezvous parameters"
        );
    }

    /// Add or refresh a member and return the round it joined.
    ///
    /// A node_rank of -1 falls back to the node id. That path is kept
    /// for older agents and warned about once per node.
    pub fn join_rendezvous(
        &self,
        node_id: NodeId,
        node_rank: i64,
        local_world_size: u32,
        node_ip: &str,
    ) -> RdzvRound {
        let params = self.params.lock().clone();
        let mut state = self.state.lock();
        Self::tick(&mut state, &params, self.name);

        let node_rank = if node_rank == -1 {
            if state.legacy_rank_warned.insert(node_id) {
                warn!(
                    rdzv = %self.name,
                    node_id = node_id,
                    "node_rank -1 falls back to node_id; this path is deprecated"
                );
            }
            node_id
        } else {
            node_rank
        };

        if state.status == RoundStatus::Frozen {
            let is_member = state
                .published
                .as_ref()
                .map(|p| p.world.values().any(|m| m.node_id == node_id))
                .unwrap_or(false);
            if is_member {
                // Re-join of a published member is idempotent
                return state.round;
            }
            Self::open_next_round(&mut state, self.name);
        }

        state.waiting.insert(
            node_id,
            NodeMeta {
                node_id,
                node_rank,
                process_num: local_world_size,
                node_ip: node_ip.to_string(),
            },
        );
        let now = Instant::now();
        state.last_join = now;
        if state.status == RoundStatus::Open {
            state.status = RoundStatus::Waiting;
            state.open_time = now;
        }
        info!(
            rdzv = %self.name,
            node_id = node_id,
            node_rank = node_rank,
            round = state.round,
            waiting = state.waiting.len(),
            "Node joined rendezvous"
        );

        if state.waiting.len() >= params.max_nodes {
            Self::freeze(&mut state, &params, self.name);
        }
        state.round
    }

    /// Number of nodes waiting in the current round
    pub fn num_nodes_waiting(&self) -> usize {
        let params = self.params.lock().clone();
        let mut state = self.state.lock();
        Self::tick(&mut state, &params, self.name);
        state.waiting.len()
    }

    /// The last published world, or an empty map before the first
    /// freeze
    pub fn get_comm_world(&self, _node_id: NodeId) -> (RdzvRound, u64, BTreeMap<u64, NodeMeta>) {
        let params = self.params.lock().clone();
        let mut state = self.state.lock();
        Self::tick(&mut state, &params, self.name);
        match &state.published {
            Some(p) => (p.round, p.group, p.world.clone()),
            None => (state.round, 0, BTreeMap::new()),
        }
    }

    /// True while the current round is frozen on a published world
    pub fn is_frozen(&self) -> bool {
        self.state.lock().status == RoundStatus::Frozen
    }

    /// The round of the last published world, 0 before the first freeze
    pub fn rdzv_round(&self) -> RdzvRound {
        let state = self.state.lock();
        state
            .published
            .as_ref()
            .map(|p| p.round)
            .unwrap_or(state.round)
    }

    /// Drop the waiting membership of the current round. A frozen
    /// round stays published; the next round opens immediately.
    pub fn clear_waiting_nodes(&self) {
        let mut state = self.state.lock();
        state.waiting.clear();
        if state.status == RoundStatus::Frozen {
            Self::open_next_round(&mut state, self.name);
        } else {
            state.status = RoundStatus::Open;
        }
        info!(rdzv = %self.name, round = state.round, "Cleared waiting nodes");
    }

    /// Remove one failed node from the waiting membership
    pub fn remove_waiting_node(&self, node_id: NodeId) {
        let mut state = self.state.lock();
        if state.waiting.remove(&node_id).is_some() {
            info!(
                rdzv = %self.name,
                node_id = node_id,
                "Removed failed node from rendezvous"
            );
            if state.waiting.is_empty() && state.status == RoundStatus::Waiting {
                state.status = RoundStatus::Open;
            }
        }
        state.ckpt_steps.remove(&node_id);
    }

    /// Record a node's checkpoint step; true once every member of the
    /// published world reported the same step
    pub fn sync_ckpt_nodes(&self, node_id: NodeId, step: u64) -> bool {
        let mut state = self.state.lock();
        state.ckpt_steps.insert(node_id, step);
        let Some(published) = &state.published else {
            return false;
        };
        published
            .world
            .values()
            .all(|m| state.ckpt_steps.get(&m.node_id) == Some(&step))
    }

    /// Node ids of the published world, in rank order
    pub fn world_node_ids(&self) -> Vec<NodeId> {
        let state = self.state.lock();
        state
            .published
            .as_ref()
            .map(|p| p.world.values().map(|m| m.node_id).collect())
            .unwrap_or_default()
    }

    fn tick(state: &mut RdzvState, params: &RendezvousParameters, name: RendezvousName) {
        if state.status != RoundStatus::Waiting {
            return;
        }
        let quorum = state.waiting.len() >= params.min_nodes;
        if quorum && state.last_join.elapsed() >= params.waiting_timeout {
            Self::freeze(state, params, name);
        } else if !quorum && state.open_time.elapsed() >= params.join_timeout {
            warn!(
                rdzv = %name,
                round = state.round,
                waiting = state.waiting.len(),
                min_nodes = params.min_nodes,
                "Join timeout below quorum; dropping round members"
            );
            state.waiting.clear();
            state.round += 1;
            state.status = RoundStatus::Open;
        }
    }

    fn freeze(state: &mut RdzvState, params: &RendezvousParameters, name: RendezvousName) {
        let mut members: Vec<NodeMeta> = state.waiting.values().cloned().collect();
        members.sort_by_key(|m| (m.node_rank, m.node_id));

        let cut = members.len() - members.len() % params.node_unit;
        if cut == 0 {
            return;
        }
        let admitted = &members[..cut];

        let world: BTreeMap<u64, NodeMeta> = admitted
            .iter()
            .cloned()
            .enumerate()
            .map(|(rank, meta)| (rank as u64, meta))
            .collect();
        for meta in admitted {
            state.waiting.remove(&meta.node_id);
        }

        state.group_seq += 1;
        state.ckpt_steps.clear();
        state.published = Some(PublishedWorld {
            round: state.round,
            group: state.group_seq,
            world,
        });
        state.status = RoundStatus::Frozen;
        info!(
            rdzv = %name,
            round = state.round,
            group = state.group_seq,
            world_size = cut,
            held_back = state.waiting.len(),
            "Published rendezvous world"
        );
    }

    fn open_next_round(state: &mut RdzvState, name: RendezvousName) {
        state.round += 1;
        state.status = if state.waiting.is_empty() {
            RoundStatus::Open
        } else {
            RoundStatus::Waiting
        };
        let now = Instant::now();
        state.open_time = now;
        state.last_join = now;
        info!(rdzv = %name, round = state.round, "Opened rendezvous round");
    }
}
