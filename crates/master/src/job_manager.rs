//! Job manager: node inventory, liveness, failure handling, actions
//!
//! The job manager owns the node inventory and is the top-level owner
//! of failure handling: the task manager and rendezvous managers
//! register callback hooks here instead of holding back-pointers.

use crate::diagnosis::DiagnosisAction;
use dashmap::DashMap;
use data_shard::TaskManager;
use node_core::{
    GpuStats, MasterConfig, Node, NodeEvent, NodeEventType, NodeId, NodeStatus, NodeType,
    ParallelConfig, SyncTrainingPorts, TrainingExceptionLevel,
};
use parking_lot::{Mutex, RwLock};
use rendezvous::{NetworkCheckManager, RendezvousManager};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

/// Callback hook invoked when the job manager declares a node failed
pub trait NodeFailureObserver: Send + Sync {
    fn on_node_failed(&self, node_type: NodeType, node_id: NodeId);
}

impl NodeFailureObserver for TaskManager {
    fn on_node_failed(&self, node_type: NodeType, node_id: NodeId) {
        self.recover_node_tasks(node_type, node_id);
    }
}

impl NodeFailureObserver for RendezvousManager {
    fn on_node_failed(&self, _node_type: NodeType, node_id: NodeId) {
        self.remove_waiting_node(node_id);
    }
}

impl NodeFailureObserver for NetworkCheckManager {
    fn on_node_failed(&self, _node_type: NodeType, node_id: NodeId) {
        self.rendezvous().remove_waiting_node(node_id);
    }
}

/// Node requirement reported with the rendezvous parameters
#[derive(Debug, Clone, Copy, Default)]
struct RequiredInfo {
    min_nodes: usize,
    max_nodes: usize,
    join_timeout: Duration,
}

/// One recorded training failure
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub node_type: NodeType,
    pub node_id: NodeId,
    pub restart_count: i32,
    pub error_data: String,
    pub level: TrainingExceptionLevel,

    /// Rendezvous round the failure was attributed to, for
    /// RDZV_ERROR-level failures
    pub rdzv_round: Option<u64>,

    pub timestamp: u64,
}

type NodeKey = (NodeType, NodeId);

/// Node inventory, heartbeat liveness and control-plane gates
pub struct JobManager {
    config: Arc<MasterConfig>,
    nodes: RwLock<HashMap<NodeKey, Node>>,

    /// Pending diagnosis actions per node, popped by heartbeats
    actions: DashMap<NodeKey, VecDeque<DiagnosisAction>>,

    observers: Mutex<Vec<Arc<dyn NodeFailureObserver>>>,

    /// Training rendezvous, used to attribute RDZV_ERROR failures
    training_rdzv: Mutex<Option<Arc<RendezvousManager>>>,

    autoscale_started: AtomicBool,
    ps_ready: AtomicBool,
    ps_failure: AtomicBool,

    /// Nodes that must restart their training processes
    restarting: Mutex<HashSet<NodeKey>>,

    /// Candidate training ports per node
    training_ports: Mutex<HashMap<NodeId, u16>>,

    required: Mutex<RequiredInfo>,
    failures: Mutex<Vec<FailureRecord>>,
    opt_strategy: Mutex<Option<ParallelConfig>>,
}

impl JobManager {
    pub fn new(config: Arc<MasterConfig>) -> Self {
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            actions: DashMap::new(),
            observers: Mutex::new(Vec::new()),
            training_rdzv: Mutex::new(None),
            autoscale_started: AtomicBool::new(false),
            ps_ready: AtomicBool::new(false),
            ps_failure: AtomicBool::new(false),
            restarting: Mutex::new(HashSet::new()),
            training_ports: Mutex::new(HashMap::new()),
            required: Mutex::new(RequiredInfo::default()),
            failures: Mutex::new(Vec::new()),
            opt_strategy: Mutex::new(None),
        }
    }

    /// Register a hook invoked on node failure
    pub fn register_failure_observer(&self, observer: Arc<dyn NodeFailureObserver>) {
        self.observers.lock().push(observer);
    }

    /// Attach the training rendezvous used for failure attribution
    pub fn attach_training_rdzv(&self, rdzv: Arc<RendezvousManager>) {
        *self.training_rdzv.lock() = Some(rdzv);
    }

    /// Currently running nodes with their resource configuration
    pub fn get_running_nodes(&self) -> Vec<Node> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.status.is_running())
            .cloned()
            .collect()
    }

    /// PS nodes of the next generation, ordered by id
    pub fn get_next_cluster_ps(&self) -> Vec<Node> {
        let mut ps: Vec<Node> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.node_type == NodeType::Ps && n.status != NodeStatus::Failed)
            .cloned()
            .collect();
        ps.sort_by_key(|n| n.node_id);
        ps
    }

    pub fn ready_for_new_ps_cluster(&self) -> bool {
        self.ps_ready.load(Ordering::SeqCst)
    }

    pub fn post_ps_ready(&self) {
        info!("PS cluster reported ready for relaunch");
        self.ps_ready.store(true, Ordering::SeqCst);
    }

    pub fn has_ps_failure(&self) -> bool {
        self.ps_failure.load(Ordering::SeqCst)
    }

    /// Dispatch a reported node lifecycle event
    pub fn process_reported_node_event(&self, event: &NodeEvent) {
        let key = (event.node_type, event.node_id);
        {
            let mut nodes = self.nodes.write();
            let node = nodes
                .entry(key)
                .or_insert_with(|| Node::new(event.node_type, event.node_id));
            if event.node_rank >= 0 {
                node.rank_index = event.node_rank;
            }
        }

        match event.event_type {
            NodeEventType::NodeCheckFailed => {
                self.restarting.lock().insert(key);
            }
            NodeEventType::NodeCheckSucceeded => {
                self.restarting.lock().remove(&key);
            }
            NodeEventType::FailedExited => {
                self.mark_node_failed(event.node_type, event.node_id);
            }
            NodeEventType::Deleted => {
                // The platform deleted the pod for a relaunch
                self.mark_node_failed(event.node_type, event.node_id);
                if let Some(node) = self.nodes.write().get_mut(&key) {
                    node.status = NodeStatus::Replaced;
                }
            }
            NodeEventType::SucceededExited => {
                if let Some(node) = self.nodes.write().get_mut(&key) {
                    node.status = NodeStatus::Finished;
                }
            }
            NodeEventType::Added | NodeEventType::Modified => {}
        }
    }

    /// Record a reported training failure; RDZV_ERROR failures are
    /// attributed to the current rendezvous round
    pub fn handle_training_failure(
        &self,
        node_type: NodeType,
        node_id: NodeId,
        restart_count: i32,
        error_data: &str,
        level: TrainingExceptionLevel,
    ) {
        let rdzv_round = if level == TrainingExceptionLevel::RdzvError {
            self.training_rdzv.lock().as_ref().map(|r| r.rdzv_round())
        } else {
            None
        };
        error!(
            node = %node_type,
            node_id = node_id,
            restart_count = restart_count,
            level = ?level,
            rdzv_round = ?rdzv_round,
            "Training failure reported: {}",
            error_data
        );
        if restart_count >= 0 {
            if let Some(node) = self.nodes.write().get_mut(&(node_type, node_id)) {
                node.relaunch_count = restart_count as u32;
            }
        }
        self.failures.lock().push(FailureRecord {
            node_type,
            node_id,
            restart_count,
            error_data: error_data.to_string(),
            level,
            rdzv_round,
            timestamp: unix_now(),
        });
    }

    pub fn failure_records(&self) -> Vec<FailureRecord> {
        self.failures.lock().clone()
    }

    /// Update liveness and return the next pending action for the
    /// node. Heartbeats may arrive before any watcher event, so the
    /// node is created on demand.
    pub fn collect_node_heart_beat(
        &self,
        node_type: NodeType,
        node_id: NodeId,
        _timestamp: u64,
    ) -> DiagnosisAction {
        let key = (node_type, node_id);
        {
            let mut nodes = self.nodes.write();
            let node = nodes
                .entry(key)
                .or_insert_with(|| Node::new(node_type, node_id));
            node.heartbeat_time = unix_now();
            if matches!(node.status, NodeStatus::Initial | NodeStatus::HeartbeatMissed) {
                node.status = NodeStatus::Alive;
            }
        }

        let now = unix_now();
        if let Some(mut queue) = self.actions.get_mut(&key) {
            while let Some(action) = queue.pop_front() {
                if action.is_expired(now) {
                    warn!(node = %node_type, node_id = node_id, "Dropped expired action");
                    continue;
                }
                return action;
            }
        }
        DiagnosisAction::NoAction
    }

    /// Queue an action for delivery on the node's next heartbeat
    pub fn enqueue_action(&self, node_type: NodeType, node_id: NodeId, action: DiagnosisAction) {
        if action.is_no_action() {
            return;
        }
        self.actions
            .entry((node_type, node_id))
            .or_default()
            .push_back(action);
    }

    /// Sweep the inventory against the heartbeat and failure timeouts.
    /// Returns the nodes newly declared failed.
    pub fn check_heartbeat_timeouts(&self) -> Vec<NodeKey> {
        let now = unix_now();
        let mut newly_failed = Vec::new();
        {
            let mut nodes = self.nodes.write();
            for (key, node) in nodes.iter_mut() {
                if node.heartbeat_time == 0 || !node.status.is_running() {
                    continue;
                }
                let silent = Duration::from_secs(now.saturating_sub(node.heartbeat_time));
                if silent > self.config.failure_timeout {
                    warn!(
                        node = %node.node_type,
                        node_id = node.node_id,
                        silent_secs = silent.as_secs(),
                        "Node declared failed after missed heartbeats"
                    );
                    node.status = NodeStatus::Failed;
                    newly_failed.push(*key);
                } else if silent > self.config.heartbeat_timeout
                    && node.status == NodeStatus::Alive
                {
                    warn!(
                        node = %node.node_type,
                        node_id = node.node_id,
                        silent_secs = silent.as_secs(),
                        "Node missed heartbeats"
                    );
                    node.status = NodeStatus::HeartbeatMissed;
                }
            }
        }
        for (node_type, node_id) in &newly_failed {
            self.notify_node_failed(*node_type, *node_id);
        }
        newly_failed
    }

    /// Declare one node failed and reclaim its work
    pub fn mark_node_failed(&self, node_type: NodeType, node_id: NodeId) {
        {
            let mut nodes = self.nodes.write();
            if let Some(node) = nodes.get_mut(&(node_type, node_id)) {
                if node.status == NodeStatus::Failed {
                    return;
                }
                node.status = NodeStatus::Failed;
            }
        }
        self.notify_node_failed(node_type, node_id);
    }

    fn notify_node_failed(&self, node_type: NodeType, node_id: NodeId) {
        if node_type == NodeType::Ps {
            self.ps_failure.store(true, Ordering::SeqCst);
        }
        let observers: Vec<Arc<dyn NodeFailureObserver>> = self.observers.lock().clone();
        for observer in observers {
            observer.on_node_failed(node_type, node_id);
        }
    }

    pub fn update_node_resource_usage(
        &self,
        node_type: NodeType,
        node_id: NodeId,
        cpu: f64,
        memory: u64,
        gpu_stats: Vec<GpuStats>,
    ) {
        let mut nodes = self.nodes.write();
        let node = nodes
            .entry((node_type, node_id))
            .or_insert_with(|| Node::new(node_type, node_id));
        node.used_resource.cpu = cpu;
        node.used_resource.memory = memory;
        node.used_resource.gpu_stats = gpu_stats;
    }

    pub fn update_node_service_addr(&self, node_type: NodeType, node_id: NodeId, addr: &str) {
        let mut nodes = self.nodes.write();
        let node = nodes
            .entry((node_type, node_id))
            .or_insert_with(|| Node::new(node_type, node_id));
        node.service_addr = addr.to_string();
    }

    pub fn update_node_paral_config(
        &self,
        node_type: NodeType,
        node_id: NodeId,
        config: ParallelConfig,
    ) {
        let mut nodes = self.nodes.write();
        let node = nodes
            .entry((node_type, node_id))
            .or_insert_with(|| Node::new(node_type, node_id));
        node.paral_config = config;
    }

    /// The parallelism strategy the master suggests to workers
    pub fn get_opt_strategy(&self) -> Option<ParallelConfig> {
        self.opt_strategy.lock().clone()
    }

    pub fn set_opt_strategy(&self, strategy: ParallelConfig) {
        *self.opt_strategy.lock() = Some(strategy);
    }

    /// One-shot check whether the node must restart its training
    /// processes after a hardware reset
    pub fn verify_restarting_worker_training(&self, node_type: NodeType, node_id: NodeId) -> bool {
        self.restarting.lock().remove(&(node_type, node_id))
    }

    /// Negotiate a common training port. The agreed port is returned
    /// once every expected node proposed the same value; otherwise the
    /// caller gets the next candidate to probe.
    pub fn sync_node_training_port(&self, node_id: NodeId, port: u16) -> SyncTrainingPorts {
        let mut ports = self.training_ports.lock();
        ports.insert(node_id, port);

        let agreed = ports.len() >= self.config.node_num
            && ports.values().all(|&p| p == port);
        if agreed {
            SyncTrainingPorts {
                training_port: port,
                next_check_port: 0,
            }
        } else {
            let max = ports.values().copied().max().unwrap_or(port);
            SyncTrainingPorts {
                training_port: 0,
                next_check_port: max + 1,
            }
        }
    }

    /// One-shot autoscale latch; the platform scaler reacts elsewhere
    pub fn start_auto_scaling(&self) {
        if !self.autoscale_started.swap(true, Ordering::SeqCst) {
            info!("Started worker auto-scaling");
        }
    }

    pub fn autoscale_started(&self) -> bool {
        self.autoscale_started.load(Ordering::SeqCst)
    }

    /// Record the node requirement reported with the rendezvous
    /// parameters
    pub fn update_node_required_info(
        &self,
        min_nodes: usize,
        max_nodes: usize,
        join_timeout: Duration,
    ) {
        let mut required = self.required.lock();
        required.min_nodes = min_nodes;
        required.max_nodes = max_nodes;
        required.join_timeout = join_timeout;
    }

    pub fn get_elastic_run_configs(&self) -> HashMap<String, String> {
        self.config.elastic_run_configs()
    }

    /// Inventory lookup, mainly for tests and status endpoints
    pub fn get_node(&self, node_type: NodeType, node_id: NodeId) -> Option<Node> {
        self.nodes.read().get(&(node_type, node_id)).cloned()
    }
}

/// Periodically sweep heartbeat liveness until the master stops
pub fn spawn_liveness_sweeper(
    job_manager: Arc<JobManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            job_manager.check_heartbeat_timeouts();
        }
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::EventAction;

    fn job_manager() -> JobManager {
        JobManager::new(Arc::new(MasterConfig::new("test-job", 2)))
    }

    #[test]
    fn test_heartbeat_creates_node_and_marks_alive() {
        let manager = job_manager();
        let action = manager.collect_node_heart_beat(NodeType::Worker, 0, 123);
        assert!(action.is_no_action());

        let node = manager.get_node(NodeType::Worker, 0).unwrap();
        assert_eq!(node.status, NodeStatus::Alive);
        assert!(node.heartbeat_time > 0);
    }

    #[test]
    fn test_action_rides_next_heartbeat() {
        let manager = job_manager();
        let action = DiagnosisAction::EventAction(EventAction {
            event_type: "X".to_string(),
            timestamp: unix_now(),
            expired_time_period: 600,
            ..Default::default()
        });
        manager.enqueue_action(NodeType::Worker, 1, action.clone());

        assert_eq!(manager.collect_node_heart_beat(NodeType::Worker, 1, 0), action);
        assert!(manager
            .collect_node_heart_beat(NodeType::Worker, 1, 0)
            .is_no_action());
    }

    #[test]
    fn test_expired_action_is_dropped() {
        let manager = job_manager();
        let action = DiagnosisAction::EventAction(EventAction {
            timestamp: 1,
            expired_time_period: 1,
            ..Default::default()
        });
        manager.enqueue_action(NodeType::Worker, 1, action);
        assert!(manager
            .collect_node_heart_beat(NodeType::Worker, 1, 0)
            .is_no_action());
    }

    #[test]
    fn test_failed_exit_marks_failed_and_notifies() {
        struct Recorder(Mutex<Vec<NodeId>>);
        impl NodeFailureObserver for Recorder {
            fn on_node_failed(&self, _node_type: NodeType, node_id: NodeId) {
                self.0.lock().push(node_id);
            }
        }

        let manager = job_manager();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        manager.register_failure_observer(recorder.clone());

        manager.process_reported_node_event(&NodeEvent {
            event_type: NodeEventType::FailedExited,
            node_type: NodeType::Worker,
            node_id: 3,
            node_rank: 3,
            elapsed_time: 0.0,
        });

        let node = manager.get_node(NodeType::Worker, 3).unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert_eq!(*recorder.0.lock(), vec![3]);
    }

    #[test]
    fn test_ps_failure_gate() {
        let manager = job_manager();
        assert!(!manager.has_ps_failure());
        manager.mark_node_failed(NodeType::Ps, 0);
        assert!(manager.has_ps_failure());
    }

    #[test]
    fn test_restart_verification_is_one_shot() {
        let manager = job_manager();
        manager.process_reported_node_event(&NodeEvent {
            event_type: NodeEventType::NodeCheckFailed,
            node_type: NodeType::Worker,
            node_id: 2,
            node_rank: 2,
            elapsed_time: 0.0,
        });

        assert!(manager.verify_restarting_worker_training(NodeType::Worker, 2));
        assert!(!manager.verify_restarting_worker_training(NodeType::Worker, 2));
    }

    #[test]
    fn test_training_port_negotiation() {
        let manager = job_manager();

        let first = manager.sync_node_training_port(0, 20000);
        assert_eq!(first.training_port, 0);
        assert_eq!(first.next_check_port, 20001);

        let agreed = manager.sync_node_training_port(1, 20000);
        assert_eq!(agreed.training_port, 20000);
        assert_eq!(agreed.next_check_port, 0);
    }

    #[test]
    fn test_rdzv_failure_attribution() {
        let manager = job_manager();
        let rdzv = Arc::new(RendezvousManager::new(
            node_core::RendezvousName::ElasticTraining,
        ));
        manager.attach_training_rdzv(rdzv);

        manager.handle_training_failure(
            NodeType::Worker,
            0,
            1,
            "rendezvous lost",
            TrainingExceptionLevel::RdzvError,
        );
        manager.handle_training_failure(
            NodeType::Worker,
            1,
            1,
            "oom",
            TrainingExceptionLevel::ProcessError,
        );

        let records = manager.failure_records();
        assert_eq!(records.len(), 2);
        assert!(records[0].rdzv_round.is_some());
        assert!(records[1].rdzv_round.is_none());
    }

    #[test]
    fn test_running_nodes_excludes_failed() {
        let manager = job_manager();
        manager.collect_node_heart_beat(NodeType::Worker, 0, 0);
        manager.collect_node_heart_beat(NodeType::Worker, 1, 0);
        manager.mark_node_failed(NodeType::Worker, 1);

        let running = manager.get_running_nodes();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].node_id, 0);
    }
}
