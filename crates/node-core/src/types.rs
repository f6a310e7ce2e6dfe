//! Core type definitions for the elastic training master

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier types
pub type NodeId = i64;
pub type TaskId = i64;
pub type RdzvRound = u64;

/// Role of a node inside the training job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// A training worker
    Worker,

    /// A parameter server
    Ps,

    /// An evaluator running validation
    Evaluator,

    /// The chief worker
    Chief,

    /// The master itself
    Master,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Worker => "worker",
            NodeType::Ps => "ps",
            NodeType::Evaluator => "evaluator",
            NodeType::Chief => "chief",
            NodeType::Master => "master",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for NodeType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(NodeType::Worker),
            "ps" => Ok(NodeType::Ps),
            "evaluator" => Ok(NodeType::Evaluator),
            "chief" => Ok(NodeType::Chief),
            "master" => Ok(NodeType::Master),
            other => Err(crate::Error::InvalidConfig {
                message: format!("unknown node type: {}", other),
            }),
        }
    }
}

/// Lifecycle status of a node as observed by the master
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    /// Seen but no heartbeat yet
    Initial,

    /// Heartbeating within the timeout
    Alive,

    /// No heartbeat for longer than the heartbeat timeout
    HeartbeatMissed,

    /// Declared failed; tasks reclaimed
    Failed,

    /// Replaced by a relaunched node
    Replaced,

    /// Exited cleanly
    Finished,
}

impl NodeStatus {
    /// Returns true if the node counts toward the running cluster
    pub fn is_running(&self) -> bool {
        matches!(self, NodeStatus::Alive | NodeStatus::HeartbeatMissed)
    }
}

/// Node lifecycle events reported by workers or the platform watcher
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeEventType {
    Added,
    Modified,
    Deleted,
    NodeCheckSucceeded,
    NodeCheckFailed,
    SucceededExited,
    FailedExited,
}

impl NodeEventType {
    /// Network-check events are routed to the network-check rendezvous
    pub fn is_node_check_event(&self) -> bool {
        matches!(
            self,
            NodeEventType::NodeCheckSucceeded | NodeEventType::NodeCheckFailed
        )
    }
}

/// Severity attached to a reported training failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrainingExceptionLevel {
    Info,
    Warning,
    ProcessError,
    NodeError,
    RdzvError,
}

/// Whether the training loop has started consuming tasks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrainingLoopStatus {
    Start,
    Pending,
    Stop,
}

/// The kind of work a task carries
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    #[default]
    None,
    Training,
    Evaluation,
    Prediction,
    Wait,
}

/// The two rendezvous flavours served by the master
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RendezvousName {
    #[serde(rename = "elastic-training")]
    ElasticTraining,

    #[serde(rename = "network-check")]
    NetworkCheck,
}

impl fmt::Display for RendezvousName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RendezvousName::ElasticTraining => "elastic-training",
            RendezvousName::NetworkCheck => "network-check",
        };
        write!(f, "{}", s)
    }
}

/// Reason attached to a network-check or straggler query reply
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkFailureReason {
    /// No check round has produced a world yet; the client re-polls
    NoInit,

    /// The current check round is still collecting reports
    WaitingNode,

    /// The returned nodes failed consecutive check rounds
    FaultNode,

    /// The returned nodes are slower than the group median by the
    /// configured factor
    Straggler,

    /// All groups succeeded
    #[default]
    None,
}

/// Per-GPU usage statistics reported by a node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GpuStats {
    pub index: u32,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub gpu_utilization: f64,
}

/// Resource configuration or usage of a node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeResource {
    /// CPU cores
    pub cpu: f64,

    /// Memory in MiB
    pub memory: u64,

    /// GPU card type, empty if none
    #[serde(default)]
    pub gpu_type: String,

    /// Number of GPU cards
    #[serde(default)]
    pub gpu_num: u32,

    /// Per-card statistics
    #[serde(default)]
    pub gpu_stats: Vec<GpuStats>,
}

/// Data-loading parallelism settings agreed between master and workers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataLoaderConfig {
    pub batch_size: u32,
    pub num_workers: u32,
    pub pin_memory: bool,
    pub version: u32,
}

/// Optimizer settings agreed between master and workers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub micro_batch_size: u32,
    pub version: u32,
}

/// Parallelism configuration exchanged over the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParallelConfig {
    #[serde(default)]
    pub dataloader: DataLoaderConfig,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Set by the master when the node must restart its training
    /// processes
    #[serde(default)]
    pub restart: bool,
}

/// A node tracked by the job manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_type: NodeType,
    pub node_id: NodeId,

    /// Index in the last-assembled world, -1 before assembly
    pub rank_index: i64,

    /// host:port the node serves on, empty until reported
    pub service_addr: String,

    /// Number of local training processes
    pub local_world_size: u32,

    pub status: NodeStatus,

    pub config_resource: NodeResource,
    pub used_resource: NodeResource,

    /// Unix seconds of the last heartbeat, 0 before the first one
    pub heartbeat_time: u64,

    /// How many times the node has been relaunched
    pub relaunch_count: u32,

    pub paral_config: ParallelConfig,

    pub create_time: DateTime<Utc>,
}

impl Node {
    /// Create a node on first sighting
    pub fn new(node_type: NodeType, node_id: NodeId) -> Self {
        Self {
            node_type,
            node_id,
            rank_index: -1,
            service_addr: String::new(),
            local_world_size: 0,
            status: NodeStatus::Initial,
            config_resource: NodeResource::default(),
            used_resource: NodeResource::default(),
            heartbeat_time: 0,
            relaunch_count: 0,
            paral_config: ParallelConfig::default(),
            create_time: Utc::now(),
        }
    }
}

/// A lifecycle event about one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub event_type: NodeEventType,
    pub node_type: NodeType,
    pub node_id: NodeId,
    pub node_rank: i64,

    /// Seconds the reported operation took, 0 when not applicable
    #[serde(default)]
    pub elapsed_time: f64,
}

/// Reply of the training-port negotiation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncTrainingPorts {
    /// The agreed port, 0 while negotiation is in progress
    pub training_port: u16,

    /// The next port candidates should probe, 0 once agreed
    pub next_check_port: u16,
}
