//! Typed request and reply payloads
//!
//! The envelope `data` bytes carry one of these tagged enums encoded
//! as JSON. The enum tag is the payload kind: decoding fails for
//! unknown tags, which the multiplexer answers with the typed empty
//! reply instead of an error status.

use crate::diagnosis::{DiagnosisAction, DiagnosisData};
use data_shard::Task;
use node_core::{
    GpuStats, NetworkFailureReason, NodeEventType, NodeId, NodeType, ParallelConfig,
    RendezvousName, SyncTrainingPorts, TaskType, TrainingExceptionLevel, TrainingLoopStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Node description returned by running-node and PS queries
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeMetaInfo {
    pub node_type: Option<NodeType>,
    pub addr: String,
    pub cpu: f64,
    pub memory: u64,

    #[serde(default)]
    pub gpu_type: String,

    #[serde(default)]
    pub gpu_num: u32,
}

/// Payloads accepted by `Report`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ReportRequest {
    DatasetShardParams {
        batch_size: u64,
        num_epochs: u64,
        dataset_size: u64,
        shuffle: bool,
        num_minibatches_per_shard: u64,
        dataset_name: String,
        task_type: TaskType,
        storage_type: String,
    },
    ResourceStats {
        cpu: f64,
        memory: u64,
        gpu_stats: Vec<GpuStats>,
    },
    ModelInfo {
        model_name: String,
        num_params: u64,
        flops: u64,
    },
    GlobalStep {
        timestamp: u64,
        step: u64,
        elapsed_time_per_step: f64,
    },
    ShardCheckpoint {
        content: String,
    },
    TaskResult {
        dataset_name: String,
        task_id: i64,
        err_message: String,
    },
    ClusterVersion {
        task_type: NodeType,
        task_id: NodeId,
        version_type: String,
        version: u64,
    },
    NodeAddress {
        node_type: NodeType,
        node_id: NodeId,
        addr: String,
    },
    NodeEvent {
        event_type: NodeEventType,
        event_message: String,
        event_elapsed_time: f64,
        node_type: NodeType,
        node_id: NodeId,
        node_rank: i64,
    },
    SyncJoin {
        sync_name: String,
    },
    SyncFinish {
        sync_name: String,
    },
    SyncBarrier {
        barrier_name: String,
        notify: bool,
    },
    NodeFailure {
        error_data: String,
        restart_count: i32,
        level: TrainingExceptionLevel,
    },
    RendezvousParams {
        min_nodes: usize,
        max_nodes: usize,
        waiting_timeout: u64,
        node_unit: usize,
        join_timeout: u64,
    },
    PsReady,
    KeyValuePair {
        key: String,
        value: Vec<u8>,
    },
    ParallelConfig(ParallelConfig),
    NodeCheckpointState {
        step: u64,
    },
    DiagnosisReportData {
        data: DiagnosisData,
        node_rank: i64,
    },
    Event {
        event_type: String,
        instance: String,
        action: String,
        msg: String,
        labels: HashMap<String, String>,
    },
}

/// Payloads accepted by `Get`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum GetRequest {
    TaskRequest {
        dataset_name: String,
    },
    ShardCheckpointRequest {
        dataset_name: String,
    },
    ClusterVersionRequest {
        task_type: NodeType,
        task_id: NodeId,
        version_type: String,
    },
    RunningNodesRequest,
    JoinRendezvousRequest {
        node_id: NodeId,
        node_rank: i64,
        local_world_size: u32,
        rdzv_name: RendezvousName,
        node_ip: String,
    },
    WaitingNodeNumRequest {
        rdzv_name: RendezvousName,
    },
    NetworkReadyRequest,
    StragglerExistRequest,
    CommWorldRequest {
        node_id: NodeId,
        rdzv_name: RendezvousName,
    },
    KeyValuePair {
        key: String,
    },
    PsNodesRequest,
    TrainingStatusRequest,
    ParallelConfigRequest,
    CheckHardwareResetRequest,
    SyncTrainingPort {
        port: u16,
    },
    ElasticRunConfigRequest,
    HeartBeat {
        timestamp: u64,
    },
}

/// Replies carried in the `Get` response envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum GetResponse {
    Task(Task),
    ShardCheckpoint {
        content: String,
    },
    ClusterVersion {
        version: u64,
    },
    RunningNodes {
        nodes: Vec<NodeMetaInfo>,
    },
    RendezvousState {
        round: u64,
        group: u64,
        waiting_num: usize,
        world: BTreeMap<u64, u32>,
    },
    NetworkCheckResult {
        nodes: Vec<NodeId>,
        reason: NetworkFailureReason,
    },
    KeyValuePair {
        key: String,
        value: Vec<u8>,
    },
    PsNodes {
        nodes: Vec<NodeMetaInfo>,
        new_ps_ready: bool,
        ps_failure: bool,
    },
    TrainingStatus {
        status: TrainingLoopStatus,
    },
    ParallelConfig(ParallelConfig),
    SyncTrainingPort(SyncTrainingPorts),
    ElasticRunConfig {
        configs: HashMap<String, String>,
    },
    HeartbeatResponse {
        action: DiagnosisAction,
    },
}

/// Encode a payload for the envelope `data` field
pub fn encode<T: Serialize>(payload: &T) -> node_core::Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Decode an envelope `data` field
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> node_core::Result<T> {
    serde_json::from_slice(data).map_err(|e| node_core::Error::InvalidPayload {
        message: e.to_string(),
    })
}
