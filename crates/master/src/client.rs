//! Typed client for the master service
//!
//! Worker agents talk to the master exclusively through this wrapper:
//! one method per payload kind, fixed-backoff retry on transport
//! failure, and returning-early poll loops for the fault and straggler
//! checks.

use crate::api::{self, GetRequest, GetResponse, NodeMetaInfo, ReportRequest};
use crate::diagnosis::{DiagnosisAction, DiagnosisData};
use crate::proto;
use node_core::constants::{
    CHECK_FAULT_SLEEP, CHECK_POLL_TIMEOUT_DEFAULT, MASTER_CLIENT_RETRY_ATTEMPTS,
    MASTER_CLIENT_RETRY_BACKOFF, MASTER_CLIENT_TIMEOUT_DEFAULT,
};
use node_core::{
    env, Error, GpuStats, NetworkFailureReason, NodeId, NodeType, ParallelConfig, RendezvousName,
    Result, SyncTrainingPorts, TaskType, TrainingExceptionLevel, TrainingLoopStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Client connection to the job master
#[derive(Clone)]
pub struct MasterClient {
    inner: proto::master_client::MasterClient<tonic::transport::Channel>,
    node_id: NodeId,
    node_type: NodeType,
    node_ip: String,
    timeout: Duration,
}

impl MasterClient {
    /// Connect to the master at "ip:port"
    pub async fn connect(master_addr: &str, node_id: NodeId, node_type: NodeType) -> Result<Self> {
        info!(
            master_addr = master_addr,
            node_id = node_id,
            node_type = %node_type,
            "Building master client"
        );
        let endpoint = format!("http://{}", master_addr);
        let inner = proto::master_client::MasterClient::connect(endpoint)
            .await
            .map_err(|_| Error::MasterUnavailable {
                address: master_addr.to_string(),
            })?;
        Ok(Self {
            inner,
            node_id,
            node_type,
            node_ip: env::node_ip(),
            timeout: env::master_client_timeout().unwrap_or(MASTER_CLIENT_TIMEOUT_DEFAULT),
        })
    }

    fn envelope(&self, data: Vec<u8>) -> proto::Message {
        proto::Message {
            node_id: self.node_id,
            node_type: self.node_type.to_string(),
            data,
        }
    }

    async fn report(&self, message: &ReportRequest) -> Result<bool> {
        let data = api::encode(message)?;
        let mut last_err = Error::Grpc("no attempt made".to_string());
        for attempt in 0..MASTER_CLIENT_RETRY_ATTEMPTS {
            let mut request = tonic::Request::new(self.envelope(data.clone()));
            request.set_timeout(self.timeout);
            match self.inner.clone().report(request).await {
                Ok(response) => return Ok(response.into_inner().success),
                Err(status) => {
                    warn!(attempt = attempt, error = %status, "Retrying report");
                    last_err = Error::Grpc(status.to_string());
                    tokio::time::sleep(MASTER_CLIENT_RETRY_BACKOFF).await;
                }
            }
        }
        Err(last_err)
    }

    async fn get(&self, message: &GetRequest) -> Result<GetResponse> {
        let data = api::encode(message)?;
        let mut last_err = Error::Grpc("no attempt made".to_string());
        for attempt in 0..MASTER_CLIENT_RETRY_ATTEMPTS {
            let mut request = tonic::Request::new(self.envelope(data.clone()));
            request.set_timeout(self.timeout);
            match self.inner.clone().get(request).await {
                Ok(response) => return api::decode(&response.into_inner().data),
                Err(status) => {
                    warn!(attempt = attempt, error = %status, "Retrying get");
                    last_err = Error::Grpc(status.to_string());
                    tokio::time::sleep(MASTER_CLIENT_RETRY_BACKOFF).await;
                }
            }
        }
        Err(last_err)
    }

    pub async fn kv_store_set(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        self.report(&ReportRequest::KeyValuePair {
            key: key.to_string(),
            value,
        })
        .await
    }

    pub async fn kv_store_get(&self, key: &str) -> Result<Vec<u8>> {
        match self
            .get(&GetRequest::KeyValuePair {
                key: key.to_string(),
            })
            .await?
        {
            GetResponse::KeyValuePair { value, .. } => Ok(value),
            other => Err(unexpected_reply("KeyValuePair", &other)),
        }
    }

    /// Fetch the next task of a dataset
    pub async fn get_task(&self, dataset_name: &str) -> Result<data_shard::Task> {
        match self
            .get(&GetRequest::TaskRequest {
                dataset_name: dataset_name.to_string(),
            })
            .await?
        {
            GetResponse::Task(task) => Ok(task),
            other => Err(unexpected_reply("Task", &other)),
        }
    }

    /// Report a finished task; an empty error message means success
    pub async fn report_task_result(
        &self,
        dataset_name: &str,
        task_id: i64,
        err_message: &str,
    ) -> Result<bool> {
        self.report(&ReportRequest::TaskResult {
            dataset_name: dataset_name.to_string(),
            task_id,
            err_message: err_message.to_string(),
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn report_dataset_shard_params(
        &self,
        batch_size: u64,
        num_epochs: u64,
        dataset_size: u64,
        shuffle: bool,
        num_minibatches_per_shard: u64,
        dataset_name: &str,
        task_type: TaskType,
        storage_type: &str,
    ) -> Result<bool> {
        self.report(&ReportRequest::DatasetShardParams {
            batch_size,
            num_epochs,
            dataset_size,
            shuffle,
            num_minibatches_per_shard,
            dataset_name: dataset_name.to_string(),
            task_type,
            storage_type: storage_type.to_string(),
        })
        .await
    }

    pub async fn ready_for_ps_relaunch(&self) -> Result<bool> {
        self.report(&ReportRequest::PsReady).await
    }

    pub async fn get_shard_checkpoint(&self, dataset_name: &str) -> Result<String> {
        match self
            .get(&GetRequest::ShardCheckpointRequest {
                dataset_name: dataset_name.to_string(),
            })
            .await?
        {
            GetResponse::ShardCheckpoint { content } => Ok(content),
            other => Err(unexpected_reply("ShardCheckpoint", &other)),
        }
    }

    pub async fn report_shard_checkpoint(&self, content: &str) -> Result<bool> {
        self.report(&ReportRequest::ShardCheckpoint {
            content: content.to_string(),
        })
        .await
    }

    pub async fn report_used_resource(
        &self,
        memory: u64,
        cpu: f64,
        gpu_stats: Vec<GpuStats>,
    ) -> Result<bool> {
        self.report(&ReportRequest::ResourceStats {
            cpu,
            memory,
            gpu_stats,
        })
        .await
    }

    pub async fn report_model_info(
        &self,
        model_name: &str,
        num_params: u64,
        flops: u64,
    ) -> Result<bool> {
        self.report(&ReportRequest::ModelInfo {
            model_name: model_name.to_string(),
            num_params,
            flops,
        })
        .await
    }

    pub async fn report_global_step(
        &self,
        global_step: u64,
        timestamp: u64,
        elapsed_time_per_step: f64,
    ) -> Result<bool> {
        self.report(&ReportRequest::GlobalStep {
            timestamp,
            step: global_step,
            elapsed_time_per_step,
        })
        .await
    }

    /// Send a heartbeat and return the action the master wants run
    pub async fn report_heart_beat(&self, timestamp: u64) -> Result<DiagnosisAction> {
        match self.get(&GetRequest::HeartBeat { timestamp }).await? {
            GetResponse::HeartbeatResponse { action } => Ok(action),
            other => Err(unexpected_reply("HeartbeatResponse", &other)),
        }
    }

    pub async fn get_cluster_version(
        &self,
        version_type: &str,
        task_type: NodeType,
        task_id: NodeId,
    ) -> Result<u64> {
        match self
            .get(&GetRequest::ClusterVersionRequest {
                task_type,
                task_id,
                version_type: version_type.to_string(),
            })
            .await?
        {
            GetResponse::ClusterVersion { version } => Ok(version),
            other => Err(unexpected_reply("ClusterVersion", &other)),
        }
    }

    pub async fn update_cluster_version(
        &self,
        version_type: &str,
        version: u64,
        task_type: NodeType,
        task_id: NodeId,
    ) -> Result<bool> {
        self.report(&ReportRequest::ClusterVersion {
            task_type,
            task_id,
            version_type: version_type.to_string(),
            version,
        })
        .await
    }

    pub async fn update_node_addr(
        &self,
        task_type: NodeType,
        task_id: NodeId,
        node_addr: &str,
    ) -> Result<bool> {
        self.report(&ReportRequest::NodeAddress {
            node_type: task_type,
            node_id: task_id,
            addr: node_addr.to_string(),
        })
        .await
    }

    pub async fn report_node_event(
        &self,
        event_type: node_core::NodeEventType,
        event_message: &str,
        event_elapsed_time: f64,
        node_rank: i64,
    ) -> Result<bool> {
        self.report(&ReportRequest::NodeEvent {
            event_type,
            event_message: event_message.to_string(),
            event_elapsed_time,
            node_type: self.node_type,
            node_id: self.node_id,
            node_rank,
        })
        .await
    }

    /// Report the outcome of one network-check run
    pub async fn report_network_check_status(
        &self,
        node_rank: i64,
        succeeded: bool,
        elapsed_time: f64,
    ) -> Result<bool> {
        let event_type = if succeeded {
            node_core::NodeEventType::NodeCheckSucceeded
        } else {
            node_core::NodeEventType::NodeCheckFailed
        };
        self.report_node_event(event_type, "", elapsed_time, node_rank)
            .await
    }

    pub async fn report_failed_exited(&self) -> Result<bool> {
        self.report_node_event(node_core::NodeEventType::FailedExited, "", 0.0, -1)
            .await
    }

    pub async fn report_succeeded_exited(&self) -> Result<bool> {
        self.report_node_event(node_core::NodeEventType::SucceededExited, "", 0.0, -1)
            .await
    }

    pub async fn query_ps_nodes(&self) -> Result<(Vec<NodeMetaInfo>, bool, bool)> {
        match self.get(&GetRequest::PsNodesRequest).await? {
            GetResponse::PsNodes {
                nodes,
                new_ps_ready,
                ps_failure,
            } => Ok((nodes, new_ps_ready, ps_failure)),
            other => Err(unexpected_reply("PsNodes", &other)),
        }
    }

    pub async fn query_training_status(&self) -> Result<TrainingLoopStatus> {
        match self.get(&GetRequest::TrainingStatusRequest).await? {
            GetResponse::TrainingStatus { status } => Ok(status),
            other => Err(unexpected_reply("TrainingStatus", &other)),
        }
    }

    pub async fn join_sync(&self, sync_name: &str) -> Result<bool> {
        info!(
            node_id = self.node_id,
            node = %self.node_type,
            sync = sync_name,
            "Joining sync"
        );
        self.report(&ReportRequest::SyncJoin {
            sync_name: sync_name.to_string(),
        })
        .await
    }

    pub async fn sync_finished(&self, sync_name: &str) -> Result<bool> {
        self.report(&ReportRequest::SyncFinish {
            sync_name: sync_name.to_string(),
        })
        .await
    }

    pub async fn barrier(&self, barrier_name: &str, notify: bool) -> Result<bool> {
        self.report(&ReportRequest::SyncBarrier {
            barrier_name: barrier_name.to_string(),
            notify,
        })
        .await
    }

    pub async fn get_running_nodes(&self) -> Result<Vec<NodeMetaInfo>> {
        match self.get(&GetRequest::RunningNodesRequest).await? {
            GetResponse::RunningNodes { nodes } => Ok(nodes),
            other => Err(unexpected_reply("RunningNodes", &other)),
        }
    }

    /// Number of nodes waiting in a rendezvous, 0 when the query fails
    pub async fn num_nodes_waiting(&self, rdzv_name: RendezvousName) -> usize {
        match self.get(&GetRequest::WaitingNodeNumRequest { rdzv_name }).await {
            Ok(GetResponse::RendezvousState { waiting_num, .. }) => waiting_num,
            _ => {
                warn!("Failed to query the number of waiting nodes");
                0
            }
        }
    }

    pub async fn join_rendezvous(
        &self,
        node_rank: i64,
        local_world_size: u32,
        rdzv_name: RendezvousName,
    ) -> Result<u64> {
        match self
            .get(&GetRequest::JoinRendezvousRequest {
                node_id: self.node_id,
                node_rank,
                local_world_size,
                rdzv_name,
                node_ip: self.node_ip.clone(),
            })
            .await?
        {
            GetResponse::RendezvousState { round, .. } => Ok(round),
            other => Err(unexpected_reply("RendezvousState", &other)),
        }
    }

    pub async fn get_comm_world(
        &self,
        rdzv_name: RendezvousName,
        node_rank: i64,
    ) -> Result<(u64, u64, BTreeMap<u64, u32>)> {
        match self
            .get(&GetRequest::CommWorldRequest {
                node_id: node_rank,
                rdzv_name,
            })
            .await?
        {
            GetResponse::RendezvousState {
                round,
                group,
                world,
                ..
            } => Ok((round, group, world)),
            other => Err(unexpected_reply("RendezvousState", &other)),
        }
    }

    /// Poll the master until the fault check reaches a terminal
    /// reason or the deadline expires. The master always answers
    /// immediately; the waiting lives here.
    pub async fn check_fault_node(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(Vec<NodeId>, NetworkFailureReason)> {
        let deadline = timeout.unwrap_or(CHECK_POLL_TIMEOUT_DEFAULT);
        let start = Instant::now();
        loop {
            let (nodes, reason) = match self.get(&GetRequest::NetworkReadyRequest).await? {
                GetResponse::NetworkCheckResult { nodes, reason } => (nodes, reason),
                other => return Err(unexpected_reply("NetworkCheckResult", &other)),
            };
            let pending = matches!(
                reason,
                NetworkFailureReason::WaitingNode | NetworkFailureReason::NoInit
            );
            if !pending || start.elapsed() >= deadline {
                return Ok((nodes, reason));
            }
            tokio::time::sleep(CHECK_FAULT_SLEEP).await;
        }
    }

    /// Poll the straggler check until it settles or the deadline
    /// expires
    pub async fn check_straggler(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(Vec<NodeId>, NetworkFailureReason)> {
        let deadline = timeout.unwrap_or(CHECK_POLL_TIMEOUT_DEFAULT);
        let start = Instant::now();
        loop {
            let (nodes, reason) = match self.get(&GetRequest::StragglerExistRequest).await? {
                GetResponse::NetworkCheckResult { nodes, reason } => (nodes, reason),
                other => return Err(unexpected_reply("NetworkCheckResult", &other)),
            };
            if reason != NetworkFailureReason::WaitingNode || start.elapsed() >= deadline {
                return Ok((nodes, reason));
            }
            tokio::time::sleep(CHECK_FAULT_SLEEP).await;
        }
    }

    pub async fn report_rdzv_params(
        &self,
        min_nodes: usize,
        max_nodes: usize,
        waiting_timeout: u64,
        node_unit: usize,
        join_timeout: u64,
    ) -> Result<bool> {
        self.report(&ReportRequest::RendezvousParams {
            min_nodes,
            max_nodes,
            waiting_timeout,
            node_unit,
            join_timeout,
        })
        .await
    }

    pub async fn report_failures(
        &self,
        error_data: &str,
        restart_count: i32,
        level: TrainingExceptionLevel,
    ) -> Result<bool> {
        self.report(&ReportRequest::NodeFailure {
            error_data: error_data.to_string(),
            restart_count,
            level,
        })
        .await
    }

    pub async fn report_paral_config(&self, config: ParallelConfig) -> Result<bool> {
        self.report(&ReportRequest::ParallelConfig(config)).await
    }

    pub async fn report_diagnosis_agent_metrics(&self, data: DiagnosisData) -> Result<bool> {
        self.report(&ReportRequest::DiagnosisReportData {
            data,
            node_rank: env::node_rank(),
        })
        .await
    }

    pub async fn get_paral_config(&self) -> Result<ParallelConfig> {
        match self.get(&GetRequest::ParallelConfigRequest).await? {
            GetResponse::ParallelConfig(config) => Ok(config),
            other => Err(unexpected_reply("ParallelConfig", &other)),
        }
    }

    /// Whether this node must restart its training processes, false
    /// when the query fails
    pub async fn need_to_restart_training(&self) -> bool {
        match self.get(&GetRequest::CheckHardwareResetRequest).await {
            Ok(GetResponse::ParallelConfig(config)) => config.restart,
            _ => {
                warn!("Failed to verify restarting training processes");
                false
            }
        }
    }

    pub async fn sync_checkpoint(&self, step: u64) -> Result<bool> {
        self.report(&ReportRequest::NodeCheckpointState { step })
            .await
    }

    pub async fn sync_training_ports(&self, port: u16) -> Result<SyncTrainingPorts> {
        match self.get(&GetRequest::SyncTrainingPort { port }).await? {
            GetResponse::SyncTrainingPort(ports) => Ok(ports),
            other => Err(unexpected_reply("SyncTrainingPort", &other)),
        }
    }

    pub async fn get_elastic_run_config(&self) -> Result<HashMap<String, String>> {
        match self.get(&GetRequest::ElasticRunConfigRequest).await? {
            GetResponse::ElasticRunConfig { configs } => Ok(configs),
            other => Err(unexpected_reply("ElasticRunConfig", &other)),
        }
    }

    pub async fn report_event(
        &self,
        event_type: &str,
        instance: &str,
        action: &str,
        msg: &str,
        labels: HashMap<String, String>,
    ) -> Result<bool> {
        self.report(&ReportRequest::Event {
            event_type: event_type.to_string(),
            instance: instance.to_string(),
            action: action.to_string(),
            msg: msg.to_string(),
            labels,
        })
        .await
    }
}

/// Build a client from the environment, like a worker agent does
pub async fn build_master_client() -> Result<MasterClient> {
    let master_addr = env::master_addr().ok_or_else(|| Error::InvalidConfig {
        message: format!("{} is not set", env::DLOCK_MASTER_ADDR),
    })?;
    MasterClient::connect(&master_addr, env::node_id(), env::node_type()).await
}

fn unexpected_reply(expected: &str, got: &GetResponse) -> Error {
    Error::InvalidPayload {
        message: format!("expected {} reply, got {:?}", expected, got),
    }
}
