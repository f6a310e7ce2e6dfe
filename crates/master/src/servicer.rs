//! The request multiplexer
//!
//! Every inbound envelope is decoded into a typed payload and routed
//! to the owning component. No handler failure crosses the request
//! boundary: decode errors and state errors all collapse into the
//! typed empty reply for the kind.

use crate::api::{self, GetRequest, GetResponse, NodeMetaInfo, ReportRequest};
use crate::diagnosis::DiagnosisManager;
use crate::elastic_ps::ElasticPsService;
use crate::kv_store::KvStore;
use crate::proto;
use crate::speed_monitor::SpeedMonitor;
use crate::sync_service::SyncService;
use data_shard::{new_dataset_splitter, Task, TaskManager};
use node_core::constants::RDZV_JOIN_TIMEOUT_DEFAULT;
use node_core::{
    MasterConfig, Node, NodeEvent, NodeEventType, NodeId, NodeType, ParallelConfig,
    RendezvousName, TrainingLoopStatus,
};
use rendezvous::{NetworkCheckManager, RendezvousManager};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// Master service implementation
pub struct MasterServicer {
    config: Arc<MasterConfig>,
    task_manager: Arc<TaskManager>,
    job_manager: Arc<crate::job_manager::JobManager>,
    speed_monitor: Arc<SpeedMonitor>,
    training_rdzv: Arc<RendezvousManager>,
    network_check: Arc<NetworkCheckManager>,
    diagnosis_manager: Arc<DiagnosisManager>,
    elastic_ps_service: Arc<ElasticPsService>,
    sync_service: Arc<SyncService>,
    kv_store: KvStore,

    /// Unix seconds of the first task request
    start_training_time: AtomicU64,

    /// One-shot autoscale latch
    start_autoscale: AtomicBool,
}

impl MasterServicer {
    /// Build the servicer and wire the component graph: the job
    /// manager owns failure handling, the task manager and both
    /// rendezvous managers register as its hooks.
    pub fn new(config: Arc<MasterConfig>) -> Self {
        let task_manager = Arc::new(TaskManager::new(config.task_timeout));
        let job_manager = Arc::new(crate::job_manager::JobManager::new(config.clone()));
        let training_rdzv = Arc::new(RendezvousManager::new(RendezvousName::ElasticTraining));
        let network_check = Arc::new(NetworkCheckManager::with_straggler_ratio(
            config.straggler_time_ratio,
        ));

        job_manager.register_failure_observer(task_manager.clone());
        job_manager.register_failure_observer(training_rdzv.clone());
        job_manager.register_failure_observer(network_check.clone());
        job_manager.attach_training_rdzv(training_rdzv.clone());

        // Clear the store in case a crashed predecessor left state
        let kv_store = KvStore::new();
        kv_store.clear();

        Self {
            config,
            task_manager,
            job_manager,
            speed_monitor: Arc::new(SpeedMonitor::new()),
            training_rdzv,
            network_check,
            diagnosis_manager: Arc::new(DiagnosisManager::new()),
            elastic_ps_service: Arc::new(ElasticPsService::new()),
            sync_service: Arc::new(SyncService::new()),
            kv_store,
            start_training_time: AtomicU64::new(0),
            start_autoscale: AtomicBool::new(false),
        }
    }

    pub fn job_manager(&self) -> &Arc<crate::job_manager::JobManager> {
        &self.job_manager
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    pub fn speed_monitor(&self) -> &Arc<SpeedMonitor> {
        &self.speed_monitor
    }

    pub fn diagnosis_manager(&self) -> &Arc<DiagnosisManager> {
        &self.diagnosis_manager
    }

    fn rdzv_manager(&self, name: RendezvousName) -> &RendezvousManager {
        match name {
            RendezvousName::ElasticTraining => &self.training_rdzv,
            RendezvousName::NetworkCheck => self.network_check.rendezvous(),
        }
    }

    fn handle_get(
        &self,
        node_type: NodeType,
        node_id: NodeId,
        request: GetRequest,
    ) -> GetResponse {
        match request {
            GetRequest::TaskRequest { dataset_name } => {
                self.get_task(node_type, node_id, &dataset_name)
            }
            GetRequest::ShardCheckpointRequest { dataset_name } => {
                let content = self
                    .task_manager
                    .checkpoint_dataset(&dataset_name)
                    .and_then(|c| c.to_json().ok())
                    .unwrap_or_default();
                GetResponse::ShardCheckpoint { content }
            }
            GetRequest::ClusterVersionRequest {
                task_type,
                task_id,
                version_type,
            } => GetResponse::ClusterVersion {
                version: self
                    .elastic_ps_service
                    .get_version(task_type, task_id, &version_type),
            },
            GetRequest::RunningNodesRequest => GetResponse::RunningNodes {
                nodes: self
                    .job_manager
                    .get_running_nodes()
                    .iter()
                    .map(node_meta)
                    .collect(),
            },
            GetRequest::JoinRendezvousRequest {
                node_id,
                node_rank,
                local_world_size,
                rdzv_name,
                node_ip,
            } => {
                let round = match rdzv_name {
                    RendezvousName::ElasticTraining => self.training_rdzv.join_rendezvous(
                        node_id,
                        node_rank,
                        local_world_size,
                        &node_ip,
                    ),
                    RendezvousName::NetworkCheck => {
                        // Network check supersedes a pending training
                        // rendezvous
                        self.training_rdzv.clear_waiting_nodes();
                        self.network_check.join_rendezvous(
                            node_id,
                            node_rank,
                            local_world_size,
                            &node_ip,
                        )
                    }
                };
                GetResponse::RendezvousState {
                    round,
                    group: 0,
                    waiting_num: 0,
                    world: Default::default(),
                }
            }
            GetRequest::WaitingNodeNumRequest { rdzv_name } => GetResponse::RendezvousState {
                round: 0,
                group: 0,
                waiting_num: self.rdzv_manager(rdzv_name).num_nodes_waiting(),
                world: Default::default(),
            },
            GetRequest::NetworkReadyRequest => {
                let (nodes, reason) = self.network_check.check_fault_node();
                GetResponse::NetworkCheckResult { nodes, reason }
            }
            GetRequest::StragglerExistRequest => {
                let (nodes, reason) = self.network_check.get_straggler();
                GetResponse::NetworkCheckResult { nodes, reason }
            }
            GetRequest::CommWorldRequest { node_id, rdzv_name } => {
                let (round, group, world) =
                    self.rdzv_manager(rdzv_name).get_comm_world(node_id);
                GetResponse::RendezvousState {
                    round,
                    group,
                    waiting_num: 0,
                    world: world
                        .into_iter()
                        .map(|(rank, meta)| (rank, meta.process_num))
                        .collect(),
                }
            }
            GetRequest::KeyValuePair { key } => GetResponse::KeyValuePair {
                value: self.kv_store.get(&key),
                key,
            },
            GetRequest::PsNodesRequest => GetResponse::PsNodes {
                nodes: self
                    .job_manager
                    .get_next_cluster_ps()
                    .iter()
                    .map(node_meta)
                    .collect(),
                new_ps_ready: self.job_manager.ready_for_new_ps_cluster(),
                ps_failure: self.job_manager.has_ps_failure(),
            },
            GetRequest::TrainingStatusRequest => GetResponse::TrainingStatus {
                status: if self.task_manager.training_started() {
                    TrainingLoopStatus::Start
                } else {
                    TrainingLoopStatus::Pending
                },
            },
            GetRequest::ParallelConfigRequest => GetResponse::ParallelConfig(
                self.job_manager.get_opt_strategy().unwrap_or_default(),
            ),
            GetRequest::CheckHardwareResetRequest => {
                let restart = self
                    .job_manager
                    .verify_restarting_worker_training(node_type, node_id);
                GetResponse::ParallelConfig(ParallelConfig {
                    restart,
                    ..Default::default()
                })
            }
            GetRequest::SyncTrainingPort { port } => {
                info!(node_id = node_id, port = port, "Syncing training port");
                GetResponse::SyncTrainingPort(
                    self.job_manager.sync_node_training_port(node_id, port),
                )
            }
            GetRequest::ElasticRunConfigRequest => GetResponse::ElasticRunConfig {
                configs: self.job_manager.get_elastic_run_configs(),
            },
            GetRequest::HeartBeat { timestamp } => GetResponse::HeartbeatResponse {
                action: self
                    .job_manager
                    .collect_node_heart_beat(node_type, node_id, timestamp),
            },
        }
    }

    fn get_task(&self, node_type: NodeType, node_id: NodeId, dataset_name: &str) -> GetResponse {
        let _ = self.start_training_time.compare_exchange(
            0,
            unix_now(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if !self.task_manager.has_dataset(dataset_name) {
            return GetResponse::Task(Task::default());
        }
        let task = match self
            .task_manager
            .get_dataset_task(node_type, node_id, dataset_name)
        {
            Some(task) => task,
            None if !self.task_manager.dataset_completed(dataset_name) => Task::wait(),
            None => Task::default(),
        };
        self.task_manager.reset_worker_start_task_time(node_id);
        GetResponse::Task(task)
    }

    fn handle_report(
        &self,
        node_type: NodeType,
        node_id: NodeId,
        request: ReportRequest,
    ) -> bool {
        match request {
            ReportRequest::DatasetShardParams {
                batch_size,
                num_epochs,
                dataset_size,
                shuffle,
                num_minibatches_per_shard,
                dataset_name,
                task_type,
                storage_type,
            } => {
                let storage_type = match storage_type.parse() {
                    Ok(storage) => storage,
                    Err(e) => {
                        warn!(dataset = %dataset_name, error = %e, "Rejected dataset params");
                        return false;
                    }
                };
                let minibatches = if num_minibatches_per_shard == 0 {
                    node_core::constants::DEFAULT_NUM_MINIBATCHES_PER_SHARD
                } else {
                    num_minibatches_per_shard
                };
                let splitter = new_dataset_splitter(
                    shuffle,
                    batch_size * minibatches,
                    dataset_size,
                    num_epochs,
                    &dataset_name,
                    storage_type,
                );
                self.task_manager.new_dataset(splitter, task_type);
                true
            }
            ReportRequest::ResourceStats {
                cpu,
                memory,
                gpu_stats,
            } => {
                debug!(
                    node = %node_type,
                    node_id = node_id,
                    cpu = cpu,
                    memory = memory,
                    "Updated node resource usage"
                );
                self.job_manager
                    .update_node_resource_usage(node_type, node_id, cpu, memory, gpu_stats);
                true
            }
            ReportRequest::ModelInfo {
                model_name,
                num_params,
                flops,
            } => {
                info!(
                    model = %model_name,
                    num_params = num_params,
                    flops = flops,
                    "Collected model info"
                );
                true
            }
            ReportRequest::GlobalStep {
                timestamp, step, ..
            } => {
                self.speed_monitor.collect_global_step(step, timestamp);
                self.check_start_auto_scale_worker();
                true
            }
            ReportRequest::ShardCheckpoint { content } => {
                self.task_manager.restore_dataset_from_checkpoint(&content)
            }
            ReportRequest::TaskResult {
                dataset_name,
                task_id,
                err_message,
            } => {
                let success = err_message.is_empty();
                if !success {
                    warn!(
                        dataset = %dataset_name,
                        task_id = task_id,
                        "Worker reported task error: {}",
                        err_message
                    );
                }
                self.task_manager
                    .report_dataset_task(&dataset_name, task_id, success);
                self.check_non_training_autoscale();
                success
            }
            ReportRequest::ClusterVersion {
                task_type,
                task_id,
                version_type,
                version,
            } => {
                self.elastic_ps_service
                    .update_version(task_type, task_id, &version_type, version);
                true
            }
            ReportRequest::NodeAddress {
                node_type,
                node_id,
                addr,
            } => {
                self.job_manager
                    .update_node_service_addr(node_type, node_id, &addr);
                true
            }
            ReportRequest::NodeEvent {
                event_type,
                event_elapsed_time,
                node_type,
                node_id,
                node_rank,
                ..
            } => {
                let event = NodeEvent {
                    event_type,
                    node_type,
                    node_id,
                    node_rank,
                    elapsed_time: event_elapsed_time,
                };
                if event.event_type.is_node_check_event() {
                    let succeed = event.event_type == NodeEventType::NodeCheckSucceeded;
                    let rank = if node_rank >= 0 { node_rank } else { node_id };
                    self.network_check
                        .report_network_check_result(rank, succeed, event_elapsed_time);
                }
                self.job_manager.process_reported_node_event(&event);
                true
            }
            ReportRequest::SyncJoin { sync_name } => {
                self.sync_service.join_sync(&sync_name, node_type, node_id)
            }
            ReportRequest::SyncFinish { sync_name } => self.sync_service.sync_finished(&sync_name),
            ReportRequest::SyncBarrier {
                barrier_name,
                notify,
            } => {
                if notify {
                    self.sync_service.notify_barrier(&barrier_name)
                } else {
                    self.sync_service.barrier(&barrier_name, node_type, node_id)
                }
            }
            ReportRequest::NodeFailure {
                error_data,
                restart_count,
                level,
            } => {
                self.job_manager.handle_training_failure(
                    node_type,
                    node_id,
                    restart_count,
                    &error_data,
                    level,
                );
                true
            }
            ReportRequest::RendezvousParams {
                min_nodes,
                max_nodes,
                waiting_timeout,
                node_unit,
                join_timeout,
            } => {
                // join_timeout 0 comes from older agents
                let join_timeout = if join_timeout == 0 {
                    RDZV_JOIN_TIMEOUT_DEFAULT
                } else {
                    Duration::from_secs(join_timeout)
                };
                let waiting_timeout = Duration::from_secs(waiting_timeout);
                for manager in [&*self.training_rdzv, self.network_check.rendezvous()] {
                    manager.update_rdzv_params(
                        min_nodes,
                        max_nodes,
                        waiting_timeout,
                        join_timeout,
                        node_unit,
                    );
                }
                self.job_manager
                    .update_node_required_info(min_nodes, max_nodes, join_timeout);
                true
            }
            ReportRequest::PsReady => {
                self.job_manager.post_ps_ready();
                true
            }
            ReportRequest::KeyValuePair { key, value } => {
                self.kv_store.set(&key, value);
                true
            }
            ReportRequest::ParallelConfig(config) => {
                self.job_manager
                    .update_node_paral_config(node_type, node_id, config);
                true
            }
            ReportRequest::NodeCheckpointState { step } => {
                self.training_rdzv.sync_ckpt_nodes(node_id, step)
            }
            ReportRequest::DiagnosisReportData { data, .. } => {
                self.diagnosis_manager.collect_diagnosis_data(data);
                true
            }
            ReportRequest::Event {
                event_type,
                instance,
                action,
                msg,
                ..
            } => {
                info!(
                    event_type = %event_type,
                    instance = %instance,
                    action = %action,
                    "Node event: {}",
                    msg
                );
                true
            }
        }
    }

    fn check_start_auto_scale_worker(&self) {
        if self.start_autoscale.load(Ordering::SeqCst) {
            return;
        }
        let sample_count = self.speed_monitor.sample_count();
        if sample_count >= self.config.sample_count_to_adjust_worker
            && !self.start_autoscale.swap(true, Ordering::SeqCst)
        {
            info!(samples = sample_count, "Starting autoscale from speed samples");
            self.job_manager.start_auto_scaling();
        }
    }

    /// Jobs that never report steps still get scaled after a timeout
    fn check_non_training_autoscale(&self) {
        if self.start_autoscale.load(Ordering::SeqCst)
            || self.speed_monitor.completed_global_step() != 0
        {
            return;
        }
        let started = self.start_training_time.load(Ordering::SeqCst);
        if started > 0
            && unix_now().saturating_sub(started) > self.config.seconds_to_autoscale_worker
            && !self.start_autoscale.swap(true, Ordering::SeqCst)
        {
            info!("Starting autoscale for non-training job");
            self.job_manager.start_auto_scaling();
        }
    }
}

fn node_meta(node: &Node) -> NodeMetaInfo {
    NodeMetaInfo {
        node_type: Some(node.node_type),
        addr: node.service_addr.clone(),
        cpu: node.config_resource.cpu,
        memory: node.config_resource.memory,
        gpu_type: node.config_resource.gpu_type.clone(),
        gpu_num: node.config_resource.gpu_num,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[tonic::async_trait]
impl proto::master_server::Master for MasterServicer {
    async fn report(
        &self,
        request: Request<proto::Message>,
    ) -> Result<Response<proto::Response>, Status> {
        let envelope = request.into_inner();
        let node_type = envelope
            .node_type
            .parse::<NodeType>()
            .unwrap_or(NodeType::Worker);

        let success = match api::decode::<ReportRequest>(&envelope.data) {
            Ok(message) => self.handle_report(node_type, envelope.node_id, message),
            Err(e) => {
                warn!(node_id = envelope.node_id, error = %e, "Undecodable report payload");
                false
            }
        };
        Ok(Response::new(proto::Response { success }))
    }

    async fn get(
        &self,
        request: Request<proto::Message>,
    ) -> Result<Response<proto::Message>, Status> {
        let envelope = request.into_inner();
        let node_type = envelope
            .node_type
            .parse::<NodeType>()
            .unwrap_or(NodeType::Worker);

        let mut response = proto::Message::default();
        match api::decode::<GetRequest>(&envelope.data) {
            Ok(message) => {
                let reply = self.handle_get(node_type, envelope.node_id, message);
                match api::encode(&reply) {
                    Ok(data) => response.data = data,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode reply; returning empty payload");
                    }
                }
            }
            Err(e) => {
                warn!(node_id = envelope.node_id, error = %e, "Undecodable get payload");
            }
        }
        Ok(Response::new(response))
    }
}
