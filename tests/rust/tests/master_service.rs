//! End-to-end tests over a live master server
//!
//! Each test boots the gRPC server on a free port and drives it with
//! the typed client, the same way a worker agent does.

use anyhow::Result;
use master::diagnosis::{
    coordinate_solutions, DiagnosisAction, Inference, InferenceAttribute, InferenceDescription,
    InferenceName, EVENT_ACTION, EVENT_INSTANCE, EVENT_LABELS, EVENT_MSG, EVENT_TYPE,
};
use master::{MasterClient, MasterGrpcServer, MasterServicer};
use node_core::constants::{ACTION_EXPIRED_TIME_PERIOD_DEFAULT, GRPC_MAX_MESSAGE_SIZE};
use node_core::{
    MasterConfig, NetworkFailureReason, NodeType, RendezvousName, TaskType, TrainingLoopStatus,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tonic::transport::Server;

/// Boot a master on a random port; returns the address, a shutdown
/// sender and the servicer for white-box assertions
async fn start_master(
    config: MasterConfig,
) -> Result<(String, oneshot::Sender<()>, Arc<MasterServicer>)> {
    let servicer = Arc::new(MasterServicer::new(Arc::new(config)));

    let port = portpicker::pick_unused_port().expect("No ports free");
    let addr = SocketAddr::from_str(&format!("127.0.0.1:{}", port))?;
    let (tx, rx) = oneshot::channel();

    let svc = MasterGrpcServer::from_arc(servicer.clone())
        .max_decoding_message_size(GRPC_MAX_MESSAGE_SIZE)
        .max_encoding_message_size(GRPC_MAX_MESSAGE_SIZE);
    let server = Server::builder()
        .add_service(svc)
        .serve_with_shutdown(addr, async {
            rx.await.ok();
        });
    tokio::spawn(server);
    sleep(Duration::from_millis(100)).await;

    Ok((format!("127.0.0.1:{}", port), tx, servicer))
}

async fn worker(addr: &str, node_id: i64) -> Result<MasterClient> {
    Ok(MasterClient::connect(addr, node_id, NodeType::Worker).await?)
}

#[tokio::test]
async fn test_happy_rendezvous() -> Result<()> {
    let (addr, _shutdown, _servicer) = start_master(MasterConfig::new("rdzv-job", 3)).await?;

    let clients = [
        worker(&addr, 0).await?,
        worker(&addr, 1).await?,
        worker(&addr, 2).await?,
    ];
    clients[0].report_rdzv_params(2, 4, 2, 1, 600).await?;

    for (rank, client) in clients.iter().enumerate() {
        let round = client
            .join_rendezvous(rank as i64, 8, RendezvousName::ElasticTraining)
            .await?;
        assert_eq!(round, 0);
    }

    // Quorum is met; the waiting countdown freezes the round
    sleep(Duration::from_millis(2500)).await;
    assert_eq!(
        clients[0]
            .num_nodes_waiting(RendezvousName::ElasticTraining)
            .await,
        0
    );

    let (round, group, world) = clients[0]
        .get_comm_world(RendezvousName::ElasticTraining, 0)
        .await?;
    assert_eq!(round, 0);
    assert_eq!(group, 1);
    assert_eq!(world.len(), 3);
    for rank in 0..3u64 {
        assert_eq!(world.get(&rank).copied(), Some(8));
    }
    Ok(())
}

#[tokio::test]
async fn test_round_rollover_on_new_joiner() -> Result<()> {
    let (addr, _shutdown, _servicer) = start_master(MasterConfig::new("rdzv-job", 4)).await?;

    let a = worker(&addr, 0).await?;
    a.report_rdzv_params(2, 3, 30, 1, 600).await?;
    for id in 0..3 {
        let client = worker(&addr, id).await?;
        client
            .join_rendezvous(id, 8, RendezvousName::ElasticTraining)
            .await?;
    }
    // Three joins hit max_nodes and freeze round 0
    let (round, _, world) = a.get_comm_world(RendezvousName::ElasticTraining, 0).await?;
    assert_eq!(round, 0);
    assert_eq!(world.len(), 3);

    // A fresh node opens the next round
    let d = worker(&addr, 3).await?;
    let round = d
        .join_rendezvous(3, 8, RendezvousName::ElasticTraining)
        .await?;
    assert_eq!(round, 1);

    a.report_rdzv_params(2, 4, 30, 1, 600).await?;
    for id in 0..3 {
        let client = worker(&addr, id).await?;
        client
            .join_rendezvous(id, 8, RendezvousName::ElasticTraining)
            .await?;
    }
    let (round, _, world) = a.get_comm_world(RendezvousName::ElasticTraining, 0).await?;
    assert_eq!(round, 1);
    assert_eq!(world.len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_task_reassignment_after_failure() -> Result<()> {
    let (addr, _shutdown, servicer) = start_master(MasterConfig::new("task-job", 2)).await?;

    let a = worker(&addr, 0).await?;
    let b = worker(&addr, 1).await?;

    // size 10, batch 2, one minibatch per shard: 5 shards
    assert!(
        a.report_dataset_shard_params(2, 1, 10, false, 1, "iris", TaskType::Training, "table")
            .await?
    );

    let task = a.get_task("iris").await?;
    assert_eq!(task.task_type, TaskType::Training);
    assert!(!a.report_task_result("iris", task.task_id, "io error").await?);

    // The failed shard is served again, to another worker
    let retry = b.get_task("iris").await?;
    assert_eq!(retry.shard, task.shard);

    // Drain the dataset; exactly 5 distinct shards complete
    let mut completed = vec![(retry.shard.start, retry.shard.end)];
    b.report_task_result("iris", retry.task_id, "").await?;
    loop {
        let task = b.get_task("iris").await?;
        if task.task_type != TaskType::Training {
            break;
        }
        completed.push((task.shard.start, task.shard.end));
        b.report_task_result("iris", task.task_id, "").await?;
    }
    completed.sort_unstable();
    completed.dedup();
    assert_eq!(completed.len(), 5);

    let stats = servicer.task_manager().dataset_stats("iris").unwrap();
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.doing, 0);
    Ok(())
}

#[tokio::test]
async fn test_network_check_supersedes_training() -> Result<()> {
    let (addr, _shutdown, _servicer) = start_master(MasterConfig::new("check-job", 2)).await?;

    let a = worker(&addr, 0).await?;
    let b = worker(&addr, 1).await?;
    a.report_rdzv_params(2, 8, 60, 1, 600).await?;

    a.join_rendezvous(0, 8, RendezvousName::ElasticTraining).await?;
    b.join_rendezvous(1, 8, RendezvousName::ElasticTraining).await?;
    assert_eq!(a.num_nodes_waiting(RendezvousName::ElasticTraining).await, 2);

    // A joining the network check clears the training membership
    a.join_rendezvous(0, 8, RendezvousName::NetworkCheck).await?;
    assert_eq!(a.num_nodes_waiting(RendezvousName::ElasticTraining).await, 0);
    assert_eq!(a.num_nodes_waiting(RendezvousName::NetworkCheck).await, 1);
    Ok(())
}

#[tokio::test]
async fn test_network_check_all_clear() -> Result<()> {
    let (addr, _shutdown, _servicer) = start_master(MasterConfig::new("check-job", 2)).await?;

    let a = worker(&addr, 0).await?;
    let b = worker(&addr, 1).await?;
    a.report_rdzv_params(2, 2, 60, 1, 600).await?;
    a.join_rendezvous(0, 8, RendezvousName::NetworkCheck).await?;
    b.join_rendezvous(1, 8, RendezvousName::NetworkCheck).await?;

    a.report_network_check_status(0, true, 1.2).await?;
    b.report_network_check_status(1, true, 1.1).await?;

    let (nodes, reason) = a.check_fault_node(Some(Duration::from_secs(10))).await?;
    assert!(nodes.is_empty());
    assert_eq!(reason, NetworkFailureReason::None);
    Ok(())
}

#[tokio::test]
async fn test_straggler_detection_over_wire() -> Result<()> {
    let (addr, _shutdown, _servicer) = start_master(MasterConfig::new("check-job", 3)).await?;

    let clients = [
        worker(&addr, 0).await?,
        worker(&addr, 1).await?,
        worker(&addr, 2).await?,
    ];
    clients[0].report_rdzv_params(3, 3, 60, 1, 600).await?;
    for (rank, client) in clients.iter().enumerate() {
        client
            .join_rendezvous(rank as i64, 8, RendezvousName::NetworkCheck)
            .await?;
    }
    clients[0].report_network_check_status(0, true, 1.0).await?;
    clients[1].report_network_check_status(1, true, 1.1).await?;
    clients[2].report_network_check_status(2, true, 30.0).await?;

    let (nodes, reason) = clients[0].check_straggler(Some(Duration::from_secs(10))).await?;
    assert_eq!(reason, NetworkFailureReason::Straggler);
    assert_eq!(nodes, vec![2]);
    Ok(())
}

#[tokio::test]
async fn test_event_action_rides_heartbeat() -> Result<()> {
    let (addr, _shutdown, servicer) = start_master(MasterConfig::new("diag-job", 1)).await?;
    let client = worker(&addr, 0).await?;

    let solutions = vec![Inference {
        name: InferenceName::Action,
        attribution: InferenceAttribute::Is,
        description: InferenceDescription::Event,
        configs: HashMap::from([
            (EVENT_TYPE.to_string(), "X".to_string()),
            (EVENT_INSTANCE.to_string(), "n0".to_string()),
            (EVENT_ACTION.to_string(), "kill".to_string()),
            (EVENT_MSG.to_string(), "m".to_string()),
            (EVENT_LABELS.to_string(), "{}".to_string()),
        ]),
    }];
    let action = coordinate_solutions(&solutions);
    servicer
        .job_manager()
        .enqueue_action(NodeType::Worker, 0, action);

    let DiagnosisAction::EventAction(received) = client.report_heart_beat(1234).await? else {
        panic!("expected an event action");
    };
    assert_eq!(received.event_type, "X");
    assert_eq!(received.event_instance, "n0");
    assert_eq!(received.event_action, "kill");
    assert_eq!(received.event_msg, "m");
    assert!(received.event_labels.is_empty());
    assert_eq!(
        received.expired_time_period,
        ACTION_EXPIRED_TIME_PERIOD_DEFAULT
    );
    assert_eq!(received.executable_time_period, 0);

    // The queue drains: the next heartbeat carries no action
    assert!(client.report_heart_beat(1235).await?.is_no_action());
    Ok(())
}

#[tokio::test]
async fn test_barrier_with_explicit_notify() -> Result<()> {
    let (addr, _shutdown, _servicer) = start_master(MasterConfig::new("sync-job", 3)).await?;

    let clients = [
        worker(&addr, 0).await?,
        worker(&addr, 1).await?,
        worker(&addr, 2).await?,
    ];
    for client in &clients {
        assert!(!client.barrier("B1", false).await?);
    }

    let admin = worker(&addr, 99).await?;
    assert!(admin.barrier("B1", true).await?);

    for client in &clients {
        assert!(client.barrier("B1", false).await?);
    }
    // One-shot latched: a late caller passes immediately
    let late = worker(&addr, 3).await?;
    assert!(late.barrier("B1", false).await?);
    Ok(())
}

#[tokio::test]
async fn test_kv_store_and_cluster_version() -> Result<()> {
    let (addr, _shutdown, _servicer) = start_master(MasterConfig::new("kv-job", 1)).await?;
    let client = worker(&addr, 0).await?;

    assert!(client.kv_store_set("store/init", b"ok".to_vec()).await?);
    assert_eq!(client.kv_store_get("store/init").await?, b"ok");
    assert!(client.kv_store_get("absent").await?.is_empty());

    assert_eq!(
        client
            .get_cluster_version("global", NodeType::Worker, 0)
            .await?,
        0
    );
    client
        .update_cluster_version("global", 5, NodeType::Worker, 0)
        .await?;
    assert_eq!(
        client
            .get_cluster_version("global", NodeType::Worker, 0)
            .await?,
        5
    );
    Ok(())
}

#[tokio::test]
async fn test_ps_flow_and_running_nodes() -> Result<()> {
    let (addr, _shutdown, _servicer) = start_master(MasterConfig::new("ps-job", 2)).await?;

    let ps = MasterClient::connect(&addr, 0, NodeType::Ps).await?;
    let w = worker(&addr, 0).await?;

    ps.report_heart_beat(1).await?;
    w.report_heart_beat(1).await?;
    ps.update_node_addr(NodeType::Ps, 0, "10.0.0.9:3333").await?;

    let (ps_nodes, ready, failure) = w.query_ps_nodes().await?;
    assert_eq!(ps_nodes.len(), 1);
    assert_eq!(ps_nodes[0].addr, "10.0.0.9:3333");
    assert!(!ready);
    assert!(!failure);

    assert!(ps.ready_for_ps_relaunch().await?);
    let (_, ready, _) = w.query_ps_nodes().await?;
    assert!(ready);

    let running = w.get_running_nodes().await?;
    assert_eq!(running.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_training_status_and_ports_and_configs() -> Result<()> {
    let (addr, _shutdown, _servicer) = start_master(MasterConfig::new("misc-job", 2)).await?;
    let a = worker(&addr, 0).await?;
    let b = worker(&addr, 1).await?;

    assert_eq!(a.query_training_status().await?, TrainingLoopStatus::Pending);

    let first = a.sync_training_ports(20000).await?;
    assert_eq!(first.training_port, 0);
    assert_eq!(first.next_check_port, 20001);
    let agreed = b.sync_training_ports(20000).await?;
    assert_eq!(agreed.training_port, 20000);

    let configs = a.get_elastic_run_config().await?;
    assert_eq!(configs.get("job_name").map(String::as_str), Some("misc-job"));
    assert_eq!(configs.get("node_num").map(String::as_str), Some("2"));
    Ok(())
}

#[tokio::test]
async fn test_unknown_payload_is_rejected_not_errored() -> Result<()> {
    let (addr, _shutdown, _servicer) = start_master(MasterConfig::new("bad-job", 1)).await?;

    let mut raw = master::MasterGrpcClient::connect(format!("http://{}", addr)).await?;
    let garbage = master::proto::Message {
        node_id: 0,
        node_type: "worker".to_string(),
        data: b"{\"SelfDestruct\":{}}".to_vec(),
    };

    let response = raw.report(garbage.clone()).await?;
    assert!(!response.into_inner().success);

    let response = raw.get(garbage).await?;
    assert!(response.into_inner().data.is_empty());
    Ok(())
}
