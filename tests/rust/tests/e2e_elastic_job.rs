//! Simulation of an elastic training job against a live master
//!
//! Several workers form a world, pull shards concurrently, survive a
//! mid-flight failure, and replay dispatch state from a checkpoint.

use anyhow::Result;
use master::{MasterClient, MasterGrpcServer, MasterServicer};
use node_core::constants::GRPC_MAX_MESSAGE_SIZE;
use node_core::{MasterConfig, NodeType, RendezvousName, TaskType};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tonic::transport::Server;

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

#[tokio::test]
async fn test_elastic_training_simulation() -> Result<()> {
    const WORKERS: i64 = 4;
    let (addr, _shutdown, servicer) =
        start_master(MasterConfig::new("sim-job", WORKERS as usize)).await?;

    // Bring up the workers and the rendezvous
    let mut clients = Vec::new();
    for id in 0..WORKERS {
        clients.push(MasterClient::connect(&addr, id, NodeType::Worker).await?);
    }
    clients[0]
        .report_rdzv_params(WORKERS as usize, WORKERS as usize, 30, 1, 600)
        .await?;
    for (rank, client) in clients.iter().enumerate() {
        client
            .join_rendezvous(rank as i64, 2, RendezvousName::ElasticTraining)
            .await?;
    }
    let (_, group, world) = clients[0]
        .get_comm_world(RendezvousName::ElasticTraining, 0)
        .await?;
    assert_eq!(group, 1);
    assert_eq!(world.len(), WORKERS as usize);

    // Every node is alive before training starts
    for client in &clients {
        assert!(client.report_heart_beat(1_700_000_000).await?.is_no_action());
    }

    // 80 records, batch 4, 1 minibatch per shard: 20 shards
    clients[0]
        .report_dataset_shard_params(4, 1, 80, true, 1, "webtext", TaskType::Training, "text")
        .await?;

    // Workers drain the dataset concurrently
    let mut handles = Vec::new();
    for client in clients.iter().cloned() {
        handles.push(tokio::spawn(async move {
            let mut done: Vec<(u64, u64)> = Vec::new();
            let mut step = 0u64;
            loop {
                let task = client.get_task("webtext").await.expect("get task");
                match task.task_type {
                    TaskType::Training => {
                        step += 1;
                        client
                            .report_global_step(step, 1_700_000_000 + step, 0.2)
                            .await
                            .expect("report step");
                        client
                            .report_task_result("webtext", task.task_id, "")
                            .await
                            .expect("report result");
                        client
                            .report_heart_beat(1_700_000_000 + step)
                            .await
                            .expect("heartbeat");
                        done.push((task.shard.start, task.shard.end));
                    }
                    TaskType::Wait => sleep(Duration::from_millis(10)).await,
                    _ => break,
                }
            }
            done
        }));
    }

    let mut all_shards = Vec::new();
    for handle in handles {
        all_shards.extend(handle.await?);
    }

    // Every shard completed exactly once across the fleet
    assert_eq!(all_shards.len(), 20);
    let distinct: HashSet<(u64, u64)> = all_shards.iter().copied().collect();
    assert_eq!(distinct.len(), 20);

    let stats = servicer.task_manager().dataset_stats("webtext").unwrap();
    assert_eq!(stats.completed, 20);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.doing, 0);
    assert_eq!(
        stats.pending as u64 + stats.doing as u64 + stats.completed,
        stats.produced
    );

    // The nodes all heartbeated and count as running
    assert_eq!(servicer.job_manager().get_running_nodes().len(), WORKERS as usize);
    Ok(())
}

#[tokio::test]
async fn test_failed_worker_tasks_are_reassigned() -> Result<()> {
    let (addr, _shutdown, servicer) = start_master(MasterConfig::new("fail-job", 2)).await?;

    let healthy = MasterClient::connect(&addr, 0, NodeType::Worker).await?;
    let doomed = MasterClient::connect(&addr, 1, NodeType::Worker).await?;

    healthy
        .report_dataset_shard_params(2, 1, 12, false, 1, "iris", TaskType::Training, "table")
        .await?;

    // The doomed worker holds a task when it dies
    let held = doomed.get_task("iris").await?;
    assert_eq!(held.task_type, TaskType::Training);
    doomed.report_failed_exited().await?;

    assert_eq!(
        servicer.task_manager().dataset_stats("iris").unwrap().doing,
        0
    );

    // The healthy worker finishes everything, including the held shard
    let mut seen = Vec::new();
    loop {
        let task = healthy.get_task("iris").await?;
        if task.task_type != TaskType::Training {
            break;
        }
        seen.push((task.shard.start, task.shard.end));
        healthy.report_task_result("iris", task.task_id, "").await?;
    }
    assert!(seen.contains(&(held.shard.start, held.shard.end)));
    assert_eq!(seen.len(), 6);
    Ok(())
}

#[tokio::test]
async fn test_shard_checkpoint_replay_over_wire() -> Result<()> {
    let (addr, _shutdown, servicer) = start_master(MasterConfig::new("ckpt-job", 1)).await?;
    let client = MasterClient::connect(&addr, 0, NodeType::Worker).await?;

    client
        .report_dataset_shard_params(2, 1, 10, false, 1, "iris", TaskType::Training, "table")
        .await?;
    let task = client.get_task("iris").await?;
    client.report_task_result("iris", task.task_id, "").await?;
    let held = client.get_task("iris").await?;

    // The worker holds the checkpoint across a (simulated) hiccup
    let checkpoint = client.get_shard_checkpoint("iris").await?;
    assert!(!checkpoint.is_empty());

    assert!(client.report_shard_checkpoint(&checkpoint).await?);
    let stats = servicer.task_manager().dataset_stats("iris").unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.doing, 0);

    // The held task is pending again after the replay
    let next = client.get_task("iris").await?;
    assert_eq!(next.shard, held.shard);
    Ok(())
}

#[tokio::test]
async fn test_checkpoint_step_sync() -> Result<()> {
    let (addr, _shutdown, _servicer) = start_master(MasterConfig::new("sync-job", 2)).await?;

    let a = MasterClient::connect(&addr, 0, NodeType::Worker).await?;
    let b = MasterClient::connect(&addr, 1, NodeType::Worker).await?;
    a.report_rdzv_params(2, 2, 30, 1, 600).await?;
    a.join_rendezvous(0, 8, RendezvousName::ElasticTraining).await?;
    b.join_rendezvous(1, 8, RendezvousName::ElasticTraining).await?;

    assert!(!a.sync_checkpoint(500).await?);
    assert!(b.sync_checkpoint(500).await?);
    Ok(())
}
