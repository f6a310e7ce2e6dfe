//! Master binary entry point
//!
//! Starts the coordination master for one elastic training job. Exits
//! non-zero on configuration errors before any worker can connect.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use master::{MasterServer, MasterServicer, ServerConfig};
use node_core::constants::HEARTBEAT_PERIOD;
use node_core::{env, MasterConfig, PlatformKind};

#[derive(Parser, Debug)]
#[command(name = "dlock-master", about = "Elastic training coordination master")]
struct Args {
    /// Port the master serves on
    #[arg(long, default_value_t = 50001)]
    port: u16,

    /// Number of nodes the job was launched with
    #[arg(long = "node_num", default_value_t = 1)]
    node_num: usize,

    /// Name of the training job
    #[arg(long = "job_name", env = env::JOB_NAME)]
    job_name: String,

    /// Platform the job runs on
    #[arg(long, default_value = "local")]
    platform: String,

    /// Namespace of the job on the platform
    #[arg(long, default_value = "default")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "master=info,node_core=info,data_shard=info,rendezvous=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let platform: PlatformKind = args.platform.parse()?;

    let mut config = MasterConfig::new(args.job_name, args.node_num);
    config.platform = platform;
    config.namespace = args.namespace;
    config.config_master_port(args.port);
    let config = Arc::new(config);
    config.log_config();

    let servicer = Arc::new(MasterServicer::new(config.clone()));

    // Heartbeat liveness sweeps run for the lifetime of the master
    let sweeper = master::job_manager::spawn_liveness_sweeper(
        servicer.job_manager().clone(),
        HEARTBEAT_PERIOD,
    );

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let server = MasterServer::with_config(
        servicer,
        ServerConfig {
            addr,
            ..Default::default()
        },
    );
    let result = server.run().await;

    sweeper.abort();
    result
}
