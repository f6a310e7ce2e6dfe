//! gRPC server setup with graceful shutdown
//!
//! Binds the master service with the job-wide message size limits and
//! a bounded request concurrency, and runs until Ctrl+C or SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tonic::transport::Server;
use tracing::{error, info};

use crate::proto::master_server::MasterServer as MasterGrpcServer;
use crate::servicer::MasterServicer;
use node_core::constants::{GRPC_MAX_MESSAGE_SIZE, REQUEST_CONCURRENCY};

/// Master server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub addr: SocketAddr,

    /// Bound on concurrently served requests per connection
    pub concurrency_limit: usize,

    /// TCP keepalive interval
    pub tcp_keepalive: Option<Duration>,

    /// Request timeout
    pub request_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:50001".parse().expect("static addr"),
            concurrency_limit: REQUEST_CONCURRENCY,
            tcp_keepalive: Some(Duration::from_secs(60)),
            request_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// The master gRPC server
pub struct MasterServer {
    config: ServerConfig,
    servicer: Arc<MasterServicer>,
}

impl MasterServer {
    pub fn new(servicer: Arc<MasterServicer>) -> Self {
        Self {
            config: ServerConfig::default(),
            servicer,
        }
    }

    pub fn with_config(servicer: Arc<MasterServicer>, config: ServerConfig) -> Self {
        Self { config, servicer }
    }

    /// Run the server until a shutdown signal
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = self.config.addr;

        let grpc_service = MasterGrpcServer::from_arc(self.servicer)
            .max_decoding_message_size(GRPC_MAX_MESSAGE_SIZE)
            .max_encoding_message_size(GRPC_MAX_MESSAGE_SIZE);

        let mut builder = Server::builder()
            .concurrency_limit_per_connection(self.config.concurrency_limit);

        if let Some(keepalive) = self.config.tcp_keepalive {
            builder = builder.tcp_keepalive(Some(keepalive));
        }
        if let Some(timeout) = self.config.request_timeout {
            builder = builder.timeout(timeout);
        }

        info!(address = %addr, "Master server listening");

        builder
            .add_service(grpc_service)
            .serve_with_shutdown(addr, shutdown_signal())
            .await
            .map_err(|e| {
                error!(error = %e, "Master server error");
                Box::new(e) as Box<dyn std::error::Error + Send + Sync>
            })?;

        info!("Master server shutdown complete");
        Ok(())
    }

    /// Run the server on a specific address
    pub async fn run_on(
        mut self,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.config.addr = addr;
        self.run().await
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
