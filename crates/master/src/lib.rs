//! Coordination master for elastic distributed training
//!
//! A long-running service a fluctuating set of worker nodes attaches
//! to. The master multiplexes two RPCs over typed payloads and routes
//! them to:
//! - **Task manager**: dataset shard queues with reassignment
//! - **Rendezvous managers**: training and network-check membership
//! - **KV store / sync service**: ad-hoc worker coordination
//! - **Job manager**: node inventory, liveness, diagnosis actions
//!
//! # Example
//!
//! ```ignore
//! use master::{MasterServer, MasterServicer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = std::sync::Arc::new(node_core::MasterConfig::new("job", 2));
//!     let servicer = std::sync::Arc::new(MasterServicer::new(config));
//!     MasterServer::new(servicer).run().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod client;
pub mod diagnosis;
pub mod elastic_ps;
pub mod job_manager;
pub mod kv_store;
pub mod proto;
pub mod server;
pub mod servicer;
pub mod speed_monitor;
pub mod sync_service;

pub use client::MasterClient;
pub use server::{MasterServer, ServerConfig};
pub use servicer::MasterServicer;

// Re-export the generated service wrappers for embedding
pub use proto::master_client::MasterClient as MasterGrpcClient;
pub use proto::master_server::MasterServer as MasterGrpcServer;
