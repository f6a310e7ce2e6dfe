//! Constants shared by the master and its clients

use std::time::Duration;

/// Default timeout for a node to join a rendezvous round before the
/// round is abandoned
pub const RDZV_JOIN_TIMEOUT_DEFAULT: Duration = Duration::from_secs(600);

/// Default countdown once a rendezvous round has reached quorum
pub const RDZV_WAITING_TIMEOUT_DEFAULT: Duration = Duration::from_secs(30);

/// Sleep between iterations of the client fault/straggler poll loops
pub const CHECK_FAULT_SLEEP: Duration = Duration::from_secs(3);

/// Default caller deadline for the fault/straggler poll loops
pub const CHECK_POLL_TIMEOUT_DEFAULT: Duration = Duration::from_secs(300);

/// Period at which nodes send heartbeats
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(15);

/// A node with no heartbeat for this long is HEARTBEAT_MISSED
pub const HEARTBEAT_TIMEOUT_DEFAULT: Duration = Duration::from_secs(60);

/// A node with no heartbeat for this long is FAILED
pub const NODE_FAILURE_TIMEOUT_DEFAULT: Duration = Duration::from_secs(120);

/// Default lifetime of an event action returned via heartbeat
pub const ACTION_EXPIRED_TIME_PERIOD_DEFAULT: u64 = 600;

/// Maximum gRPC message size in both directions
pub const GRPC_MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Shard size defaults to batch_size times this many minibatches when a
/// node reports 0
pub const DEFAULT_NUM_MINIBATCHES_PER_SHARD: u64 = 100;

/// A dispatched task unreported for this long is requeued
pub const TASK_TIMEOUT: Duration = Duration::from_secs(1800);

/// Client-side retry policy for transport failures
pub const MASTER_CLIENT_RETRY_ATTEMPTS: usize = 10;
pub const MASTER_CLIENT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Default timeout of a single client request
pub const MASTER_CLIENT_TIMEOUT_DEFAULT: Duration = Duration::from_secs(5);

/// Bound on concurrently served requests
pub const REQUEST_CONCURRENCY: usize = 64;

/// A network-check group member slower than the group median by this
/// factor is a straggler
pub const STRAGGLER_TIME_RATIO_DEFAULT: f64 = 3.0;
