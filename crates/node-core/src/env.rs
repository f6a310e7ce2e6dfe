//! Environment variables consumed by the master process and its clients

use std::time::Duration;

pub const DLOCK_MASTER_ADDR: &str = "DLOCK_MASTER_ADDR";
pub const MASTER_CLIENT_TIMEOUT: &str = "MASTER_CLIENT_TIMEOUT";
pub const NODE_ID: &str = "NODE_ID";
pub const NODE_TYPE: &str = "NODE_TYPE";
pub const NODE_RANK: &str = "NODE_RANK";
pub const NODE_IP: &str = "NODE_IP";
pub const LOCAL_RANK: &str = "LOCAL_RANK";
pub const JOB_NAME: &str = "JOB_NAME";
pub const TORCHELASTIC_RUN_ID: &str = "TORCHELASTIC_RUN_ID";

/// Address of the job master, e.g. "10.0.0.2:50001"
pub fn master_addr() -> Option<String> {
    std::env::var(DLOCK_MASTER_ADDR).ok().filter(|s| !s.is_empty())
}

/// Per-request client timeout override
pub fn master_client_timeout() -> Option<Duration> {
    std::env::var(MASTER_CLIENT_TIMEOUT)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Ordered node id assigned by the launcher, 0 when unset
pub fn node_id() -> i64 {
    parse_or_zero(NODE_ID)
}

/// Role of the local node, worker when unset
pub fn node_type() -> crate::NodeType {
    std::env::var(NODE_TYPE)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(crate::NodeType::Worker)
}

/// Node rank assigned by the launcher, -1 when unset
pub fn node_rank() -> i64 {
    std::env::var(NODE_RANK)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(-1)
}

/// IP of the local node, empty when unset
pub fn node_ip() -> String {
    std::env::var(NODE_IP).unwrap_or_default()
}

/// Local process rank inside the node, 0 when unset
pub fn local_rank() -> i64 {
    parse_or_zero(LOCAL_RANK)
}

/// Job name, falling back to the torchelastic run id
pub fn job_name() -> Option<String> {
    std::env::var(JOB_NAME)
        .or_else(|_| std::env::var(TORCHELASTIC_RUN_ID))
        .ok()
        .filter(|s| !s.is_empty())
}

fn parse_or_zero(key: &str) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}
