//! Master configuration
//!
//! The configuration is built once at startup and passed explicitly to
//! each component. Only the serving port may change after construction
//! (when the requested port is busy and the platform picks another),
//! so it sits behind an atomic with a delimited setter.

use crate::constants;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

/// Platform the job runs on; only the local pieces matter to the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformKind {
    Local,
    Kubernetes,
    PyKubernetes,
    Ray,
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlatformKind::Local => "local",
            PlatformKind::Kubernetes => "kubernetes",
            PlatformKind::PyKubernetes => "py_kubernetes",
            PlatformKind::Ray => "ray",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PlatformKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(PlatformKind::Local),
            "kubernetes" => Ok(PlatformKind::Kubernetes),
            "py_kubernetes" => Ok(PlatformKind::PyKubernetes),
            "ray" => Ok(PlatformKind::Ray),
            other => Err(crate::Error::InvalidConfig {
                message: format!("unknown platform: {}", other),
            }),
        }
    }
}

/// Master-wide configuration, shared read-only across components
#[derive(Debug)]
pub struct MasterConfig {
    /// Serving port; mutable because the platform may rebind
    port: AtomicU16,

    /// Number of nodes the job was launched with
    pub node_num: usize,

    pub job_name: String,
    pub platform: PlatformKind,
    pub namespace: String,

    /// Liveness thresholds
    pub heartbeat_timeout: Duration,
    pub failure_timeout: Duration,

    /// A dispatched task unreported for this long is requeued
    pub task_timeout: Duration,

    /// Autoscale triggers
    pub sample_count_to_adjust_worker: usize,
    pub seconds_to_autoscale_worker: u64,

    /// Straggler threshold relative to the group median
    pub straggler_time_ratio: f64,

    /// Bound on concurrently served requests
    pub request_concurrency: usize,
}

impl MasterConfig {
    pub fn new(job_name: impl Into<String>, node_num: usize) -> Self {
        Self {
            job_name: job_name.into(),
            node_num,
            ..Default::default()
        }
    }

    /// Record the port the master actually bound
    pub fn config_master_port(&self, port: u16) {
        self.port.store(port, Ordering::SeqCst);
    }

    /// The port the master serves on, 0 before binding
    pub fn master_port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    /// Log the effective configuration at startup
    pub fn log_config(&self) {
        tracing::info!(
            job = %self.job_name,
            node_num = self.node_num,
            platform = %self.platform,
            namespace = %self.namespace,
            heartbeat_timeout_secs = self.heartbeat_timeout.as_secs(),
            failure_timeout_secs = self.failure_timeout.as_secs(),
            "Master configuration"
        );
    }

    /// Config map served to agents via ElasticRunConfigRequest
    pub fn elastic_run_configs(&self) -> std::collections::HashMap<String, String> {
        let mut configs = std::collections::HashMap::new();
        configs.insert("job_name".to_string(), self.job_name.clone());
        configs.insert("node_num".to_string(), self.node_num.to_string());
        configs.insert("platform".to_string(), self.platform.to_string());
        configs.insert("namespace".to_string(), self.namespace.clone());
        configs
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            port: AtomicU16::new(0),
            node_num: 1,
            job_name: String::new(),
            platform: PlatformKind::Local,
            namespace: "default".to_string(),
            heartbeat_timeout: constants::HEARTBEAT_TIMEOUT_DEFAULT,
            failure_timeout: constants::NODE_FAILURE_TIMEOUT_DEFAULT,
            task_timeout: constants::TASK_TIMEOUT,
            sample_count_to_adjust_worker: 5,
            seconds_to_autoscale_worker: 1800,
            straggler_time_ratio: constants::STRAGGLER_TIME_RATIO_DEFAULT,
            request_concurrency: constants::REQUEST_CONCURRENCY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_setter() {
        let config = MasterConfig::new("job", 2);
        assert_eq!(config.master_port(), 0);
        config.config_master_port(50001);
        assert_eq!(config.master_port(), 50001);
    }

    #[test]
    fn test_platform_parsing() {
        assert_eq!("ray".parse::<PlatformKind>().unwrap(), PlatformKind::Ray);
        assert!("mesos".parse::<PlatformKind>().is_err());
    }

    #[test]
    fn test_elastic_run_configs() {
        let config = MasterConfig::new("train-llm", 4);
        let configs = config.elastic_run_configs();
        assert_eq!(configs.get("job_name").unwrap(), "train-llm");
        assert_eq!(configs.get("node_num").unwrap(), "4");
    }
}
