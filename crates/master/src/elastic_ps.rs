//! Cluster-version bookkeeping for elastic parameter-server mode
//!
//! Workers and parameter servers agree on a checkpoint generation by
//! publishing versions keyed on role, task id and version type. The
//! service is inert in allreduce mode.

use node_core::{NodeId, NodeType};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

type VersionKey = (NodeId, String);

/// Monotonic per-key version table, one map per role
#[derive(Debug, Default)]
pub struct ElasticPsService {
    worker_versions: Mutex<HashMap<VersionKey, u64>>,
    ps_versions: Mutex<HashMap<VersionKey, u64>>,
}

impl ElasticPsService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a version for the given role, 0 when absent
    pub fn get_version(&self, role: NodeType, task_id: NodeId, version_type: &str) -> u64 {
        let table = match role {
            NodeType::Ps => &self.ps_versions,
            _ => &self.worker_versions,
        };
        table
            .lock()
            .get(&(task_id, version_type.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Overwrite a version for the given role
    pub fn update_version(
        &self,
        role: NodeType,
        task_id: NodeId,
        version_type: &str,
        version: u64,
    ) {
        let table = match role {
            NodeType::Ps => &self.ps_versions,
            _ => &self.worker_versions,
        };
        table
            .lock()
            .insert((task_id, version_type.to_string()), version);
        debug!(
            role = %role,
            task_id = task_id,
            version_type = version_type,
            version = version,
            "Updated cluster version"
        );
    }
}
