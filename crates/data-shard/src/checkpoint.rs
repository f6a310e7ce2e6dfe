//! Shard checkpoints
//!
//! A checkpoint captures the dispatch state of one dataset as a JSON
//! string that workers fetch and replay back after a master restart.

use crate::splitter::Shard;
use serde::{Deserialize, Serialize};

/// An outstanding task at checkpoint time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DoingShard {
    pub task_id: i64,
    pub shard: Shard,

    /// Unix seconds the task was dispatched
    pub start_time: u64,
}

/// Serialised dispatch state of one dataset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardCheckpoint {
    pub dataset_name: String,

    /// Pending shards, in queue order
    pub todo: Vec<Shard>,

    /// Dispatched but unreported tasks; requeued on restore
    pub doing: Vec<DoingShard>,

    /// Epochs the splitter has produced
    pub epoch: u64,

    /// Shards completed so far
    pub completed_shards: u64,

    pub next_task_id: i64,
}

impl ShardCheckpoint {
    pub fn to_json(&self) -> node_core::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(content: &str) -> node_core::Result<Self> {
        serde_json::from_str(content).map_err(|e| node_core::Error::InvalidShardCheckpoint {
            message: e.to_string(),
        })
    }
}
