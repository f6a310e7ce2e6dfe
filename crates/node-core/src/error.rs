//! Error types for the elastic training master

use thiserror::Error;

/// Result type alias using the master Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the elastic training master
#[derive(Error, Debug)]
pub enum Error {
    // Node errors
    #[error("Node not found: {node_type}-{node_id}")]
    NodeNotFound { node_type: String, node_id: i64 },

    // Dataset / task errors
    #[error("Dataset not found: {name}")]
    DatasetNotFound { name: String },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: i64 },

    #[error("Invalid shard checkpoint: {message}")]
    InvalidShardCheckpoint { message: String },

    // Rendezvous errors
    #[error("Unknown rendezvous: {name}")]
    UnknownRendezvous { name: String },

    // Wire errors
    #[error("Invalid payload: {message}")]
    InvalidPayload { message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("gRPC error: {0}")]
    Grpc(String),

    #[error("Master unavailable: {address}")]
    MasterUnavailable { address: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Timeout errors
    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
}

impl Error {
    /// Returns true if a client should retry the request that produced
    /// this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Grpc(_) | Error::MasterUnavailable { .. } | Error::Timeout { .. }
        )
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvalidConfig { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
