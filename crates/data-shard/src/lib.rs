//! Data Shard - Dataset splitting and task dispatch
//!
//! Turns reported dataset parameters into per-epoch shard queues and
//! serves them to workers as tasks, requeueing on failure or timeout.

pub mod checkpoint;
pub mod splitter;
pub mod task_manager;

pub use checkpoint::ShardCheckpoint;
pub use splitter::{new_dataset_splitter, DatasetSplitter, Shard, StorageType};
pub use task_manager::{DatasetStats, Task, TaskManager};
