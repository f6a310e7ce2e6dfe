//! Task dispatch for dataset shards
//!
//! Each dataset owns a pending queue and a map of outstanding tasks.
//! A shard is always in exactly one of three places: pending, assigned
//! to one node, or completed.

use crate::checkpoint::{DoingShard, ShardCheckpoint};
use crate::splitter::{DatasetSplitter, Shard};
use node_core::{NodeId, NodeType, TaskType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// A dispatched unit of work
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub task_id: i64,
    pub task_type: TaskType,
    pub shard: Shard,
}

impl Task {
    /// Placeholder returned while the queue is empty but the dataset
    /// is not finished
    pub fn wait() -> Self {
        Task {
            task_type: TaskType::Wait,
            ..Default::default()
        }
    }

    /// True for the default task returned when nothing is left
    pub fn is_empty(&self) -> bool {
        self.task_type == TaskType::None && self.shard.end == self.shard.start
    }
}

/// A task that has been handed to a node
#[derive(Debug, Clone)]
struct DoingTask {
    task: Task,
    node_type: NodeType,
    node_id: NodeId,

    /// Unix seconds at dispatch
    start_time: u64,
}

/// Queue counters of one dataset, used by tests and status endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetStats {
    pub pending: usize,
    pub doing: usize,
    pub completed: u64,

    /// Shards produced by the splitter so far
    pub produced: u64,
}

struct DatasetManager {
    splitter: DatasetSplitter,
    task_type: TaskType,
    todo: VecDeque<Task>,
    doing: HashMap<i64, DoingTask>,
    next_task_id: i64,
    completed_shards: u64,
    produced_shards: u64,
}

impl DatasetManager {
    fn new(splitter: DatasetSplitter, task_type: TaskType) -> Self {
        Self {
            splitter,
            task_type,
            todo: VecDeque::new(),
            doing: HashMap::new(),
            next_task_id: 1,
            completed_shards: 0,
            produced_shards: 0,
        }
    }

    fn fill_todo(&mut self) {
        if !self.todo.is_empty() || self.splitter.exhausted() {
            return;
        }
        for shard in self.splitter.create_shards() {
            let task = Task {
                task_id: self.next_task_id,
                task_type: self.task_type,
                shard,
            };
            self.next_task_id += 1;
            self.todo.push_back(task);
            self.produced_shards += 1;
        }
    }

    fn requeue_timed_out(&mut self, now: u64, timeout: Duration) {
        let expired: Vec<i64> = self
            .doing
            .iter()
            .filter(|(_, d)| now.saturating_sub(d.start_time) > timeout.as_secs())
            .map(|(id, _)| *id)
            .collect();
        for task_id in expired {
            if let Some(doing) = self.doing.remove(&task_id) {
                warn!(
                    dataset = %self.splitter.dataset_name,
                    task_id = task_id,
                    node_id = doing.node_id,
                    "Requeueing timed-out task"
                );
                self.todo.push_front(doing.task);
            }
        }
    }

    fn get_task(
        &mut self,
        node_type: NodeType,
        node_id: NodeId,
        now: u64,
        timeout: Duration,
    ) -> Option<Task> {
        self.requeue_timed_out(now, timeout);
        self.fill_todo();
        let task = self.todo.pop_front()?;
        self.doing.insert(
            task.task_id,
            DoingTask {
                task: task.clone(),
                node_type,
                node_id,
                start_time: now,
            },
        );
        Some(task)
    }

    fn report(&mut self, task_id: i64, success: bool) -> Option<Task> {
        let doing = self.doing.remove(&task_id)?;
        if success {
            self.completed_shards += 1;
        } else {
            self.todo.push_front(doing.task.clone());
        }
        Some(doing.task)
    }

    fn completed(&self) -> bool {
        self.splitter.exhausted() && self.todo.is_empty() && self.doing.is_empty()
    }

    fn recover_node_tasks(&mut self, node_type: NodeType, node_id: NodeId) -> usize {
        let owned: Vec<i64> = self
            .doing
            .iter()
            .filter(|(_, d)| d.node_type == node_type && d.node_id == node_id)
            .map(|(id, _)| *id)
            .collect();
        for task_id in &owned {
            if let Some(doing) = self.doing.remove(task_id) {
                self.todo.push_front(doing.task);
            }
        }
        owned.len()
    }

    fn checkpoint(&self) -> ShardCheckpoint {
        let mut doing: Vec<DoingShard> = self
            .doing
            .values()
            .map(|d| DoingShard {
                task_id: d.task.task_id,
                shard: d.task.shard.clone(),
                start_time: d.start_time,
            })
            .collect();
        doing.sort_by_key(|d| d.task_id);
        ShardCheckpoint {
            dataset_name: self.splitter.dataset_name.clone(),
            todo: self.todo.iter().map(|t| t.shard.clone()).collect(),
            doing,
            epoch: self.splitter.epoch,
            completed_shards: self.completed_shards,
            next_task_id: self.next_task_id,
        }
    }

    fn restore(&mut self, checkpoint: ShardCheckpoint) {
        self.todo.clear();
        self.doing.clear();
        self.next_task_id = checkpoint.next_task_id;
        self.splitter.epoch = checkpoint.epoch;
        self.completed_shards = checkpoint.completed_shards;

        // Outstanding tasks from the checkpoint go back to pending
        for doing in checkpoint.doing {
            self.todo.push_back(Task {
                task_id: doing.task_id,
                task_type: self.task_type,
                shard: doing.shard,
            });
        }
        for shard in checkpoint.todo {
            let task = Task {
                task_id: self.next_task_id,
                task_type: self.task_type,
                shard,
            };
            self.next_task_id += 1;
            self.todo.push_back(task);
        }
        self.produced_shards = self.completed_shards + self.todo.len() as u64;
    }

    fn stats(&self) -> DatasetStats {
        DatasetStats {
            pending: self.todo.len(),
            doing: self.doing.len(),
            completed: self.completed_shards,
            produced: self.produced_shards,
        }
    }
}

/// Per-dataset shard queues with atomic dispatch
pub struct TaskManager {
    datasets: Mutex<HashMap<String, DatasetManager>>,

    /// Last task-start time per node, for straggler diagnosis
    worker_start_times: Mutex<HashMap<NodeId, u64>>,

    task_timeout: Duration,
    training_started: AtomicBool,
}

impl TaskManager {
    pub fn new(task_timeout: Duration) -> Self {
        Self {
            datasets: Mutex::new(HashMap::new()),
            worker_start_times: Mutex::new(HashMap::new()),
            task_timeout,
            training_started: AtomicBool::new(false),
        }
    }

    /// Register a dataset, overwriting any prior dataset of the same
    /// name
    pub fn new_dataset(&self, splitter: DatasetSplitter, task_type: TaskType) {
        let name = splitter.dataset_name.clone();
        info!(
            dataset = %name,
            size = splitter.dataset_size,
            shard_size = splitter.shard_size,
            epochs = splitter.num_epochs,
            "Registered dataset"
        );
        self.datasets
            .lock()
            .insert(name, DatasetManager::new(splitter, task_type));
    }

    pub fn has_dataset(&self, name: &str) -> bool {
        self.datasets.lock().contains_key(name)
    }

    /// True when every shard of the dataset has been completed
    pub fn dataset_completed(&self, name: &str) -> bool {
        self.datasets
            .lock()
            .get(name)
            .map(|d| d.completed())
            .unwrap_or(false)
    }

    /// Pop the next pending task and stamp it with the requesting node.
    /// Returns None when the dataset is unknown or nothing is pending.
    pub fn get_dataset_task(
        &self,
        node_type: NodeType,
        node_id: NodeId,
        dataset_name: &str,
    ) -> Option<Task> {
        let now = unix_now();
        let task = self
            .datasets
            .lock()
            .get_mut(dataset_name)?
            .get_task(node_type, node_id, now, self.task_timeout)?;
        if task.task_type == TaskType::Training {
            self.training_started.store(true, Ordering::SeqCst);
        }
        Some(task)
    }

    /// Complete or requeue a dispatched task. Unknown task ids are
    /// ignored; repeating a report has no further effect.
    pub fn report_dataset_task(
        &self,
        dataset_name: &str,
        task_id: i64,
        success: bool,
    ) -> Option<Task> {
        self.datasets
            .lock()
            .get_mut(dataset_name)?
            .report(task_id, success)
    }

    /// Record that a node just started a task
    pub fn reset_worker_start_task_time(&self, node_id: NodeId) {
        self.worker_start_times.lock().insert(node_id, unix_now());
    }

    /// Unix seconds the node last started a task, 0 if never
    pub fn worker_start_task_time(&self, node_id: NodeId) -> u64 {
        self.worker_start_times
            .lock()
            .get(&node_id)
            .copied()
            .unwrap_or(0)
    }

    /// Requeue all tasks outstanding on a failed node
    pub fn recover_node_tasks(&self, node_type: NodeType, node_id: NodeId) {
        let mut datasets = self.datasets.lock();
        for (name, dataset) in datasets.iter_mut() {
            let recovered = dataset.recover_node_tasks(node_type, node_id);
            if recovered > 0 {
                info!(
                    dataset = %name,
                    node_id = node_id,
                    tasks = recovered,
                    "Recovered tasks from failed node"
                );
            }
        }
    }

    /// Serialise the dispatch state of one dataset
    pub fn checkpoint_dataset(&self, name: &str) -> Option<ShardCheckpoint> {
        self.datasets.lock().get(name).map(|d| d.checkpoint())
    }

    /// Rebuild a dataset queue from a checkpoint payload. The dataset
    /// must have been registered first.
    pub fn restore_dataset_from_checkpoint(&self, content: &str) -> bool {
        let checkpoint = match ShardCheckpoint::from_json(content) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Rejected shard checkpoint");
                return false;
            }
        };
        let mut datasets = self.datasets.lock();
        match datasets.get_mut(&checkpoint.dataset_name) {
            Some(dataset) => {
                info!(
                    dataset = %checkpoint.dataset_name,
                    pending = checkpoint.todo.len() + checkpoint.doing.len(),
                    "Restored dataset from checkpoint"
                );
                dataset.restore(checkpoint);
                true
            }
            None => {
                warn!(
                    dataset = %checkpoint.dataset_name,
                    "Checkpoint for unknown dataset"
                );
                false
            }
        }
    }

    /// True once a training task has been dispatched
    pub fn training_started(&self) -> bool {
        self.training_started.load(Ordering::SeqCst)
    }

    pub fn dataset_stats(&self, name: &str) -> Option<DatasetStats> {
        self.datasets.lock().get(name).map(|d| d.stats())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
