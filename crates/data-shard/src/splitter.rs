//! Dataset splitters
//!
//! A splitter yields one epoch of shards at a time. Table datasets are
//! split into contiguous ranges; text datasets additionally carry the
//! shuffled record indices of each range so workers can read
//! out-of-order without a seekable index.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A contiguous slice of a dataset, the unit of dispatched work
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shard {
    /// Name of the dataset the shard belongs to
    pub name: String,

    /// Start record index (inclusive)
    pub start: u64,

    /// End record index (exclusive)
    pub end: u64,

    /// Shuffled record indices for text storage, absent for tables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_indices: Option<Vec<u64>>,
}

/// How the dataset is stored, which decides the splitting strategy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Table,
    Text,
}

impl FromStr for StorageType {
    type Err = node_core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "table" => Ok(StorageType::Table),
            "text" => Ok(StorageType::Text),
            other => Err(node_core::Error::InvalidConfig {
                message: format!("unknown storage type: {}", other),
            }),
        }
    }
}

/// Splits a dataset into shards, one epoch per call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSplitter {
    pub dataset_name: String,
    pub dataset_size: u64,
    pub shard_size: u64,
    pub num_epochs: u64,
    pub shuffle: bool,
    pub storage_type: StorageType,

    /// Epochs produced so far
    pub epoch: u64,

    /// Base seed for deterministic shuffling
    pub seed: u64,
}

/// Build a splitter for the reported dataset parameters
pub fn new_dataset_splitter(
    shuffle: bool,
    shard_size: u64,
    dataset_size: u64,
    num_epochs: u64,
    dataset_name: &str,
    storage_type: StorageType,
) -> DatasetSplitter {
    DatasetSplitter {
        dataset_name: dataset_name.to_string(),
        dataset_size,
        shard_size: shard_size.max(1),
        num_epochs: num_epochs.max(1),
        shuffle,
        storage_type,
        epoch: 0,
        seed: 0,
    }
}

impl DatasetSplitter {
    /// Number of shards a single epoch yields
    pub fn shards_per_epoch(&self) -> u64 {
        self.dataset_size.div_ceil(self.shard_size)
    }

    /// True once every epoch has been produced
    pub fn exhausted(&self) -> bool {
        self.epoch >= self.num_epochs
    }

    /// Produce the next epoch of shards; empty when exhausted
    pub fn create_shards(&mut self) -> Vec<Shard> {
        if self.exhausted() {
            return Vec::new();
        }

        let epoch = self.epoch;
        self.epoch += 1;

        let mut shards: Vec<Shard> = (0..self.shards_per_epoch())
            .map(|i| {
                let start = i * self.shard_size;
                let end = (start + self.shard_size).min(self.dataset_size);
                Shard {
                    name: self.dataset_name.clone(),
                    start,
                    end,
                    record_indices: None,
                }
            })
            .collect();

        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.epoch_seed(epoch));
            match self.storage_type {
                // Tables only shuffle the shard order
                StorageType::Table => shards.shuffle(&mut rng),
                // Text shards carry their own shuffled record order
                StorageType::Text => {
                    let mut indices: Vec<u64> = (0..self.dataset_size).collect();
                    indices.shuffle(&mut rng);
                    for shard in &mut shards {
                        let slice =
                            indices[shard.start as usize..shard.end as usize].to_vec();
                        shard.record_indices = Some(slice);
                    }
                    shards.shuffle(&mut rng);
                }
            }
        }

        tracing::debug!(
            dataset = %self.dataset_name,
            epoch = epoch,
            shards = shards.len(),
            "Created epoch shards"
        );
        shards
    }

    fn epoch_seed(&self, epoch: u64) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        self.dataset_name.hash(&mut hasher);
        epoch.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_split_covers_dataset() {
        let mut splitter =
            new_dataset_splitter(false, 100, 1050, 1, "iris", StorageType::Table);
        let shards = splitter.create_shards();

        assert_eq!(shards.len(), 11);
        assert_eq!(shards[0].start, 0);
        assert_eq!(shards[0].end, 100);
        assert_eq!(shards[10].start, 1000);
        assert_eq!(shards[10].end, 1050);
        assert!(shards.iter().all(|s| s.record_indices.is_none()));
    }

    #[test]
    fn test_epochs_are_bounded() {
        let mut splitter =
            new_dataset_splitter(false, 5, 10, 2, "iris", StorageType::Table);
        assert_eq!(splitter.create_shards().len(), 2);
        assert_eq!(splitter.create_shards().len(), 2);
        assert!(splitter.exhausted());
        assert!(splitter.create_shards().is_empty());
    }

    #[test]
    fn test_text_split_carries_indices() {
        let mut splitter =
            new_dataset_splitter(true, 4, 12, 1, "corpus", StorageType::Text);
        let shards = splitter.create_shards();

        assert_eq!(shards.len(), 3);
        let mut all: Vec<u64> = shards
            .iter()
            .flat_map(|s| s.record_indices.clone().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..12).collect::<Vec<u64>>());
    }

    #[test]
    fn test_shuffle_is_deterministic() {
        let mut a = new_dataset_splitter(true, 10, 100, 1, "iris", StorageType::Table);
        let mut b = new_dataset_splitter(true, 10, 100, 1, "iris", StorageType::Table);
        assert_eq!(a.create_shards(), b.create_shards());
    }

    #[test]
    fn test_storage_type_parsing() {
        assert_eq!("".parse::<StorageType>().unwrap(), StorageType::Table);
        assert_eq!("text".parse::<StorageType>().unwrap(), StorageType::Text);
        assert!("hdf5".parse::<StorageType>().is_err());
    }
}
