//! In-memory key-value coordination store
//!
//! Workers use this to exchange small blobs (store init flags, shared
//! addresses) without a side channel. The store never fails: a missing
//! key reads as empty bytes.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Flat string-to-bytes map cleared at master startup
#[derive(Debug, Default)]
pub struct KvStore {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the value under a key
    pub fn set(&self, key: &str, value: Vec<u8>) {
        self.store.lock().insert(key.to_string(), value);
    }

    /// Read a key, empty bytes when absent
    pub fn get(&self, key: &str) -> Vec<u8> {
        self.store.lock().get(key).cloned().unwrap_or_default()
    }

    /// Drop everything, so state from a crashed predecessor cannot
    /// leak into a new job
    pub fn clear(&self) {
        self.store.lock().clear();
    }
}
