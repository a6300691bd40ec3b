//! Key-value storage used for persisted snapshots.

use crate::errors::BrdposResult;
use alloc::vec::Vec;
use hashbrown::HashMap;
use parking_lot::RwLock;

/// Minimal key-value store. Keys prefixed `BRDPoS-V2-` belong to the engine.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait KeyValueStore: Send + Sync {
    /// Value stored under `key`, if any
    fn get(&self, key: &[u8]) -> BrdposResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    fn put(&self, key: &[u8], value: Vec<u8>) -> BrdposResult<()>;
}

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the database is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryDatabase {
    fn get(&self, key: &[u8]) -> BrdposResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> BrdposResult<()> {
        self.entries.write().insert(key.to_vec(), value);
        Ok(())
    }
}
