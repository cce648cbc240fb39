use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use drawq_core::{ResultKey, ResultRecord};

use super::{ResultStore, ResultStoreError};

/// In-memory result store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    records: RwLock<HashMap<ResultKey, ResultRecord>>,
    writes: AtomicU64,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of `set` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> ResultStoreError {
    ResultStoreError::Storage("lock poisoned".to_string())
}

impl ResultStore for InMemoryResultStore {
    fn get(&self, key: &ResultKey) -> Result<Option<ResultRecord>, ResultStoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(key).cloned())
    }

    fn set(&self, key: &ResultKey, record: &ResultRecord) -> Result<(), ResultStoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        records.insert(key.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, key: &ResultKey) -> Result<(), ResultStoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        records.remove(key);
        Ok(())
    }
}
