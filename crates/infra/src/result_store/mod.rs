//! Result cache: last known outcome per subject.

use std::sync::Arc;

use drawq_core::{ResultKey, ResultRecord};

mod in_memory;
#[cfg(feature = "redis")]
mod redis;

pub use in_memory::InMemoryResultStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisResultStore;

/// Key/value store for [`ResultRecord`]s.
///
/// No locking: a key is only written by the worker that processed the
/// subject's latest task, and readers get last-write-wins.
pub trait ResultStore: Send + Sync {
    fn get(&self, key: &ResultKey) -> Result<Option<ResultRecord>, ResultStoreError>;

    /// Overwrite whatever is stored under `key`.
    fn set(&self, key: &ResultKey, record: &ResultRecord) -> Result<(), ResultStoreError>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &ResultKey) -> Result<(), ResultStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResultStoreError {
    #[error("result store connection error: {0}")]
    Connection(String),
    #[error("result store error: {0}")]
    Storage(String),
    #[error("result serialization error: {0}")]
    Serialization(String),
}

impl<S> ResultStore for Arc<S>
where
    S: ResultStore + ?Sized,
{
    fn get(&self, key: &ResultKey) -> Result<Option<ResultRecord>, ResultStoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &ResultKey, record: &ResultRecord) -> Result<(), ResultStoreError> {
        (**self).set(key, record)
    }

    fn delete(&self, key: &ResultKey) -> Result<(), ResultStoreError> {
        (**self).delete(key)
    }
}
