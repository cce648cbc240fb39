//! Redis-backed result store (JSON values, optional TTL).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use drawq_core::{ResultKey, ResultRecord};

use super::{ResultStore, ResultStoreError};

#[derive(Debug, Clone)]
pub struct RedisResultStore {
    client: Arc<redis::Client>,
    ttl: Option<Duration>,
}

impl RedisResultStore {
    /// # Arguments
    ///
    /// * `redis_url` - e.g. "redis://localhost:6379/1"
    /// * `ttl` - expiry applied on every write; `None` keeps records forever
    pub fn new(redis_url: impl AsRef<str>, ttl: Option<Duration>) -> Result<Self, ResultStoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| ResultStoreError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            ttl,
        })
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    fn connection(&self) -> Result<redis::Connection, ResultStoreError> {
        self.client
            .get_connection()
            .map_err(|e| ResultStoreError::Connection(e.to_string()))
    }
}

impl ResultStore for RedisResultStore {
    fn get(&self, key: &ResultKey) -> Result<Option<ResultRecord>, ResultStoreError> {
        let mut conn = self.connection()?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(key.as_str())
            .query(&mut conn)
            .map_err(|e| ResultStoreError::Storage(e.to_string()))?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| ResultStoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    #[instrument(skip(self, key, record), fields(key = %key), err)]
    fn set(&self, key: &ResultKey, record: &ResultRecord) -> Result<(), ResultStoreError> {
        let json = serde_json::to_string(record)
            .map_err(|e| ResultStoreError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(key.as_str()).arg(json);
        if let Some(ttl) = self.ttl {
            // SET EX rejects 0
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        let _: () = cmd
            .query(&mut conn)
            .map_err(|e| ResultStoreError::Storage(e.to_string()))?;

        debug!(key = %key, "result stored");
        Ok(())
    }

    fn delete(&self, key: &ResultKey) -> Result<(), ResultStoreError> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("DEL")
            .arg(key.as_str())
            .query(&mut conn)
            .map_err(|e| ResultStoreError::Storage(e.to_string()))?;
        Ok(())
    }
}
