//! Outcome records: the cached result and the reply message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::id::SubjectId;

/// Outcome status shared by result records and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
}

/// Last known outcome of a subject's task, as kept in the result cache.
///
/// Each run overwrites the previous record; there is no history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub status: ResultStatus,
    pub payload: Value,
}

impl ResultRecord {
    pub fn success(payload: Value) -> Self {
        Self {
            status: ResultStatus::Success,
            payload,
        }
    }

    pub fn error(payload: Value) -> Self {
        Self {
            status: ResultStatus::Error,
            payload,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// Message published to the requester's `reply_to` destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ResultStatus,
    pub result: Value,
}

impl Reply {
    pub fn success(result: Value) -> Self {
        Self {
            status: ResultStatus::Success,
            result,
        }
    }

    pub fn error(result: Value) -> Self {
        Self {
            status: ResultStatus::Error,
            result,
        }
    }
}

impl From<&ResultRecord> for Reply {
    fn from(record: &ResultRecord) -> Self {
        Self {
            status: record.status,
            result: record.payload.clone(),
        }
    }
}

/// Cache key of a result record: `"<prefix>:<subject_id>:result"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultKey(String);

impl ResultKey {
    pub fn new(prefix: &str, subject_id: &SubjectId) -> Self {
        Self(format!("{prefix}:{subject_id}:result"))
    }

    /// Like [`ResultKey::new`], rejecting prefixes that would produce ambiguous keys.
    pub fn try_new(prefix: &str, subject_id: &SubjectId) -> Result<Self, DomainError> {
        if prefix.is_empty() || prefix.contains(':') {
            return Err(DomainError::validation(format!(
                "result key prefix must be non-empty and free of ':' (got {prefix:?})"
            )));
        }
        Ok(Self::new(prefix, subject_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ResultKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResultKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
