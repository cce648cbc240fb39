//! Identifier of the subject (player/account) a task operates on.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of the subject a task is about.
///
/// Producers send either a numeric primary key or a string key; both are
/// accepted on the wire and rendered the same way in result keys and logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubjectId {
    Int(i64),
    Str(String),
}

impl SubjectId {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SubjectId::Int(v) => Some(*v),
            SubjectId::Str(s) => s.parse().ok(),
        }
    }
}

impl core::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SubjectId::Int(v) => core::fmt::Display::fmt(v, f),
            SubjectId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for SubjectId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for SubjectId {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for SubjectId {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl FromStr for SubjectId {
    type Err = DomainError;

    /// Digits parse as `Int`, anything else non-empty as `Str`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(DomainError::invalid_id("SubjectId: empty"));
        }
        if s.contains(':') {
            // Would make "<prefix>:<subject>:result" keys ambiguous.
            return Err(DomainError::invalid_id(format!("SubjectId: ':' in {s:?}")));
        }
        Ok(match s.parse::<i64>() {
            Ok(v) => Self::Int(v),
            Err(_) => Self::Str(s.to_string()),
        })
    }
}
