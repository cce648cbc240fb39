//! Queue declarations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::error::BrokerError;

/// Declaration argument naming the replication policy of a queue.
pub const REPLICATION_POLICY_ARG: &str = "replication_policy";

/// Replicate the queue to every broker node.
pub const MIRROR_ALL: &str = "mirror-all";

/// Declaration argument naming the queue rejected deliveries are routed to.
pub const DEAD_LETTER_ARG: &str = "x-dead-letter-routing-key";

pub type QueueArguments = BTreeMap<String, Value>;

/// Parameters a queue is declared with.
///
/// Two declarations of the same name are compatible only if every field is equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: QueueArguments,
}

impl QueueDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            arguments: QueueArguments::new(),
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    pub fn dead_letter_queue(&self) -> Option<&str> {
        self.arguments.get(DEAD_LETTER_ARG).and_then(Value::as_str)
    }

    pub fn replication_policy(&self) -> Option<&str> {
        self.arguments.get(REPLICATION_POLICY_ARG).and_then(Value::as_str)
    }

    /// `Ok(())` if redeclaring `self` over `existing` is a no-op.
    pub fn check_compatible(&self, existing: &QueueDeclaration) -> Result<(), BrokerError> {
        let reason = if self.durable != existing.durable {
            Some(format!("durable: existing {}, requested {}", existing.durable, self.durable))
        } else if self.auto_delete != existing.auto_delete {
            Some(format!(
                "auto_delete: existing {}, requested {}",
                existing.auto_delete, self.auto_delete
            ))
        } else if self.arguments != existing.arguments {
            Some(format!(
                "arguments: existing {:?}, requested {:?}",
                existing.arguments, self.arguments
            ))
        } else {
            None
        };

        match reason {
            None => Ok(()),
            Some(reason) => Err(BrokerError::PreconditionFailed {
                queue: self.name.clone(),
                reason,
            }),
        }
    }
}

/// Declares and deletes queues on a channel.
///
/// Every declaration carries `replication_policy = "mirror-all"`, whatever the
/// caller passed for that argument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueRegistry;

impl QueueRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Build the declaration that would be sent, with the replication policy injected.
    pub fn declaration(
        &self,
        name: &str,
        durable: bool,
        auto_delete: bool,
        mut arguments: QueueArguments,
    ) -> QueueDeclaration {
        arguments.insert(
            REPLICATION_POLICY_ARG.to_string(),
            Value::String(MIRROR_ALL.to_string()),
        );
        QueueDeclaration {
            name: name.to_string(),
            durable,
            auto_delete,
            arguments,
        }
    }

    pub fn declare<C>(
        &self,
        channel: &mut C,
        name: &str,
        durable: bool,
        auto_delete: bool,
        arguments: QueueArguments,
    ) -> Result<QueueDeclaration, BrokerError>
    where
        C: Channel + ?Sized,
    {
        let declaration = self.declaration(name, durable, auto_delete, arguments);
        channel.queue_declare(&declaration)?;
        info!(queue = %name, durable, auto_delete, "queue declared");
        Ok(declaration)
    }

    pub fn delete<C>(&self, channel: &mut C, name: &str) -> Result<(), BrokerError>
    where
        C: Channel + ?Sized,
    {
        channel.queue_delete(name)?;
        debug!(queue = %name, "queue deleted");
        Ok(())
    }
}
