//! Broker and wire-format errors.

use thiserror::Error;

/// Failure talking to the broker.
///
/// Every variant is an infrastructure failure from the worker's point of view:
/// callers log it and stop, leaving recovery to the process supervisor.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Redeclaring a queue with different parameters.
    #[error("precondition failed for queue {queue}: {reason}")]
    PreconditionFailed { queue: String, reason: String },

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// Another live process consumes under the same name.
    #[error("consumer name {0} is held by a live process")]
    ConsumerNameInUse(String),

    #[error("unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Frame or protocol data the backend does not understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("broker state poisoned")]
    Poisoned,
}

impl BrokerError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::BrokerUnavailable(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Failure encoding or decoding a payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed ({format}): {message}")]
    Encode {
        format: &'static str,
        message: String,
    },

    #[error("decode failed ({format}): {message}")]
    Decode {
        format: &'static str,
        message: String,
    },

    #[error("content type {found:?} does not match pinned wire format {expected}")]
    ContentType {
        expected: &'static str,
        found: String,
    },

    #[error("unknown wire format: {0}")]
    UnknownFormat(String),
}
