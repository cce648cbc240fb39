//! Broker plumbing for the draw worker (mechanics only).
//!
//! This crate provides the **work queue pattern**: durable named queues,
//! competing consumers, explicit acknowledgement.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a delivery that is not acknowledged (requeued, or held
//!   by a channel that goes away) is delivered again
//! - **One consumer at a time**: each delivery is handed to exactly one channel
//! - **No ordering across consumers**: FIFO per queue is a backend property
//!
//! ## Components
//!
//! - [`Channel`] / [`Connector`]: the backend seam (in-memory here, Redis in `drawq-infra`)
//! - [`ConnectionManager`]: lazily opened, reused default channel
//! - [`QueueRegistry`]: idempotent declarations with the replication policy injected
//! - [`Publisher`]: wire encoding + routing metadata
//! - [`ConsumerLoop`]: bounded-timeout waits for the next delivery

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod in_memory;
pub mod publisher;
pub mod queue;

pub use channel::{Channel, Connector, Delivery, DeliveryTag, MessageProperties, wait_deadline};
pub use codec::WireFormat;
pub use config::BrokerConfig;
pub use connection::ConnectionManager;
pub use consumer::{Consumed, ConsumerLoop, DEFAULT_CONSUME_TIMEOUT};
pub use error::{BrokerError, CodecError};
pub use in_memory::{
    BrokerStats, DEATH_COUNT_HEADER, DEATH_QUEUE_HEADER, InMemoryBroker, InMemoryChannel,
    StoredMessage,
};
pub use publisher::Publisher;
pub use queue::{
    DEAD_LETTER_ARG, MIRROR_ALL, QueueArguments, QueueDeclaration, QueueRegistry,
    REPLICATION_POLICY_ARG,
};
