//! The backend seam: channels, deliveries and message properties.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::queue::QueueDeclaration;

/// Broker-assigned handle of one delivery on one channel.
///
/// Opaque to the application: it is only ever handed back to the channel
/// that produced it, to ack, requeue or reject the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Routing and correlation metadata travelling next to a body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Value>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }
}

/// One message handed to one consumer.
///
/// Nothing happens to the delivery until the caller acks, requeues or
/// rejects it through the channel it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    /// Number of earlier deliveries of this message that were not acked.
    pub delivery_count: u32,
}

impl Delivery {
    /// 1-based attempt number of this delivery.
    pub fn attempt(&self) -> u32 {
        self.delivery_count.saturating_add(1)
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    pub fn ack<C: Channel + ?Sized>(&self, channel: &mut C) -> Result<(), BrokerError> {
        channel.basic_ack(self.tag)
    }

    pub fn requeue<C: Channel + ?Sized>(&self, channel: &mut C) -> Result<(), BrokerError> {
        channel.basic_nack(self.tag, true)
    }

    /// Reject without requeue; the backend routes it to the queue's dead-letter target, if any.
    pub fn reject<C: Channel + ?Sized>(&self, channel: &mut C) -> Result<(), BrokerError> {
        channel.basic_nack(self.tag, false)
    }
}

/// End of a `basic_get` wait. Timeouts too large to represent wait a year.
pub fn wait_deadline(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 3600))
}

/// Default communication channel of a broker connection.
///
/// ## Contract
///
/// - `queue_declare` is idempotent for identical declarations and fails with
///   [`BrokerError::PreconditionFailed`] for conflicting ones
/// - `basic_publish` goes through the default exchange: the routing key is the
///   queue name; messages for undeclared queues are dropped
/// - `basic_get` waits at most `timeout` and returns `Ok(None)` when nothing arrived
/// - deliveries stay owned by the channel until acked or nacked; a channel that
///   is dropped returns what it still holds to the queues
pub trait Channel {
    fn queue_declare(&mut self, declaration: &QueueDeclaration) -> Result<(), BrokerError>;

    fn queue_delete(&mut self, name: &str) -> Result<(), BrokerError>;

    fn basic_publish(
        &mut self,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>;

    fn basic_get(
        &mut self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError>;

    fn basic_ack(&mut self, tag: DeliveryTag) -> Result<(), BrokerError>;

    fn basic_nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;
}

impl<C> Channel for Box<C>
where
    C: Channel + ?Sized,
{
    fn queue_declare(&mut self, declaration: &QueueDeclaration) -> Result<(), BrokerError> {
        (**self).queue_declare(declaration)
    }

    fn queue_delete(&mut self, name: &str) -> Result<(), BrokerError> {
        (**self).queue_delete(name)
    }

    fn basic_publish(
        &mut self,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        (**self).basic_publish(routing_key, body, properties)
    }

    fn basic_get(
        &mut self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        (**self).basic_get(queues, timeout)
    }

    fn basic_ack(&mut self, tag: DeliveryTag) -> Result<(), BrokerError> {
        (**self).basic_ack(tag)
    }

    fn basic_nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        (**self).basic_nack(tag, requeue)
    }
}

/// Opens channels to a broker backend.
pub trait Connector {
    type Channel: Channel;

    /// Fails with [`BrokerError::BrokerUnavailable`] when the broker cannot be reached.
    fn connect(&self, config: &BrokerConfig) -> Result<Self::Channel, BrokerError>;
}
