//! Encoding and sending of outbound messages.

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::channel::{Channel, MessageProperties};
use crate::codec::WireFormat;
use crate::error::BrokerError;

/// Sends payloads through the default exchange (routing key = queue name).
///
/// Stateless apart from the pinned wire format, so one instance is built per
/// connection and reused. No publisher confirms are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Publisher {
    format: WireFormat,
}

impl Publisher {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode `payload` and publish it to `routing_key`.
    ///
    /// `content_type` is always overwritten with the pinned format's;
    /// `message_id` and `timestamp` are stamped when the caller left them empty.
    pub fn publish<C, T>(
        &self,
        channel: &mut C,
        payload: &T,
        routing_key: &str,
        reply_to: Option<&str>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>
    where
        C: Channel + ?Sized,
        T: Serialize,
    {
        let body = self.format.encode(payload)?;
        let mut properties = self.stamp(properties);
        if let Some(reply_to) = reply_to {
            properties.reply_to = Some(reply_to.to_string());
        }
        self.send(channel, routing_key, body, properties)
    }

    /// Publish bytes that are already encoded, leaving properties untouched.
    pub fn publish_raw<C>(
        &self,
        channel: &mut C,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>
    where
        C: Channel + ?Sized,
    {
        self.send(channel, routing_key, body, properties)
    }

    fn stamp(&self, mut properties: MessageProperties) -> MessageProperties {
        properties.content_type = Some(self.format.content_type().to_string());
        if properties.message_id.is_none() {
            properties.message_id = Some(Uuid::now_v7().to_string());
        }
        if properties.timestamp.is_none() {
            properties.timestamp = Some(chrono::Utc::now().timestamp_millis());
        }
        properties
    }

    fn send<C>(
        &self,
        channel: &mut C,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>
    where
        C: Channel + ?Sized,
    {
        let bytes = body.len();
        channel.basic_publish(routing_key, body, properties)?;
        debug!(routing_key = %routing_key, bytes, "message published");
        Ok(())
    }
}
