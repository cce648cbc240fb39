//! Lazily opened broker connection with a single default channel.

use serde::Serialize;
use tracing::info;

use crate::channel::{Channel, Connector, MessageProperties};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::publisher::Publisher;
use crate::queue::{QueueArguments, QueueDeclaration, QueueRegistry};

/// Owns the default channel of one worker process.
///
/// The channel is opened on first use and reused afterwards; publish, consume
/// and declarations all go through it. Access is `&mut`, so there is no lock:
/// a worker is single-threaded.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    config: BrokerConfig,
    registry: QueueRegistry,
    channel: Option<C::Channel>,
    publisher: Option<Publisher>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, config: BrokerConfig) -> Self {
        Self {
            connector,
            config,
            registry: QueueRegistry::new(),
            channel: None,
            publisher: None,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// The default channel, opened if this is the first call.
    pub fn connect(&mut self) -> Result<&mut C::Channel, BrokerError> {
        let channel = match self.channel.take() {
            Some(channel) => channel,
            None => {
                let channel = self.connector.connect(&self.config)?;
                info!(broker = %self.config.redacted_url(), "broker connection opened");
                channel
            }
        };
        Ok(self.channel.insert(channel))
    }

    /// The per-connection publisher, built once.
    pub fn publisher(&mut self) -> Publisher {
        *self
            .publisher
            .get_or_insert_with(|| Publisher::new(self.config.wire_format))
    }

    /// Default channel and publisher together, for callers that publish and
    /// settle deliveries in the same step.
    pub fn parts(&mut self) -> Result<(&mut C::Channel, Publisher), BrokerError> {
        let publisher = self.publisher();
        let channel = self.connect()?;
        Ok((channel, publisher))
    }

    pub fn declare_queue(
        &mut self,
        name: &str,
        durable: bool,
        auto_delete: bool,
        arguments: QueueArguments,
    ) -> Result<QueueDeclaration, BrokerError> {
        let registry = self.registry;
        let channel = self.connect()?;
        registry.declare(channel, name, durable, auto_delete, arguments)
    }

    pub fn delete_queue(&mut self, name: &str) -> Result<(), BrokerError> {
        let registry = self.registry;
        let channel = self.connect()?;
        registry.delete(channel, name)
    }

    pub fn publish<T: Serialize>(
        &mut self,
        payload: &T,
        routing_key: &str,
        reply_to: Option<&str>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        let (channel, publisher) = self.parts()?;
        publisher.publish(channel, payload, routing_key, reply_to, properties)
    }

    /// Drop the default channel; the backend returns whatever it still held.
    pub fn close(&mut self) {
        if self.channel.take().is_some() {
            info!(broker = %self.config.redacted_url(), "broker connection closed");
        }
        self.publisher = None;
    }
}

impl<C> core::fmt::Debug for ConnectionManager<C>
where
    C: Connector,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("broker", &self.config.redacted_url())
            .field("connected", &self.channel.is_some())
            .finish()
    }
}
