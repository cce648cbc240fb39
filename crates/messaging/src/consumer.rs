//! Bounded-timeout consumption.

use std::time::Duration;

use tracing::trace;

use crate::channel::{Channel, Delivery};
use crate::error::BrokerError;

/// Default consume wait; only there so a stop flag gets looked at regularly.
pub const DEFAULT_CONSUME_TIMEOUT: Duration = Duration::from_secs(3);

/// Result of one wait on the consumed queues.
#[derive(Debug, Clone, PartialEq)]
pub enum Consumed<T = Delivery> {
    Delivery(T),
    /// Nothing arrived before the timeout.
    Timeout,
}

impl<T> Consumed<T> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Consumed::Timeout)
    }

    pub fn into_delivery(self) -> Option<T> {
        match self {
            Consumed::Delivery(d) => Some(d),
            Consumed::Timeout => None,
        }
    }
}

/// Waits for deliveries on one or more queues.
///
/// Acknowledgement is never implicit: the callback (or the caller of
/// [`ConsumerLoop::next`]) settles every delivery through its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerLoop {
    queues: Vec<String>,
    timeout: Duration,
}

impl ConsumerLoop {
    pub fn new<I, S>(queues: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            timeout,
        }
    }

    pub fn single(queue: impl Into<String>, timeout: Duration) -> Self {
        Self::new([queue.into()], timeout)
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block until a delivery arrives on any queue or the timeout elapses.
    pub fn next<C>(&self, channel: &mut C) -> Result<Consumed, BrokerError>
    where
        C: Channel + ?Sized,
    {
        match channel.basic_get(&self.queues, self.timeout)? {
            Some(delivery) => {
                trace!(queue = %delivery.queue, delivery_tag = %delivery.tag, "delivery received");
                Ok(Consumed::Delivery(delivery))
            }
            None => Ok(Consumed::Timeout),
        }
    }

    /// One wait; `on_message` gets the channel back so it can settle the delivery.
    pub fn run_once<C, F, T, E>(&self, channel: &mut C, on_message: F) -> Result<Consumed<T>, E>
    where
        C: Channel + ?Sized,
        F: FnOnce(&mut C, Delivery) -> Result<T, E>,
        E: From<BrokerError>,
    {
        match self.next(channel)? {
            Consumed::Delivery(delivery) => on_message(channel, delivery).map(Consumed::Delivery),
            Consumed::Timeout => Ok(Consumed::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageProperties;
    use crate::in_memory::InMemoryBroker;
    use crate::queue::QueueDeclaration;

    fn setup(queues: &[&str]) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        let mut channel = broker.channel();
        for q in queues {
            channel.queue_declare(&QueueDeclaration::new(*q)).unwrap();
        }
        broker
    }

    #[test]
    fn timeout_is_a_value_not_an_error() {
        let broker = setup(&["q"]);
        let mut channel = broker.channel();

        let consumed = ConsumerLoop::single("q", Duration::from_millis(5))
            .next(&mut channel)
            .unwrap();

        assert!(consumed.is_timeout());
    }

    #[test]
    fn callback_settles_the_delivery() {
        let broker = setup(&["q"]);
        let mut channel = broker.channel();
        channel
            .basic_publish("q", b"hi".to_vec(), MessageProperties::new())
            .unwrap();

        let consumed = ConsumerLoop::single("q", Duration::ZERO)
            .run_once(&mut channel, |ch, delivery| -> Result<Vec<u8>, BrokerError> {
                delivery.ack(ch)?;
                Ok(delivery.body)
            })
            .unwrap();

        assert_eq!(consumed.into_delivery(), Some(b"hi".to_vec()));
        assert_eq!(broker.stats().acked, 1);
    }

    #[test]
    fn not_settling_leaves_the_delivery_with_the_channel() {
        let broker = setup(&["q"]);
        let mut channel = broker.channel();
        channel
            .basic_publish("q", b"hi".to_vec(), MessageProperties::new())
            .unwrap();

        ConsumerLoop::single("q", Duration::ZERO)
            .run_once(&mut channel, |_, _| Ok::<_, BrokerError>(()))
            .unwrap();

        assert_eq!(channel.unacked_count(), 1);
        assert_eq!(broker.ready_count("q"), 0);
    }

    #[test]
    fn consumes_from_any_listed_queue() {
        let broker = setup(&["a", "b"]);
        let mut channel = broker.channel();
        channel
            .basic_publish("b", b"from-b".to_vec(), MessageProperties::new())
            .unwrap();

        let consumer = ConsumerLoop::new(["a", "b"], Duration::ZERO);
        let delivery = consumer.next(&mut channel).unwrap().into_delivery().unwrap();

        assert_eq!(delivery.queue, "b");
    }
}
