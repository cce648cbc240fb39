//! In-memory broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::debug;

use crate::channel::{Channel, Connector, Delivery, DeliveryTag, MessageProperties, wait_deadline};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::queue::QueueDeclaration;

/// Header set on dead-lettered messages: the queue they were rejected from.
pub const DEATH_QUEUE_HEADER: &str = "x-first-death-queue";

/// Header set on dead-lettered messages: how many times they were delivered.
pub const DEATH_COUNT_HEADER: &str = "x-death-count";

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub delivery_count: u32,
}

/// Counters of everything the broker did, for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    /// Published to a routing key with no queue behind it.
    pub dropped: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    fail_publish: bool,
    fail_ack: bool,
}

#[derive(Debug)]
struct QueueState {
    declaration: QueueDeclaration,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    stats: BrokerStats,
    faults: Faults,
}

impl BrokerState {
    fn requeue(&mut self, queue: &str, mut message: StoredMessage) {
        message.delivery_count = message.delivery_count.saturating_add(1);
        match self.queues.get_mut(queue) {
            // Back to the head, like a broker returning a nacked delivery.
            Some(q) => q.ready.push_front(message),
            None => debug!(queue = %queue, "requeue target gone, message discarded"),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    arrived: Condvar,
}

/// In-process broker.
///
/// - No IO
/// - Competing consumers: each message goes to exactly one channel
/// - Faults can be switched on to exercise infrastructure failure paths
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel without going through [`Connector`].
    pub fn channel(&self) -> InMemoryChannel {
        InMemoryChannel {
            broker: self.clone(),
            next_tag: 0,
            unacked: HashMap::new(),
        }
    }

    pub fn stats(&self) -> BrokerStats {
        self.inspect().stats
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inspect().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn declaration(&self, queue: &str) -> Option<QueueDeclaration> {
        self.inspect()
            .queues
            .get(queue)
            .map(|q| q.declaration.clone())
    }

    /// Messages waiting in `queue` (not counting those held by channels).
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inspect().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.inspect()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Make [`Connector::connect`] fail with `BrokerUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inspect().faults.unavailable = unavailable;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.inspect().faults.fail_publish = fail;
    }

    pub fn fail_acks(&self, fail: bool) {
        self.inspect().faults.fail_ack = fail;
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        self.shared.state.lock().map_err(|_| BrokerError::Poisoned)
    }

    // Inspection must keep working after a test thread panicked while holding the lock.
    fn inspect(&self) -> MutexGuard<'_, BrokerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connector for InMemoryBroker {
    type Channel = InMemoryChannel;

    fn connect(&self, config: &BrokerConfig) -> Result<Self::Channel, BrokerError> {
        if self.lock()?.faults.unavailable {
            return Err(BrokerError::unavailable(format!(
                "{} refused connection",
                config.redacted_url()
            )));
        }
        Ok(self.channel())
    }
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: StoredMessage,
}

/// Channel on an [`InMemoryBroker`].
///
/// Dropping the channel returns every unacknowledged delivery to its queue.
#[derive(Debug)]
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    next_tag: u64,
    unacked: HashMap<DeliveryTag, Unacked>,
}

impl InMemoryChannel {
    /// Deliveries handed out by this channel and not yet settled.
    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    fn track(&mut self, queue: &str, message: StoredMessage) -> Delivery {
        self.next_tag += 1;
        let tag = DeliveryTag::new(self.next_tag);
        let delivery = Delivery {
            tag,
            queue: queue.to_string(),
            body: message.body.clone(),
            properties: message.properties.clone(),
            redelivered: message.delivery_count > 0,
            delivery_count: message.delivery_count,
        };
        self.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                message,
            },
        );
        delivery
    }

    fn settle(&mut self, tag: DeliveryTag) -> Result<Unacked, BrokerError> {
        self.unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag.value()))
    }
}

impl Channel for InMemoryChannel {
    fn queue_declare(&mut self, declaration: &QueueDeclaration) -> Result<(), BrokerError> {
        let mut state = self.broker.lock()?;
        match state.queues.get(&declaration.name) {
            Some(existing) => declaration.check_compatible(&existing.declaration),
            None => {
                state.queues.insert(
                    declaration.name.clone(),
                    QueueState {
                        declaration: declaration.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn queue_delete(&mut self, name: &str) -> Result<(), BrokerError> {
        self.broker.lock()?.queues.remove(name);
        Ok(())
    }

    fn basic_publish(
        &mut self,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.lock()?;
        if state.faults.fail_publish {
            return Err(BrokerError::transport("publish refused (injected fault)"));
        }
        state.stats.published += 1;

        match state.queues.get_mut(routing_key) {
            Some(queue) => {
                queue.ready.push_back(StoredMessage {
                    body,
                    properties,
                    delivery_count: 0,
                });
                drop(state);
                self.broker.shared.arrived.notify_all();
            }
            None => {
                state.stats.dropped += 1;
                debug!(routing_key = %routing_key, "no queue bound to routing key, message dropped");
            }
        }
        Ok(())
    }

    fn basic_get(
        &mut self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let shared = Arc::clone(&self.broker.shared);
        let deadline = wait_deadline(timeout);
        let mut state = shared.state.lock().map_err(|_| BrokerError::Poisoned)?;

        loop {
            if let Some(missing) = queues.iter().find(|q| !state.queues.contains_key(*q)) {
                return Err(BrokerError::QueueNotFound(missing.clone()));
            }

            let next = queues.iter().find_map(|name| {
                state
                    .queues
                    .get_mut(name)
                    .and_then(|q| q.ready.pop_front())
                    .map(|message| (name, message))
            });
            if let Some((name, message)) = next {
                state.stats.delivered += 1;
                drop(state);
                return Ok(Some(self.track(name, message)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = shared
                .arrived
                .wait_timeout(state, deadline - now)
                .map_err(|_| BrokerError::Poisoned)?;
            state = guard;
        }
    }

    fn basic_ack(&mut self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let refused = self.broker.lock()?.faults.fail_ack;
        if refused {
            return Err(BrokerError::transport("ack refused (injected fault)"));
        }

        self.settle(tag)?;
        self.broker.lock()?.stats.acked += 1;
        Ok(())
    }

    fn basic_nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let Unacked { queue, message } = self.settle(tag)?;
        let mut state = self.broker.lock()?;

        if requeue {
            state.stats.requeued += 1;
            state.requeue(&queue, message);
            drop(state);
            self.broker.shared.arrived.notify_all();
            return Ok(());
        }

        state.stats.rejected += 1;
        let target = state
            .queues
            .get(&queue)
            .and_then(|q| q.declaration.dead_letter_queue())
            .map(str::to_string);

        let Some(dead) = target.as_deref().and_then(|t| state.queues.get_mut(t)) else {
            debug!(queue = %queue, "rejected without dead-letter target, message discarded");
            return Ok(());
        };

        let mut properties = message.properties;
        properties
            .headers
            .insert(DEATH_QUEUE_HEADER.to_string(), json!(queue));
        properties.headers.insert(
            DEATH_COUNT_HEADER.to_string(),
            json!(message.delivery_count.saturating_add(1)),
        );
        dead.ready.push_back(StoredMessage {
            body: message.body,
            properties,
            delivery_count: 0,
        });
        state.stats.dead_lettered += 1;
        drop(state);
        self.broker.shared.arrived.notify_all();
        Ok(())
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        if self.unacked.is_empty() {
            return;
        }
        let mut state = self.broker.inspect();
        for (_, Unacked { queue, message }) in self.unacked.drain() {
            state.requeue(&queue, message);
        }
        drop(state);
        self.broker.shared.arrived.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{DEAD_LETTER_ARG, QueueDeclaration};

    fn broker_with(queues: &[&str]) -> (InMemoryBroker, InMemoryChannel) {
        let broker = InMemoryBroker::new();
        let mut channel = broker.channel();
        for q in queues {
            channel.queue_declare(&QueueDeclaration::new(*q)).unwrap();
        }
        (broker, channel)
    }

    fn names(queues: &[&str]) -> Vec<String> {
        queues.iter().map(|q| q.to_string()).collect()
    }

    #[test]
    fn get_times_out_with_none() {
        let (_broker, mut channel) = broker_with(&["q"]);

        let started = Instant::now();
        let got = channel.basic_get(&names(&["q"]), Duration::from_millis(20)).unwrap();

        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn unrepresentable_timeout_does_not_overflow() {
        let (_broker, mut channel) = broker_with(&["q"]);
        channel
            .basic_publish("q", b"ready".to_vec(), MessageProperties::new())
            .unwrap();

        let got = channel.basic_get(&names(&["q"]), Duration::MAX).unwrap();

        assert_eq!(got.unwrap().body, b"ready");
    }

    #[test]
    fn get_on_undeclared_queue_fails() {
        let (_broker, mut channel) = broker_with(&[]);
        let err = channel
            .basic_get(&names(&["missing"]), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, BrokerError::QueueNotFound(ref q) if q == "missing"));
    }

    #[test]
    fn competing_channels_never_share_a_delivery() {
        let (broker, mut producer) = broker_with(&["q"]);
        producer
            .basic_publish("q", b"only-one".to_vec(), MessageProperties::new())
            .unwrap();

        let mut a = broker.channel();
        let mut b = broker.channel();
        let first = a.basic_get(&names(&["q"]), Duration::ZERO).unwrap();
        let second = b.basic_get(&names(&["q"]), Duration::ZERO).unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn requeue_redelivers_with_incremented_count() {
        let (broker, mut channel) = broker_with(&["q"]);
        channel
            .basic_publish("q", b"m".to_vec(), MessageProperties::new())
            .unwrap();

        let first = channel.basic_get(&names(&["q"]), Duration::ZERO).unwrap().unwrap();
        assert!(!first.redelivered);
        first.requeue(&mut channel).unwrap();

        let second = channel.basic_get(&names(&["q"]), Duration::ZERO).unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.delivery_count, 1);
        assert_eq!(second.attempt(), 2);
        assert_eq!(broker.stats().requeued, 1);
    }

    #[test]
    fn ack_is_final_and_tags_are_single_use() {
        let (broker, mut channel) = broker_with(&["q"]);
        channel
            .basic_publish("q", b"m".to_vec(), MessageProperties::new())
            .unwrap();

        let delivery = channel.basic_get(&names(&["q"]), Duration::ZERO).unwrap().unwrap();
        delivery.ack(&mut channel).unwrap();

        assert!(matches!(
            delivery.ack(&mut channel),
            Err(BrokerError::UnknownDeliveryTag(_))
        ));
        assert_eq!(broker.ready_count("q"), 0);
        assert_eq!(broker.stats().acked, 1);
    }

    #[test]
    fn reject_routes_to_dead_letter_queue() {
        let broker = InMemoryBroker::new();
        let mut channel = broker.channel();
        channel.queue_declare(&QueueDeclaration::new("q.dead")).unwrap();
        channel
            .queue_declare(&QueueDeclaration::new("q").with_argument(DEAD_LETTER_ARG, json!("q.dead")))
            .unwrap();
        channel
            .basic_publish("q", b"m".to_vec(), MessageProperties::new())
            .unwrap();

        let delivery = channel.basic_get(&names(&["q"]), Duration::ZERO).unwrap().unwrap();
        delivery.reject(&mut channel).unwrap();

        let dead = broker.messages("q.dead");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].properties.headers[DEATH_QUEUE_HEADER], json!("q"));
        assert_eq!(dead[0].properties.headers[DEATH_COUNT_HEADER], json!(1));
        assert_eq!(broker.stats().dead_lettered, 1);
    }

    #[test]
    fn dropping_a_channel_returns_unacked_deliveries() {
        let (broker, mut producer) = broker_with(&["q"]);
        producer
            .basic_publish("q", b"m".to_vec(), MessageProperties::new())
            .unwrap();

        {
            let mut consumer = broker.channel();
            let _held = consumer.basic_get(&names(&["q"]), Duration::ZERO).unwrap().unwrap();
            assert_eq!(broker.ready_count("q"), 0);
        }

        assert_eq!(broker.ready_count("q"), 1);
        assert_eq!(broker.messages("q")[0].delivery_count, 1);
    }

    #[test]
    fn publish_without_queue_is_dropped() {
        let (broker, mut channel) = broker_with(&[]);
        channel
            .basic_publish("nowhere", b"m".to_vec(), MessageProperties::new())
            .unwrap();

        assert_eq!(broker.stats().published, 1);
        assert_eq!(broker.stats().dropped, 1);
    }

    #[test]
    fn waiting_consumer_wakes_on_publish() {
        let (broker, mut channel) = broker_with(&["q"]);
        let publisher = broker.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher
                .channel()
                .basic_publish("q", b"late".to_vec(), MessageProperties::new())
                .unwrap();
        });

        let got = channel
            .basic_get(&names(&["q"]), Duration::from_secs(2))
            .unwrap();
        handle.join().unwrap();

        assert_eq!(got.map(|d| d.body), Some(b"late".to_vec()));
    }
}
