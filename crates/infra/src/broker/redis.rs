//! Redis-backed work queues.
//!
//! Each queue is a Redis list; a consumer moves a message atomically into its
//! own in-flight list (`RPOPLPUSH`) and removes it from there on ack. This gives:
//! - **Competing consumers**: a message is popped by exactly one channel
//! - **At-least-once**: requeued or abandoned in-flight messages are pushed back
//! - **Dead-lettering**: rejected messages go to the queue's dead-letter target
//!
//! ## Keys
//!
//! - `{ns}:queues`: hash of queue name to declaration (JSON)
//! - `{ns}:queue:{name}`: ready messages (LPUSH in, RPOPLPUSH out)
//! - `{ns}:queue:{name}:unacked:{consumer}`: in-flight messages of one consumer
//! - `{ns}:queue:{name}:consumers`: consumers that ever took from the queue
//! - `{ns}:queue:{name}:poison`: raw entries that are not valid frames
//! - `{ns}:consumer:{consumer}:alive`: liveness lease, refreshed while consuming
//!
//! A consumer name is held by one live channel at a time (the lease). In-flight
//! lists of other consumers are only reclaimed once their lease has expired, so
//! the lease must outlast the longest task.
//!
//! Messages are stored as versioned BSON frames (`v: 1`), whatever the wire
//! format of the body they carry. An entry that does not decode is moved to the
//! poison list and reported on `drawq::errors`; consuming goes on.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use bson::spec::BinarySubtype;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use drawq_messaging::{
    BrokerConfig, BrokerError, Channel, Connector, DEATH_COUNT_HEADER, DEATH_QUEUE_HEADER,
    Delivery, DeliveryTag, MessageProperties, QueueDeclaration, wait_deadline,
};

use crate::worker::reporter::ERROR_TARGET;

/// Current frame layout version.
pub const FRAME_VERSION: i64 = 1;

/// How often empty queues are polled while waiting for a delivery.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a consumer counts as alive after its last heartbeat.
const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// Deletes the lease only if this channel still holds it.
const RELEASE_LEASE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// A message as persisted in Redis.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    pub delivery_count: u32,
}

#[derive(Deserialize)]
struct FrameHeader {
    v: i64,
}

#[derive(Serialize, Deserialize)]
struct FrameV1 {
    v: i64,
    properties: MessageProperties,
    body: bson::Binary,
    delivery_count: i64,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        let frame = FrameV1 {
            v: FRAME_VERSION,
            properties: self.properties.clone(),
            body: bson::Binary {
                subtype: BinarySubtype::Generic,
                bytes: self.body.clone(),
            },
            delivery_count: i64::from(self.delivery_count),
        };
        bson::to_vec(&frame).map_err(|e| BrokerError::protocol(format!("frame encode: {e}")))
    }

    /// Dispatches on the frame version; unknown versions are a protocol error.
    pub fn decode(bytes: &[u8]) -> Result<Self, BrokerError> {
        let header: FrameHeader = bson::from_slice(bytes)
            .map_err(|e| BrokerError::protocol(format!("frame header: {e}")))?;

        match header.v {
            1 => {
                let frame: FrameV1 = bson::from_slice(bytes)
                    .map_err(|e| BrokerError::protocol(format!("frame v1: {e}")))?;
                Ok(Self {
                    properties: frame.properties,
                    body: frame.body.bytes,
                    delivery_count: u32::try_from(frame.delivery_count).unwrap_or(0),
                })
            }
            other => Err(BrokerError::protocol(format!("unsupported frame version {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
struct Keys {
    namespace: String,
    consumer: String,
}

impl Keys {
    fn declarations(&self) -> String {
        format!("{}:queues", self.namespace)
    }

    fn ready(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.namespace, queue)
    }

    fn unacked(&self, queue: &str) -> String {
        self.unacked_of(queue, &self.consumer)
    }

    fn unacked_of(&self, queue: &str, consumer: &str) -> String {
        format!("{}:queue:{}:unacked:{}", self.namespace, queue, consumer)
    }

    fn consumers(&self, queue: &str) -> String {
        format!("{}:queue:{}:consumers", self.namespace, queue)
    }

    fn poison(&self, queue: &str) -> String {
        format!("{}:queue:{}:poison", self.namespace, queue)
    }

    fn alive(&self) -> String {
        self.alive_of(&self.consumer)
    }

    fn alive_of(&self, consumer: &str) -> String {
        format!("{}:consumer:{}:alive", self.namespace, consumer)
    }
}

fn redis_error(e: redis::RedisError) -> BrokerError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        BrokerError::unavailable(e.to_string())
    } else {
        BrokerError::transport(e.to_string())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Opens [`RedisChannel`]s from the broker URL.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    poll_interval: Duration,
    lease: Duration,
}

impl Default for RedisConnector {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease: DEFAULT_LEASE,
        }
    }
}

impl RedisConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Liveness lease of a consumer. Must be longer than any single task.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

impl Connector for RedisConnector {
    type Channel = RedisChannel;

    fn connect(&self, config: &BrokerConfig) -> Result<RedisChannel, BrokerError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BrokerError::unavailable(format!("{}: {e}", config.redacted_url())))?;
        let mut conn = client
            .get_connection()
            .map_err(|e| BrokerError::unavailable(format!("{}: {e}", config.redacted_url())))?;

        let keys = Keys {
            namespace: config.namespace.clone(),
            consumer: config.consumer_name.clone(),
        };
        let token = Uuid::now_v7().to_string();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(keys.alive())
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(millis(self.lease))
            .query(&mut conn)
            .map_err(redis_error)?;
        if claimed.is_none() {
            return Err(BrokerError::ConsumerNameInUse(config.consumer_name.clone()));
        }
        debug!(consumer = %keys.consumer, lease_ms = millis(self.lease), "consumer lease claimed");

        Ok(RedisChannel {
            conn,
            keys,
            token,
            lease: self.lease,
            poll_interval: self.poll_interval,
            last_beat: Instant::now(),
            next_tag: 0,
            unacked: HashMap::new(),
            swept: HashMap::new(),
        })
    }
}

struct InFlight {
    queue: String,
    raw: Vec<u8>,
    frame: Frame,
}

/// Channel on a Redis connection.
pub struct RedisChannel {
    conn: redis::Connection,
    keys: Keys,
    /// Value of the lease key while this channel holds it.
    token: String,
    lease: Duration,
    poll_interval: Duration,
    last_beat: Instant,
    next_tag: u64,
    unacked: HashMap<DeliveryTag, InFlight>,
    /// When each consumed queue was last checked for dead consumers.
    swept: HashMap<String, Instant>,
}

impl RedisChannel {
    pub fn consumer_name(&self) -> &str {
        &self.keys.consumer
    }

    fn declaration(&mut self, queue: &str) -> Result<Option<QueueDeclaration>, BrokerError> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.keys.declarations())
            .arg(queue)
            .query(&mut self.conn)
            .map_err(redis_error)?;
        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| BrokerError::protocol(format!("declaration of {queue}: {e}")))
        })
        .transpose()
    }

    fn is_declared(&mut self, queue: &str) -> Result<bool, BrokerError> {
        redis::cmd("HEXISTS")
            .arg(self.keys.declarations())
            .arg(queue)
            .query(&mut self.conn)
            .map_err(redis_error)
    }

    /// Refresh the lease, at most every third of its length.
    fn heartbeat(&mut self) -> Result<(), BrokerError> {
        if self.last_beat.elapsed() < self.lease / 3 {
            return Ok(());
        }
        redis::cmd("SET")
            .arg(self.keys.alive())
            .arg(&self.token)
            .arg("PX")
            .arg(millis(self.lease))
            .query::<()>(&mut self.conn)
            .map_err(redis_error)?;
        self.last_beat = Instant::now();
        Ok(())
    }

    /// Register as a consumer of `queue` and take back what dead consumers
    /// left in flight. Runs on first use of a queue, then once per lease.
    fn sweep(&mut self, queue: &str) -> Result<(), BrokerError> {
        let first = match self.swept.get(queue) {
            Some(last) if last.elapsed() < self.lease => return Ok(()),
            Some(_) => false,
            None => true,
        };
        self.swept.insert(queue.to_string(), Instant::now());

        if first {
            // Left by an earlier holder of this (configured) consumer name.
            self.recover_own(queue)?;
            redis::cmd("SADD")
                .arg(self.keys.consumers(queue))
                .arg(&self.keys.consumer)
                .query::<()>(&mut self.conn)
                .map_err(redis_error)?;
        }

        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.consumers(queue))
            .query(&mut self.conn)
            .map_err(redis_error)?;
        for owner in members {
            if owner == self.keys.consumer {
                continue;
            }
            let alive: bool = redis::cmd("EXISTS")
                .arg(self.keys.alive_of(&owner))
                .query(&mut self.conn)
                .map_err(redis_error)?;
            if !alive {
                self.reclaim(queue, &owner)?;
            }
        }
        Ok(())
    }

    fn recover_own(&mut self, queue: &str) -> Result<(), BrokerError> {
        let leftovers: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(self.keys.unacked(queue))
            .arg(0)
            .arg(-1)
            .query(&mut self.conn)
            .map_err(redis_error)?;
        if leftovers.is_empty() {
            return Ok(());
        }
        let count = leftovers.len();
        for raw in leftovers {
            self.return_or_quarantine(queue, &raw)?;
        }
        warn!(queue = %queue, count, "recovered in-flight messages of a previous run");
        Ok(())
    }

    /// Move a dead consumer's in-flight messages back to the queue, one entry
    /// at a time through our own in-flight list, so that concurrent reclaimers
    /// never both get the same entry and a crash mid-way loses nothing.
    fn reclaim(&mut self, queue: &str, owner: &str) -> Result<(), BrokerError> {
        let from = self.keys.unacked_of(queue, owner);
        let mut count = 0_usize;
        loop {
            let raw: Option<Vec<u8>> = redis::cmd("RPOPLPUSH")
                .arg(&from)
                .arg(self.keys.unacked(queue))
                .query(&mut self.conn)
                .map_err(redis_error)?;
            let Some(raw) = raw else {
                break;
            };
            self.return_or_quarantine(queue, &raw)?;
            count += 1;
        }
        redis::cmd("SREM")
            .arg(self.keys.consumers(queue))
            .arg(owner)
            .query::<()>(&mut self.conn)
            .map_err(redis_error)?;
        if count > 0 {
            warn!(queue = %queue, owner = %owner, count, "reclaimed in-flight messages of a dead consumer");
        }
        Ok(())
    }

    /// `raw` sits in our in-flight list: requeue it, or quarantine it if it is
    /// not a frame.
    fn return_or_quarantine(&mut self, queue: &str, raw: &[u8]) -> Result<(), BrokerError> {
        match Frame::decode(raw) {
            Ok(frame) => self.requeue_raw(queue, raw, &frame),
            Err(err) => self.quarantine(queue, raw, &err),
        }
    }

    /// Move an undecodable entry from our in-flight list to the poison list.
    fn quarantine(&mut self, queue: &str, raw: &[u8], err: &BrokerError) -> Result<(), BrokerError> {
        let poison = self.keys.poison(queue);
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.keys.unacked(queue))
            .arg(1)
            .arg(raw)
            .ignore()
            .cmd("LPUSH")
            .arg(&poison)
            .arg(raw)
            .ignore()
            .query::<()>(&mut self.conn)
            .map_err(redis_error)?;
        error!(
            target: ERROR_TARGET,
            queue = %queue,
            poison = %poison,
            bytes = raw.len(),
            error = %err,
            "undecodable frame quarantined"
        );
        Ok(())
    }

    fn try_pop(&mut self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        loop {
            let raw: Option<Vec<u8>> = redis::cmd("RPOPLPUSH")
                .arg(self.keys.ready(queue))
                .arg(self.keys.unacked(queue))
                .query(&mut self.conn)
                .map_err(redis_error)?;
            let Some(raw) = raw else {
                return Ok(None);
            };

            let frame = match Frame::decode(&raw) {
                Ok(frame) => frame,
                Err(err) => {
                    self.quarantine(queue, &raw, &err)?;
                    continue;
                }
            };
            self.next_tag += 1;
            let tag = DeliveryTag::new(self.next_tag);
            let delivery = Delivery {
                tag,
                queue: queue.to_string(),
                body: frame.body.clone(),
                properties: frame.properties.clone(),
                redelivered: frame.delivery_count > 0,
                delivery_count: frame.delivery_count,
            };
            self.unacked.insert(
                tag,
                InFlight {
                    queue: queue.to_string(),
                    raw,
                    frame,
                },
            );
            return Ok(Some(delivery));
        }
    }

    fn settle(&mut self, tag: DeliveryTag) -> Result<InFlight, BrokerError> {
        self.unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag.value()))
    }

    fn requeue_raw(&mut self, queue: &str, raw: &[u8], frame: &Frame) -> Result<(), BrokerError> {
        let mut frame = frame.clone();
        frame.delivery_count = frame.delivery_count.saturating_add(1);
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.keys.unacked(queue))
            .arg(1)
            .arg(raw)
            .ignore()
            .cmd("RPUSH")
            .arg(self.keys.ready(queue))
            .arg(frame.encode()?)
            .ignore()
            .query::<()>(&mut self.conn)
            .map_err(redis_error)
    }

    fn requeue(&mut self, in_flight: &InFlight) -> Result<(), BrokerError> {
        self.requeue_raw(&in_flight.queue, &in_flight.raw, &in_flight.frame)
    }

    fn release_lease(&mut self) -> Result<(), BrokerError> {
        redis::Script::new(RELEASE_LEASE)
            .key(self.keys.alive())
            .arg(&self.token)
            .invoke::<i64>(&mut self.conn)
            .map_err(redis_error)?;
        let queues: Vec<String> = self.swept.keys().cloned().collect();
        for queue in queues {
            redis::cmd("SREM")
                .arg(self.keys.consumers(&queue))
                .arg(&self.keys.consumer)
                .query::<()>(&mut self.conn)
                .map_err(redis_error)?;
        }
        Ok(())
    }
}

impl Channel for RedisChannel {
    fn queue_declare(&mut self, declaration: &QueueDeclaration) -> Result<(), BrokerError> {
        let json = serde_json::to_string(declaration)
            .map_err(|e| BrokerError::protocol(format!("declaration encode: {e}")))?;
        let created: bool = redis::cmd("HSETNX")
            .arg(self.keys.declarations())
            .arg(&declaration.name)
            .arg(json)
            .query(&mut self.conn)
            .map_err(redis_error)?;
        if created {
            return Ok(());
        }

        match self.declaration(&declaration.name)? {
            Some(existing) => declaration.check_compatible(&existing),
            // Deleted between HSETNX and HGET; declare again.
            None => self.queue_declare(declaration),
        }
    }

    fn queue_delete(&mut self, name: &str) -> Result<(), BrokerError> {
        redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.keys.declarations())
            .arg(name)
            .ignore()
            .cmd("DEL")
            .arg(self.keys.ready(name))
            .ignore()
            .query::<()>(&mut self.conn)
            .map_err(redis_error)?;
        self.swept.remove(name);
        Ok(())
    }

    fn basic_publish(
        &mut self,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        if !self.is_declared(routing_key)? {
            debug!(routing_key = %routing_key, "no queue bound to routing key, message dropped");
            return Ok(());
        }
        let frame = Frame {
            properties,
            body,
            delivery_count: 0,
        };
        let _: i64 = redis::cmd("LPUSH")
            .arg(self.keys.ready(routing_key))
            .arg(frame.encode()?)
            .query(&mut self.conn)
            .map_err(redis_error)?;
        Ok(())
    }

    fn basic_get(
        &mut self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        self.heartbeat()?;
        for queue in queues {
            if !self.is_declared(queue)? {
                return Err(BrokerError::QueueNotFound(queue.clone()));
            }
            self.sweep(queue)?;
        }

        let deadline = wait_deadline(timeout);
        loop {
            for queue in queues {
                if let Some(delivery) = self.try_pop(queue)? {
                    return Ok(Some(delivery));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.poll_interval.min(deadline - now));
            self.heartbeat()?;
        }
    }

    fn basic_ack(&mut self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let in_flight = self.settle(tag)?;
        let removed: i64 = redis::cmd("LREM")
            .arg(self.keys.unacked(&in_flight.queue))
            .arg(1)
            .arg(&in_flight.raw)
            .query(&mut self.conn)
            .map_err(redis_error)?;
        if removed == 0 {
            warn!(
                queue = %in_flight.queue,
                lease_ms = millis(self.lease),
                "acked delivery was already reclaimed; the task outlived the consumer lease"
            );
        }
        self.heartbeat()
    }

    fn basic_nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let in_flight = self.settle(tag)?;
        if requeue {
            return self.requeue(&in_flight);
        }

        let target = self
            .declaration(&in_flight.queue)?
            .and_then(|d| d.dead_letter_queue().map(str::to_string));
        let target = match target {
            Some(t) if self.is_declared(&t)? => Some(t),
            _ => None,
        };

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(self.keys.unacked(&in_flight.queue))
            .arg(1)
            .arg(&in_flight.raw)
            .ignore();

        match &target {
            Some(dead) => {
                let mut properties = in_flight.frame.properties.clone();
                properties
                    .headers
                    .insert(DEATH_QUEUE_HEADER.to_string(), json!(in_flight.queue));
                properties.headers.insert(
                    DEATH_COUNT_HEADER.to_string(),
                    json!(in_flight.frame.delivery_count.saturating_add(1)),
                );
                let frame = Frame {
                    properties,
                    body: in_flight.frame.body.clone(),
                    delivery_count: 0,
                };
                pipe.cmd("LPUSH").arg(self.keys.ready(dead)).arg(frame.encode()?).ignore();
            }
            None => {
                debug!(queue = %in_flight.queue, "rejected without dead-letter target, message discarded");
            }
        }
        pipe.query::<()>(&mut self.conn).map_err(redis_error)
    }
}

impl Drop for RedisChannel {
    fn drop(&mut self) {
        let pending: Vec<InFlight> = self.unacked.drain().map(|(_, v)| v).collect();
        let count = pending.len();
        for in_flight in &pending {
            if let Err(err) = self.requeue(in_flight) {
                warn!(queue = %in_flight.queue, error = %err, "could not return in-flight message");
            }
        }
        if count > 0 {
            info!(count, "returned in-flight messages on channel close");
        }
        if let Err(err) = self.release_lease() {
            warn!(consumer = %self.keys.consumer, error = %err, "could not release consumer lease");
        }
    }
}

impl core::fmt::Debug for RedisChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisChannel")
            .field("namespace", &self.keys.namespace)
            .field("consumer", &self.keys.consumer)
            .field("lease", &self.lease)
            .field("unacked", &self.unacked.len())
            .finish()
    }
}
