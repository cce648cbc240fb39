//! Draining of dead-lettered messages.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use anyhow::{Context, anyhow};
use serde_json::{Value, json};
use tracing::{info, info_span, warn};

use drawq_core::{Reply, ResultKey, ResultRecord, TaskBody};
use drawq_messaging::{
    Channel, ConnectionManager, Connector, DEATH_COUNT_HEADER, DEATH_QUEUE_HEADER, Delivery,
    MessageProperties, Publisher,
};

use super::handler::DeadLetterDrain;
use super::processor::{DeliveryProcessor, Outcome, WorkerError, panic_message};
use super::reporter::{
    ErrorReporter, FailureAction, FailureReport, TracingErrorReporter, body_for_report,
};
use crate::result_store::ResultStore;

/// Hands dead-lettered deliveries to a [`DeadLetterDrain`].
///
/// Never requeues. A drained message is acked; a failed one is reported and
/// left unacknowledged, so it only comes back when the channel is closed.
pub struct DeadLetterProcessor<D, R = TracingErrorReporter> {
    queue: String,
    drain: D,
    reporter: R,
}

impl<D: DeadLetterDrain> DeadLetterProcessor<D> {
    pub fn new(queue: impl Into<String>, drain: D) -> Self {
        Self {
            queue: queue.into(),
            drain,
            reporter: TracingErrorReporter,
        }
    }
}

impl<D, R> DeadLetterProcessor<D, R>
where
    D: DeadLetterDrain,
    R: ErrorReporter,
{
    pub fn with_reporter<R2: ErrorReporter>(self, reporter: R2) -> DeadLetterProcessor<D, R2> {
        DeadLetterProcessor {
            queue: self.queue,
            drain: self.drain,
            reporter,
        }
    }

    pub fn drain(&self) -> &D {
        &self.drain
    }

    fn run_drain(&self, body: &Value, properties: &MessageProperties) -> anyhow::Result<()> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.drain.drain(body, properties))) {
            Ok(result) => result,
            Err(payload) => Err(anyhow!("drain panicked: {}", panic_message(payload.as_ref()))),
        }
    }

    fn leave(&self, delivery: &Delivery, body: Value, err: anyhow::Error) -> Outcome {
        let report = FailureReport::new(
            &self.queue,
            &err,
            body,
            delivery.properties.clone(),
            delivery.attempt(),
            FailureAction::LeftUnacked,
        );
        self.reporter.report(&report);
        Outcome::LeftUnacked
    }
}

impl<D, R> DeliveryProcessor for DeadLetterProcessor<D, R>
where
    D: DeadLetterDrain,
    R: ErrorReporter,
{
    fn queue(&self) -> &str {
        &self.queue
    }

    fn process<C>(
        &self,
        channel: &mut C,
        publisher: &Publisher,
        delivery: Delivery,
    ) -> Result<Outcome, WorkerError>
    where
        C: Channel + ?Sized,
    {
        let span = info_span!(
            "dead_letter",
            queue = %self.queue,
            delivery_tag = %delivery.tag,
        );
        let _enter = span.enter();

        let content_type = delivery.properties.content_type.as_deref();
        let body: Value = match publisher.format().decode_checked(content_type, &delivery.body) {
            Ok(body) => body,
            Err(err) => {
                let raw = body_for_report(publisher.format(), &delivery.body);
                let err = anyhow::Error::new(err).context("undecodable dead-letter body");
                return Ok(self.leave(&delivery, raw, err));
            }
        };

        match self.run_drain(&body, &delivery.properties) {
            Ok(()) => {
                delivery.ack(channel)?;
                info!("dead letter drained");
                Ok(Outcome::Acked)
            }
            Err(err) => Ok(self.leave(&delivery, body, err)),
        }
    }
}

impl<D, R> core::fmt::Debug for DeadLetterProcessor<D, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeadLetterProcessor")
            .field("queue", &self.queue)
            .finish()
    }
}

/// Tells the enqueuer that its task was given up on.
///
/// Writes an error [`ResultRecord`] under the task's result key and publishes
/// an error [`Reply`] to `reply_to` when there is one. Replies go out on a
/// connection of their own, since a drain has no access to the consuming
/// channel.
pub struct FailureReportingDrain<S, C: Connector> {
    domain: String,
    store: S,
    replies: Mutex<ConnectionManager<C>>,
}

impl<S, C> FailureReportingDrain<S, C>
where
    S: ResultStore,
    C: Connector,
{
    pub fn new(domain: impl Into<String>, store: S, replies: ConnectionManager<C>) -> Self {
        Self {
            domain: domain.into(),
            store,
            replies: Mutex::new(replies),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S, C> DeadLetterDrain for FailureReportingDrain<S, C>
where
    S: ResultStore,
    C: Connector,
{
    fn drain(&self, body: &Value, properties: &MessageProperties) -> anyhow::Result<()> {
        let task: TaskBody =
            serde_json::from_value(body.clone()).context("dead letter is not a task body")?;

        let attempts = properties
            .headers
            .get(DEATH_COUNT_HEADER)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let origin = properties
            .headers
            .get(DEATH_QUEUE_HEADER)
            .and_then(Value::as_str)
            .unwrap_or("unknown queue");

        let record = ResultRecord::error(json!({
            "error": format!("task dead-lettered from {origin}"),
            "attempts": attempts,
        }));
        let key = ResultKey::new(&self.domain, &task.subject_id);
        self.store.set(&key, &record)?;

        if let Some(reply_to) = properties.reply_to.as_deref() {
            let mut reply_props = MessageProperties::new();
            reply_props.correlation_id = properties.correlation_id.clone();
            let mut replies = self
                .replies
                .lock()
                .map_err(|_| anyhow!("reply connection poisoned"))?;
            replies.publish(&Reply::from(&record), reply_to, None, reply_props)?;
        }

        warn!(subject_id = %task.subject_id, attempts, "dead-lettered task reported as failed");
        Ok(())
    }
}
