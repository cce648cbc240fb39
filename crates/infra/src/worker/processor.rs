//! Task processing: decode, run the handler, settle the delivery.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::thread;

use anyhow::{Context, anyhow};
use serde_json::{Value, json};
use tracing::{debug, info, info_span, warn};

use drawq_core::{Reply, ResultKey, ResultRecord, TaskBody, TaskContext};
use drawq_messaging::{
    BrokerError, Channel, DEAD_LETTER_ARG, Delivery, MessageProperties, Publisher, QueueArguments,
};

use super::handler::{NoTransaction, TaskHandler, TransactionScope};
use super::reporter::{
    ErrorReporter, FailureAction, FailureReport, TracingErrorReporter, body_for_report,
};
use super::retry::{RetryDecision, RetryPolicy};
use crate::config::WorkerConfig;
use crate::result_store::{ResultStore, ResultStoreError};

/// Fatal worker failure: anything that went wrong outside business logic.
///
/// The worker stops on these; restarting is the supervisor's job.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    ResultStore(#[from] ResultStoreError),

    #[error("worker misconfigured: {0}")]
    Misconfigured(String),
}

/// When the delivery is acked relative to the result write and reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckOrdering {
    /// Ack, then write the result and publish the reply. A crash in between
    /// loses the result but never runs the task twice.
    #[default]
    AckFirst,
    /// Write the result and publish the reply, then ack. A crash in between
    /// runs the task again.
    PersistFirst,
}

impl AckOrdering {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckOrdering::AckFirst => "ack-first",
            AckOrdering::PersistFirst => "persist-first",
        }
    }
}

impl core::fmt::Display for AckOrdering {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "ack-first" => Ok(AckOrdering::AckFirst),
            "persist-first" => Ok(AckOrdering::PersistFirst),
            other => Err(format!("unknown ack ordering: {other}")),
        }
    }
}

/// Final state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Requeued,
    DeadLettered,
    /// Undecodable body, rejected without requeue.
    Rejected,
    /// Neither acked nor requeued; returns to the queue when the channel closes.
    LeftUnacked,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Acked => "acked",
            Outcome::Requeued => "requeued",
            Outcome::DeadLettered => "dead_lettered",
            Outcome::Rejected => "rejected",
            Outcome::LeftUnacked => "left_unacked",
        }
    }
}

/// Something the process loop can hand deliveries to.
pub trait DeliveryProcessor {
    /// Queue this processor consumes.
    fn queue(&self) -> &str;

    /// Arguments the consumed queue is declared with.
    fn queue_arguments(&self) -> QueueArguments {
        QueueArguments::new()
    }

    /// Queue that must exist before the consumed one (its dead-letter target).
    fn dead_letter_queue(&self) -> Option<&str> {
        None
    }

    fn validate(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Settle `delivery` on `channel`. `Err` is fatal for the worker.
    fn process<C>(
        &self,
        channel: &mut C,
        publisher: &Publisher,
        delivery: Delivery,
    ) -> Result<Outcome, WorkerError>
    where
        C: Channel + ?Sized;
}

/// Runs one task queue's deliveries through a [`TaskHandler`].
///
/// - Success: ack, one result write, one reply (if `reply_to` is set)
/// - Handler error or panic: reported, then requeued (or dead-lettered once a
///   bounded retry policy is exhausted); never acked
/// - Undecodable body: reported, rejected without requeue
pub struct TaskProcessor<H, S, T = NoTransaction, R = TracingErrorReporter> {
    queue: String,
    handler: H,
    store: S,
    transaction: T,
    reporter: R,
    retry: RetryPolicy,
    ordering: AckOrdering,
    dead_letter_queue: Option<String>,
    /// Result key prefix; the handler's domain when unset.
    result_prefix: Option<String>,
}

impl<H, S> TaskProcessor<H, S>
where
    H: TaskHandler,
    S: ResultStore,
{
    pub fn new(queue: impl Into<String>, handler: H, store: S) -> Self {
        Self {
            queue: queue.into(),
            handler,
            store,
            transaction: NoTransaction,
            reporter: TracingErrorReporter,
            retry: RetryPolicy::default(),
            ordering: AckOrdering::default(),
            dead_letter_queue: None,
            result_prefix: None,
        }
    }

    /// Processor for `config.queue` with the configured retry policy, ack
    /// ordering, dead-letter queue and result prefix.
    pub fn from_config(config: &WorkerConfig, handler: H, store: S) -> Self {
        let processor = Self::new(config.queue.clone(), handler, store)
            .with_retry_policy(config.retry.clone())
            .with_ack_ordering(config.ack_ordering)
            .with_result_prefix(config.result_prefix.clone());
        match &config.dead_letter_queue {
            Some(dead) => processor.with_dead_letter_queue(dead.clone()),
            None => processor,
        }
    }
}

impl<H, S, T, R> TaskProcessor<H, S, T, R>
where
    H: TaskHandler,
    S: ResultStore,
    T: TransactionScope,
    R: ErrorReporter,
{
    pub fn with_transaction<T2: TransactionScope>(self, transaction: T2) -> TaskProcessor<H, S, T2, R> {
        TaskProcessor {
            queue: self.queue,
            handler: self.handler,
            store: self.store,
            transaction,
            reporter: self.reporter,
            retry: self.retry,
            ordering: self.ordering,
            dead_letter_queue: self.dead_letter_queue,
            result_prefix: self.result_prefix,
        }
    }

    pub fn with_reporter<R2: ErrorReporter>(self, reporter: R2) -> TaskProcessor<H, S, T, R2> {
        TaskProcessor {
            queue: self.queue,
            handler: self.handler,
            store: self.store,
            transaction: self.transaction,
            reporter,
            retry: self.retry,
            ordering: self.ordering,
            dead_letter_queue: self.dead_letter_queue,
            result_prefix: self.result_prefix,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_ack_ordering(mut self, ordering: AckOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_dead_letter_queue(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }

    pub fn with_result_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.result_prefix = Some(prefix.into());
        self
    }

    fn result_prefix(&self) -> &str {
        self.result_prefix
            .as_deref()
            .unwrap_or_else(|| self.handler.domain())
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn ack_ordering(&self) -> AckOrdering {
        self.ordering
    }

    fn execute(&self, ctx: &TaskContext, body: &TaskBody) -> anyhow::Result<Value> {
        let run = || -> anyhow::Result<Value> {
            let mut subject = self
                .handler
                .resolve(&body.subject_id)
                .with_context(|| format!("resolving subject {}", body.subject_id))?;
            let mut work = || self.handler.handle(ctx, &mut subject, &body.task_kwargs);
            self.transaction.atomic(&mut work)
        };

        match panic::catch_unwind(AssertUnwindSafe(run)) {
            Ok(result) => result,
            Err(payload) => Err(anyhow!("handler panicked: {}", panic_message(payload.as_ref()))),
        }
    }

    fn succeed<C>(
        &self,
        channel: &mut C,
        publisher: &Publisher,
        delivery: &Delivery,
        body: &TaskBody,
        result: Value,
    ) -> Result<Outcome, WorkerError>
    where
        C: Channel + ?Sized,
    {
        let record = ResultRecord::success(result);
        let key = ResultKey::new(self.result_prefix(), &body.subject_id);

        match self.ordering {
            AckOrdering::AckFirst => {
                delivery.ack(channel)?;
                self.persist(channel, publisher, delivery, &key, &record)?;
            }
            AckOrdering::PersistFirst => {
                self.persist(channel, publisher, delivery, &key, &record)?;
                delivery.ack(channel)?;
            }
        }

        info!(key = %key, "task succeeded");
        Ok(Outcome::Acked)
    }

    fn persist<C>(
        &self,
        channel: &mut C,
        publisher: &Publisher,
        delivery: &Delivery,
        key: &ResultKey,
        record: &ResultRecord,
    ) -> Result<(), WorkerError>
    where
        C: Channel + ?Sized,
    {
        self.store.set(key, record)?;

        if let Some(reply_to) = delivery.reply_to() {
            let mut properties = MessageProperties::new();
            properties.correlation_id = delivery.properties.correlation_id.clone();
            publisher.publish(channel, &Reply::from(record), reply_to, None, properties)?;
            debug!(reply_to = %reply_to, "reply published");
        }
        Ok(())
    }

    fn fail<C>(
        &self,
        channel: &mut C,
        delivery: &Delivery,
        body: &TaskBody,
        err: anyhow::Error,
    ) -> Result<Outcome, WorkerError>
    where
        C: Channel + ?Sized,
    {
        let attempt = delivery.attempt();
        let decision = self.retry.decide(attempt);
        let action = match decision {
            RetryDecision::Requeue { .. } => FailureAction::Requeued,
            RetryDecision::DeadLetter => FailureAction::DeadLettered,
        };

        let report = FailureReport::new(
            &self.queue,
            &err,
            serde_json::to_value(body).unwrap_or(Value::Null),
            delivery.properties.clone(),
            attempt,
            action,
        )
        .with_subject(&body.subject_id);
        self.reporter.report(&report);

        match decision {
            RetryDecision::Requeue { delay } => {
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "backing off before requeue");
                    thread::sleep(delay);
                }
                delivery.requeue(channel)?;
                Ok(Outcome::Requeued)
            }
            RetryDecision::DeadLetter => {
                delivery.reject(channel)?;
                warn!(
                    dead_letter_queue = self.dead_letter_queue.as_deref().unwrap_or("-"),
                    "retries exhausted, task dead-lettered"
                );
                Ok(Outcome::DeadLettered)
            }
        }
    }

    fn reject_malformed<C>(
        &self,
        channel: &mut C,
        publisher: &Publisher,
        delivery: &Delivery,
        err: anyhow::Error,
    ) -> Result<Outcome, WorkerError>
    where
        C: Channel + ?Sized,
    {
        let report = FailureReport::new(
            &self.queue,
            &err,
            body_for_report(publisher.format(), &delivery.body),
            delivery.properties.clone(),
            delivery.attempt(),
            FailureAction::Rejected,
        );
        self.reporter.report(&report);

        delivery.reject(channel)?;
        Ok(Outcome::Rejected)
    }
}

impl<H, S, T, R> DeliveryProcessor for TaskProcessor<H, S, T, R>
where
    H: TaskHandler,
    S: ResultStore,
    T: TransactionScope,
    R: ErrorReporter,
{
    fn queue(&self) -> &str {
        &self.queue
    }

    fn queue_arguments(&self) -> QueueArguments {
        let mut arguments = QueueArguments::new();
        if let Some(dlq) = &self.dead_letter_queue {
            arguments.insert(DEAD_LETTER_ARG.to_string(), json!(dlq));
        }
        arguments
    }

    fn dead_letter_queue(&self) -> Option<&str> {
        self.dead_letter_queue.as_deref()
    }

    fn validate(&self) -> Result<(), WorkerError> {
        if self.retry.is_bounded() && self.dead_letter_queue.is_none() {
            return Err(WorkerError::Misconfigured(format!(
                "queue {} has a bounded retry policy but no dead-letter queue",
                self.queue
            )));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(WorkerError::Misconfigured(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
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
            "task",
            queue = %self.queue,
            delivery_tag = %delivery.tag,
            attempt = delivery.attempt(),
            subject_id = tracing::field::Empty,
        );
        let _enter = span.enter();

        let content_type = delivery.properties.content_type.as_deref();
        let body: TaskBody = match publisher.format().decode_checked(content_type, &delivery.body) {
            Ok(body) => body,
            Err(err) => {
                let err = anyhow::Error::new(err).context("undecodable task body");
                return self.reject_malformed(channel, publisher, &delivery, err);
            }
        };
        span.record("subject_id", tracing::field::display(&body.subject_id));

        let ctx = TaskContext::new(
            body.subject_id.clone(),
            delivery.attempt(),
            delivery.properties.correlation_id.clone(),
            body.log_context(),
        );
        let log_span = ctx.log().span();
        let _log = log_span.enter();

        debug!("executing task");
        match self.execute(&ctx, &body) {
            Ok(result) => self.succeed(channel, publisher, &delivery, &body, result),
            Err(err) => self.fail(channel, &delivery, &body, err),
        }
    }
}

impl<H, S, T, R> core::fmt::Debug for TaskProcessor<H, S, T, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskProcessor")
            .field("queue", &self.queue)
            .field("retry", &self.retry)
            .field("ordering", &self.ordering)
            .field("dead_letter_queue", &self.dead_letter_queue)
            .field("result_prefix", &self.result_prefix)
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use drawq_core::{SubjectId, TaskKwargs};
    use drawq_messaging::{InMemoryBroker, InMemoryChannel, QueueDeclaration, WireFormat};

    use crate::result_store::InMemoryResultStore;
    use crate::worker::reporter::RecordingErrorReporter;

    struct Echo;

    impl TaskHandler for Echo {
        type Subject = SubjectId;

        fn domain(&self) -> &str {
            "gacha"
        }

        fn resolve(&self, subject_id: &SubjectId) -> anyhow::Result<SubjectId> {
            Ok(subject_id.clone())
        }

        fn handle(
            &self,
            ctx: &TaskContext,
            subject: &mut SubjectId,
            task_kwargs: &TaskKwargs,
        ) -> anyhow::Result<Value> {
            match task_kwargs.get("fail").and_then(Value::as_str) {
                Some("panic") => panic!("deck on fire"),
                Some(msg) => Err(anyhow!("{msg}")),
                None => Ok(json!({"subject": subject.to_string(), "attempt": ctx.attempt()})),
            }
        }
    }

    struct CountingScope(Cell<u32>);

    impl TransactionScope for CountingScope {
        fn atomic(&self, work: &mut dyn FnMut() -> anyhow::Result<Value>) -> anyhow::Result<Value> {
            self.0.set(self.0.get() + 1);
            work()
        }
    }

    fn setup() -> (InMemoryBroker, InMemoryChannel) {
        let broker = InMemoryBroker::new();
        let mut channel = broker.channel();
        for q in ["tasks", "tasks.dead", "reply"] {
            channel.queue_declare(&QueueDeclaration::new(q)).unwrap();
        }
        (broker, channel)
    }

    fn deliver(channel: &mut InMemoryChannel, kwargs: Value, reply_to: Option<&str>) -> Delivery {
        let body = TaskBody::new(42, kwargs.as_object().cloned().unwrap_or_default());
        Publisher::default()
            .publish(channel, &body, "tasks", reply_to, MessageProperties::new())
            .unwrap();
        channel
            .basic_get(&["tasks".to_string()], Duration::ZERO)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn success_runs_inside_the_transaction_scope() {
        let (broker, mut channel) = setup();
        let store = InMemoryResultStore::arc();
        let processor = TaskProcessor::new("tasks", Echo, Arc::clone(&store))
            .with_transaction(CountingScope(Cell::new(0)));

        let delivery = deliver(&mut channel, json!({}), Some("reply"));
        let outcome = processor
            .process(&mut channel, &Publisher::default(), delivery)
            .unwrap();

        assert_eq!(outcome, Outcome::Acked);
        assert_eq!(processor.transaction.0.get(), 1);
        assert_eq!(broker.stats().acked, 1);
        assert_eq!(broker.messages("reply").len(), 1);

        let key = ResultKey::new("gacha", &SubjectId::from(42));
        let record = store.get(&key).unwrap().unwrap();
        assert_eq!(record.payload, json!({"subject": "42", "attempt": 1}));
    }

    #[test]
    fn panics_are_failures_not_crashes() {
        let (broker, mut channel) = setup();
        let reporter = RecordingErrorReporter::new();
        let processor = TaskProcessor::new("tasks", Echo, InMemoryResultStore::new())
            .with_reporter(reporter.clone());

        let delivery = deliver(&mut channel, json!({"fail": "panic"}), None);
        let outcome = processor
            .process(&mut channel, &Publisher::default(), delivery)
            .unwrap();

        assert_eq!(outcome, Outcome::Requeued);
        assert_eq!(broker.stats().requeued, 1);
        assert!(reporter.reports()[0].error.contains("deck on fire"));
    }

    #[test]
    fn persist_first_writes_before_ack() {
        let (broker, mut channel) = setup();
        broker.fail_acks(true);
        let store = InMemoryResultStore::arc();
        let processor = TaskProcessor::new("tasks", Echo, Arc::clone(&store))
            .with_ack_ordering(AckOrdering::PersistFirst);

        let delivery = deliver(&mut channel, json!({}), Some("reply"));
        let err = processor
            .process(&mut channel, &Publisher::default(), delivery)
            .unwrap_err();

        assert!(matches!(err, WorkerError::Broker(BrokerError::Transport(_))));
        assert_eq!(store.write_count(), 1);
        assert_eq!(broker.messages("reply").len(), 1);
    }

    #[test]
    fn ack_first_stops_before_writing_when_ack_fails() {
        let (broker, mut channel) = setup();
        broker.fail_acks(true);
        let store = InMemoryResultStore::arc();
        let processor = TaskProcessor::new("tasks", Echo, Arc::clone(&store));

        let delivery = deliver(&mut channel, json!({}), Some("reply"));
        assert!(processor
            .process(&mut channel, &Publisher::default(), delivery)
            .is_err());

        assert_eq!(store.write_count(), 0);
        assert!(broker.messages("reply").is_empty());
    }

    #[test]
    fn exhausted_retries_are_dead_lettered() {
        let broker = InMemoryBroker::new();
        let mut channel = broker.channel();
        channel.queue_declare(&QueueDeclaration::new("tasks.dead")).unwrap();
        let reporter = RecordingErrorReporter::new();
        let processor = TaskProcessor::new("tasks", Echo, InMemoryResultStore::new())
            .with_reporter(reporter.clone())
            .with_dead_letter_queue("tasks.dead")
            .with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO));
        processor.validate().unwrap();
        channel
            .queue_declare(
                &QueueDeclaration::new("tasks")
                    .with_argument(DEAD_LETTER_ARG, json!("tasks.dead")),
            )
            .unwrap();

        let first = deliver(&mut channel, json!({"fail": "deck empty"}), None);
        let outcome = processor
            .process(&mut channel, &Publisher::default(), first)
            .unwrap();
        assert_eq!(outcome, Outcome::Requeued);

        let second = channel
            .basic_get(&["tasks".to_string()], Duration::ZERO)
            .unwrap()
            .unwrap();
        let outcome = processor
            .process(&mut channel, &Publisher::default(), second)
            .unwrap();

        assert_eq!(outcome, Outcome::DeadLettered);
        assert_eq!(broker.messages("tasks.dead").len(), 1);
        assert_eq!(broker.ready_count("tasks"), 0);
        let actions: Vec<_> = reporter.reports().iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![FailureAction::Requeued, FailureAction::DeadLettered]);
    }

    #[test]
    fn bounded_retry_without_dead_letter_queue_is_refused() {
        let processor = TaskProcessor::new("tasks", Echo, InMemoryResultStore::new())
            .with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO));

        assert!(matches!(
            processor.validate(),
            Err(WorkerError::Misconfigured(_))
        ));
    }

    #[test]
    fn undecodable_body_is_rejected_not_requeued() {
        let (broker, mut channel) = setup();
        let reporter = RecordingErrorReporter::new();
        let processor = TaskProcessor::new("tasks", Echo, InMemoryResultStore::new())
            .with_reporter(reporter.clone());

        Publisher::new(WireFormat::Json)
            .publish(&mut channel, &json!({"subject_id": 42}), "tasks", None, MessageProperties::new())
            .unwrap();
        let delivery = channel
            .basic_get(&["tasks".to_string()], Duration::ZERO)
            .unwrap()
            .unwrap();

        let outcome = processor
            .process(&mut channel, &Publisher::new(WireFormat::Bson), delivery)
            .unwrap();

        assert_eq!(outcome, Outcome::Rejected);
        assert_eq!(broker.stats().requeued, 0);
        assert_eq!(broker.stats().rejected, 1);
        assert_eq!(reporter.reports()[0].action, FailureAction::Rejected);
        assert_eq!(reporter.reports()[0].subject_id, None);
    }

    #[test]
    fn processor_follows_the_worker_config() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DRAWQ_QUEUE", "tasks"),
            ("DRAWQ_DEAD_LETTER_QUEUE", "tasks.dead"),
            ("DRAWQ_MAX_ATTEMPTS", "2"),
            ("DRAWQ_RETRY_BASE_DELAY_MS", "0"),
            ("DRAWQ_ACK_ORDERING", "persist-first"),
            ("DRAWQ_RESULT_PREFIX", "banner"),
        ]);
        let config = WorkerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();

        let broker = InMemoryBroker::new();
        let mut channel = broker.channel();
        channel.queue_declare(&QueueDeclaration::new("tasks.dead")).unwrap();
        let store = InMemoryResultStore::arc();
        let processor = TaskProcessor::from_config(&config, Echo, Arc::clone(&store))
            .with_reporter(RecordingErrorReporter::new());

        assert_eq!(processor.queue(), "tasks");
        assert_eq!(processor.dead_letter_queue(), Some("tasks.dead"));
        assert_eq!(processor.ack_ordering(), AckOrdering::PersistFirst);
        assert_eq!(processor.retry_policy().max_attempts, Some(2));
        processor.validate().unwrap();
        channel
            .queue_declare(&QueueDeclaration::new("tasks").with_argument(DEAD_LETTER_ARG, json!("tasks.dead")))
            .unwrap();

        // Persist-first: the result is written even though the ack fails.
        broker.fail_acks(true);
        let delivery = deliver(&mut channel, json!({}), None);
        assert!(processor
            .process(&mut channel, &Publisher::default(), delivery)
            .is_err());
        let key = ResultKey::new("banner", &SubjectId::from(42));
        assert!(store.get(&key).unwrap().is_some());
        assert!(store.get(&ResultKey::new("gacha", &SubjectId::from(42))).unwrap().is_none());
        broker.fail_acks(false);

        // Two attempts, then the configured dead-letter queue.
        let first = deliver(&mut channel, json!({"fail": "deck empty"}), None);
        let outcome = processor
            .process(&mut channel, &Publisher::default(), first)
            .unwrap();
        assert_eq!(outcome, Outcome::Requeued);
        let second = channel
            .basic_get(&["tasks".to_string()], Duration::ZERO)
            .unwrap()
            .unwrap();
        let outcome = processor
            .process(&mut channel, &Publisher::default(), second)
            .unwrap();
        assert_eq!(outcome, Outcome::DeadLettered);
        assert_eq!(broker.messages("tasks.dead").len(), 1);
    }

    #[test]
    fn ack_ordering_parses_both_spellings() {
        assert_eq!("persist_first".parse::<AckOrdering>().unwrap(), AckOrdering::PersistFirst);
        assert_eq!("ACK-FIRST".parse::<AckOrdering>().unwrap(), AckOrdering::AckFirst);
        assert!("later".parse::<AckOrdering>().is_err());
    }
}
