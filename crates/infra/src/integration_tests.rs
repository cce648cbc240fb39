//! Integration tests for the full worker pipeline.
//!
//! Tests: Publisher → InMemoryBroker → ProcessLifecycle → TaskProcessor → ResultStore / reply
//!
//! Verifies:
//! - Success acks once, writes one result and publishes one reply
//! - Failure requeues without ack, write or reply, and reports the error
//! - Bounded retries end in the dead-letter queue, which the drain reports back
//! - Stopping never interrupts the delivery in flight

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::anyhow;
    use serde_json::{Value, json};

    use drawq_core::{
        Reply, ResultKey, ResultRecord, ResultStatus, SubjectId, TaskBody, TaskContext, TaskKwargs,
    };
    use drawq_messaging::{
        BrokerConfig, ConnectionManager, InMemoryBroker, MessageProperties, QueueArguments,
        WireFormat,
    };

    use crate::lifecycle::{ProcessLifecycle, StopHandle};
    use crate::result_store::{InMemoryResultStore, ResultStore};
    use crate::worker::{
        DeadLetterDrain, DeadLetterProcessor, DeliveryProcessor, FailureReportingDrain,
        RecordingErrorReporter, RetryPolicy, TaskHandler, TaskProcessor,
    };

    const QUEUE: &str = "gacha.draw";
    const DEAD: &str = "gacha.draw.dead";
    const REPLY: &str = "reply.42";

    /// Draw handler with a fixed outcome; stops the loop after `stop_after` calls.
    struct Gacha {
        outcome: Result<Value, String>,
        calls: Cell<u32>,
        stop: StopHandle,
        stop_after: u32,
    }

    impl Gacha {
        fn new(outcome: Result<Value, &str>, stop: StopHandle, stop_after: u32) -> Self {
            Self {
                outcome: outcome.map_err(str::to_string),
                calls: Cell::new(0),
                stop,
                stop_after,
            }
        }
    }

    impl TaskHandler for Gacha {
        type Subject = SubjectId;

        fn domain(&self) -> &str {
            "gacha"
        }

        fn resolve(&self, subject_id: &SubjectId) -> anyhow::Result<SubjectId> {
            Ok(subject_id.clone())
        }

        fn handle(
            &self,
            _ctx: &TaskContext,
            _subject: &mut SubjectId,
            task_kwargs: &TaskKwargs,
        ) -> anyhow::Result<Value> {
            assert_eq!(task_kwargs["deck_id"], json!("fire"));
            self.calls.set(self.calls.get() + 1);
            if self.calls.get() >= self.stop_after {
                self.stop.stop();
            }
            self.outcome.clone().map_err(|e| anyhow!(e))
        }
    }

    fn draw_request() -> TaskBody {
        let kwargs = json!({"deck_id": "fire"});
        TaskBody::new(42, kwargs.as_object().cloned().unwrap_or_default())
    }

    fn connect(broker: &InMemoryBroker) -> ConnectionManager<InMemoryBroker> {
        ConnectionManager::new(broker.clone(), BrokerConfig::default())
    }

    /// Declare queues the way the worker will, then enqueue `count` draw requests.
    fn enqueue<P: DeliveryProcessor>(broker: &InMemoryBroker, processor: &P, reply_to: Option<&str>, count: usize) {
        let mut producer = connect(broker);
        producer
            .declare_queue(REPLY, true, false, QueueArguments::new())
            .unwrap();
        if let Some(dlq) = processor.dead_letter_queue() {
            producer
                .declare_queue(dlq, true, false, QueueArguments::new())
                .unwrap();
        }
        producer
            .declare_queue(QUEUE, true, false, processor.queue_arguments())
            .unwrap();
        for _ in 0..count {
            producer
                .publish(&draw_request(), QUEUE, reply_to, MessageProperties::new())
                .unwrap();
        }
    }

    fn lifecycle() -> ProcessLifecycle {
        ProcessLifecycle::new(Duration::from_millis(10))
    }

    #[test]
    fn successful_draw_acks_stores_and_replies_once() {
        let broker = InMemoryBroker::new();
        let store = InMemoryResultStore::arc();
        let lifecycle = lifecycle();
        let handler = Gacha::new(Ok(json!({"card_id": 7})), lifecycle.stop_handle(), 1);
        let processor = TaskProcessor::new(QUEUE, handler, Arc::clone(&store));
        enqueue(&broker, &processor, Some(REPLY), 1);

        let summary = lifecycle.run(&mut connect(&broker), &processor).unwrap();

        assert_eq!(summary.acked, 1);
        assert_eq!(broker.stats().acked, 1);

        let key = ResultKey::new("gacha", &SubjectId::from(42));
        assert_eq!(key.as_str(), "gacha:42:result");
        assert_eq!(
            store.get(&key).unwrap(),
            Some(ResultRecord::success(json!({"card_id": 7})))
        );
        assert_eq!(store.write_count(), 1);

        let replies = broker.messages(REPLY);
        assert_eq!(replies.len(), 1);
        let reply: Reply = WireFormat::Bson.decode(&replies[0].body).unwrap();
        assert_eq!(reply, Reply::success(json!({"card_id": 7})));
    }

    #[test]
    fn no_reply_to_means_no_reply() {
        let broker = InMemoryBroker::new();
        let store = InMemoryResultStore::arc();
        let lifecycle = lifecycle();
        let handler = Gacha::new(Ok(json!({"card_id": 7})), lifecycle.stop_handle(), 1);
        let processor = TaskProcessor::new(QUEUE, handler, Arc::clone(&store));
        enqueue(&broker, &processor, None, 1);

        lifecycle.run(&mut connect(&broker), &processor).unwrap();

        assert!(broker.messages(REPLY).is_empty());
        // Only the request itself was published.
        assert_eq!(broker.stats().published, 1);
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn failed_draw_is_requeued_and_reported() {
        let broker = InMemoryBroker::new();
        let store = InMemoryResultStore::arc();
        let reporter = RecordingErrorReporter::new();
        let lifecycle = lifecycle();
        let handler = Gacha::new(Err("deck empty"), lifecycle.stop_handle(), 1);
        let processor = TaskProcessor::new(QUEUE, handler, Arc::clone(&store))
            .with_reporter(reporter.clone());
        enqueue(&broker, &processor, Some(REPLY), 1);

        let summary = lifecycle.run(&mut connect(&broker), &processor).unwrap();

        assert_eq!(summary.requeued, 1);
        let stats = broker.stats();
        assert_eq!(stats.acked, 0);
        assert_eq!(stats.requeued, 1);
        assert_eq!(store.write_count(), 0);
        assert!(broker.messages(REPLY).is_empty());
        assert_eq!(broker.ready_count(QUEUE), 1);

        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].subject_id.as_deref(), Some("42"));
        assert!(reports[0].error.contains("deck empty"));
        assert_eq!(reports[0].body["subject_id"], json!(42));
        assert_eq!(reports[0].properties.reply_to.as_deref(), Some(REPLY));
    }

    #[test]
    fn stop_mid_flight_completes_the_current_delivery() {
        let broker = InMemoryBroker::new();
        let store = InMemoryResultStore::arc();
        let lifecycle = lifecycle();
        // The handler asks to stop while it is running.
        let handler = Gacha::new(Ok(json!({"card_id": 7})), lifecycle.stop_handle(), 1);
        let processor = TaskProcessor::new(QUEUE, handler, Arc::clone(&store));
        enqueue(&broker, &processor, Some(REPLY), 2);

        let summary = lifecycle.run(&mut connect(&broker), &processor).unwrap();

        assert_eq!(summary.processed(), 1);
        assert_eq!(broker.stats().acked, 1);
        assert_eq!(store.write_count(), 1);
        assert_eq!(broker.messages(REPLY).len(), 1);
        assert_eq!(broker.ready_count(QUEUE), 1);
    }

    #[test]
    fn exhausted_draw_is_dead_lettered_and_reported_back() {
        let broker = InMemoryBroker::new();
        let store = InMemoryResultStore::arc();
        let worker = lifecycle();
        let handler = Gacha::new(Err("deck empty"), worker.stop_handle(), 3);
        let processor = TaskProcessor::new(QUEUE, handler, Arc::clone(&store))
            .with_reporter(RecordingErrorReporter::new())
            .with_dead_letter_queue(DEAD)
            .with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO));
        enqueue(&broker, &processor, Some(REPLY), 1);

        let summary = worker.run(&mut connect(&broker), &processor).unwrap();

        assert_eq!(summary.requeued, 2);
        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(broker.ready_count(QUEUE), 0);
        assert_eq!(broker.messages(DEAD).len(), 1);
        assert!(broker.messages(REPLY).is_empty());

        // Drain the dead-letter queue: the requester learns about the failure.
        let drainer = lifecycle();
        let stop = drainer.stop_handle();
        let drain = FailureReportingDrain::new("gacha", Arc::clone(&store), connect(&broker));
        let dlq = DeadLetterProcessor::new(DEAD, move |body: &Value, props: &MessageProperties| -> anyhow::Result<()> {
            let result = drain.drain(body, props);
            stop.stop();
            result
        });

        let summary = drainer.run(&mut connect(&broker), &dlq).unwrap();

        assert_eq!(summary.acked, 1);
        let record = store
            .get(&ResultKey::new("gacha", &SubjectId::from(42)))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ResultStatus::Error);
        assert_eq!(record.payload["attempts"], json!(3));

        let replies = broker.messages(REPLY);
        assert_eq!(replies.len(), 1);
        let reply: Reply = WireFormat::Bson.decode(&replies[0].body).unwrap();
        assert_eq!(reply.status, ResultStatus::Error);
    }

    #[test]
    fn malformed_request_is_rejected_once() {
        let broker = InMemoryBroker::new();
        let reporter = RecordingErrorReporter::new();
        let lifecycle = lifecycle();
        let handler = Gacha::new(Ok(json!(null)), lifecycle.stop_handle(), 1);
        let processor = TaskProcessor::new(QUEUE, handler, InMemoryResultStore::new())
            .with_reporter(reporter.clone());
        enqueue(&broker, &processor, None, 0);

        let mut producer = connect(&broker);
        let (channel, publisher) = producer.parts().unwrap();
        publisher
            .publish_raw(channel, QUEUE, b"\x05\x00\x00\x00garbage".to_vec(), MessageProperties::new())
            .unwrap();

        let stopper = lifecycle.stop_handle();
        let watcher = std::thread::spawn({
            let reporter = reporter.clone();
            move || {
                while reporter.is_empty() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                stopper.stop();
            }
        });

        let summary = lifecycle.run(&mut connect(&broker), &processor).unwrap();
        watcher.join().unwrap();

        assert_eq!(summary.rejected, 1);
        assert_eq!(broker.stats().requeued, 0);
        assert_eq!(broker.ready_count(QUEUE), 0);
        assert_eq!(processor.handler().calls.get(), 0);
    }
}
