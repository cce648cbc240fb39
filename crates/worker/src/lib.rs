//! `drawq-dlq`: drains a dead-letter queue and reports every dead task back to
//! its enqueuer (error result record plus an error reply when `reply_to` is set).

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use drawq_infra::broker::RedisConnector;
use drawq_infra::{
    DeadLetterProcessor, FailureReportingDrain, ProcessLifecycle, RedisResultStore, RunSummary,
    TaskHandler, TaskProcessor, WorkerConfig,
};
use drawq_messaging::{BrokerConfig, ConnectionManager};

/// Queue the drainer consumes: the configured dead-letter queue.
pub fn dead_letter_queue(config: &WorkerConfig) -> anyhow::Result<&str> {
    config
        .dead_letter_queue
        .as_deref()
        .context("DRAWQ_DEAD_LETTER_QUEUE must be set to run drawq-dlq")
}

/// Broker settings of the reply connection. It holds a consumer name of its
/// own, since a name belongs to one live channel at a time.
pub fn reply_broker_config(config: &WorkerConfig) -> BrokerConfig {
    let mut broker = config.broker.clone();
    broker.consumer_name = format!("{}-replies", broker.consumer_name);
    broker
}

fn open_result_store(config: &WorkerConfig) -> anyhow::Result<Arc<RedisResultStore>> {
    let store = RedisResultStore::new(&config.result_url, config.result_ttl)
        .context("failed to open result store")?;
    Ok(Arc::new(store))
}

/// Consume `config.queue` with `handler` until SIGINT/SIGTERM.
pub fn run_task_worker<H: TaskHandler>(config: &WorkerConfig, handler: H) -> anyhow::Result<RunSummary> {
    let store = open_result_store(config)?;
    let processor = TaskProcessor::from_config(config, handler, store);

    info!(
        queue = %config.queue,
        broker = %config.broker.redacted_url(),
        retry = ?config.retry.max_attempts,
        ack_ordering = %config.ack_ordering,
        "starting task worker"
    );

    let mut conn = ConnectionManager::new(RedisConnector::new(), config.broker.clone());
    let lifecycle = ProcessLifecycle::new(config.consume_timeout);
    Ok(lifecycle.start(&mut conn, &processor)?)
}

/// Consume the dead-letter queue until SIGINT/SIGTERM.
pub fn run_dead_letter_drain(config: &WorkerConfig) -> anyhow::Result<RunSummary> {
    let queue = dead_letter_queue(config)?;

    let store = open_result_store(config)?;
    // Replies go out on their own connection; the consuming channel belongs to the loop.
    let replies = ConnectionManager::new(RedisConnector::new(), reply_broker_config(config));
    let drain = FailureReportingDrain::new(config.result_prefix.clone(), store, replies);
    let processor = DeadLetterProcessor::new(queue, drain);

    info!(
        queue,
        broker = %config.broker.redacted_url(),
        result_prefix = %config.result_prefix,
        "starting dead-letter drain"
    );

    let mut conn = ConnectionManager::new(RedisConnector::new(), config.broker.clone());
    let lifecycle = ProcessLifecycle::new(config.consume_timeout);
    Ok(lifecycle.start(&mut conn, &processor)?)
}
