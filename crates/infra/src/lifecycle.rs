//! Worker process loop: consume until stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use drawq_messaging::{
    ConnectionManager, Connector, Consumed, ConsumerLoop, DEFAULT_CONSUME_TIMEOUT, QueueArguments,
};

use crate::worker::{DeliveryProcessor, Outcome, WorkerError};

/// Cooperative stop flag; clones share it.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to exit after the delivery it is working on.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub rejected: u64,
    pub left_unacked: u64,
    pub timeouts: u64,
}

impl RunSummary {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Acked => self.acked += 1,
            Outcome::Requeued => self.requeued += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
            Outcome::Rejected => self.rejected += 1,
            Outcome::LeftUnacked => self.left_unacked += 1,
        }
    }

    /// Deliveries handled, whatever their outcome.
    pub fn processed(&self) -> u64 {
        self.acked + self.requeued + self.dead_lettered + self.rejected + self.left_unacked
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to install signal handlers: {0}")]
    Signals(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Runs one processor against one queue until stopped.
///
/// Single-threaded: one delivery at a time, the stop flag is looked at
/// between deliveries (and after every consume timeout), never mid-delivery.
#[derive(Debug, Clone)]
pub struct ProcessLifecycle {
    stop: StopHandle,
    consume_timeout: Duration,
}

impl Default for ProcessLifecycle {
    fn default() -> Self {
        Self::new(DEFAULT_CONSUME_TIMEOUT)
    }
}

impl ProcessLifecycle {
    pub fn new(consume_timeout: Duration) -> Self {
        Self {
            stop: StopHandle::new(),
            consume_timeout,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Install SIGINT/SIGTERM handlers, then [`ProcessLifecycle::run`].
    pub fn start<C, P>(
        &self,
        conn: &mut ConnectionManager<C>,
        processor: &P,
    ) -> Result<RunSummary, LifecycleError>
    where
        C: Connector,
        P: DeliveryProcessor,
    {
        install_signal_handlers(self.stop.clone())?;
        Ok(self.run(conn, processor)?)
    }

    /// Declare the processor's queues and consume until the stop flag is set.
    ///
    /// Any `Err` is fatal; it has already been logged.
    pub fn run<C, P>(
        &self,
        conn: &mut ConnectionManager<C>,
        processor: &P,
    ) -> Result<RunSummary, WorkerError>
    where
        C: Connector,
        P: DeliveryProcessor,
    {
        let queue = processor.queue().to_string();
        let result = self.consume(conn, processor);
        match &result {
            Ok(summary) => info!(
                queue = %queue,
                processed = summary.processed(),
                acked = summary.acked,
                requeued = summary.requeued,
                "worker stopped"
            ),
            Err(err) => error!(queue = %queue, error = %err, "worker terminated"),
        }
        result
    }

    fn consume<C, P>(
        &self,
        conn: &mut ConnectionManager<C>,
        processor: &P,
    ) -> Result<RunSummary, WorkerError>
    where
        C: Connector,
        P: DeliveryProcessor,
    {
        processor.validate()?;

        if let Some(dlq) = processor.dead_letter_queue() {
            conn.declare_queue(dlq, true, false, QueueArguments::new())?;
        }
        conn.declare_queue(processor.queue(), true, false, processor.queue_arguments())?;

        let consumer = ConsumerLoop::single(processor.queue(), self.consume_timeout);
        info!(
            queue = %processor.queue(),
            timeout_ms = self.consume_timeout.as_millis() as u64,
            "worker started"
        );

        let mut summary = RunSummary::default();
        while !self.stop.is_stopped() {
            let (channel, publisher) = conn.parts()?;
            let consumed = consumer.run_once(channel, |channel, delivery| {
                processor.process(channel, &publisher, delivery)
            })?;
            match consumed {
                Consumed::Delivery(outcome) => summary.record(outcome),
                Consumed::Timeout => summary.timeouts += 1,
            }
        }
        Ok(summary)
    }
}

fn install_signal_handlers(stop: StopHandle) -> Result<(), LifecycleError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| LifecycleError::Signals(e.to_string()))?;

    let signals = {
        let _guard = runtime.enter();
        ShutdownSignals::register()?
    };

    thread::Builder::new()
        .name("drawq-signals".to_string())
        .spawn(move || {
            let signal = runtime.block_on(signals.recv());
            info!(signal, "shutdown requested, finishing in-flight delivery");
            stop.stop();
        })
        .map_err(|e| LifecycleError::Signals(e.to_string()))?;
    Ok(())
}

#[cfg(unix)]
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn register() -> Result<Self, LifecycleError> {
        use tokio::signal::unix::{SignalKind, signal};

        let interrupt =
            signal(SignalKind::interrupt()).map_err(|e| LifecycleError::Signals(e.to_string()))?;
        let terminate =
            signal(SignalKind::terminate()).map_err(|e| LifecycleError::Signals(e.to_string()))?;
        Ok(Self {
            interrupt,
            terminate,
        })
    }

    async fn recv(mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn register() -> Result<Self, LifecycleError> {
        Ok(Self)
    }

    async fn recv(self) -> &'static str {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}
