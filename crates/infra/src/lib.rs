//! Infrastructure layer: Redis backends, result store, delivery processing, process lifecycle.

pub mod broker;
pub mod config;
pub mod lifecycle;
pub mod result_store;
pub mod worker;

mod integration_tests;

pub use config::{ConfigError, WorkerConfig};
pub use lifecycle::{LifecycleError, ProcessLifecycle, RunSummary, StopHandle};
pub use result_store::{InMemoryResultStore, ResultStore, ResultStoreError};
#[cfg(feature = "redis")]
pub use result_store::RedisResultStore;
pub use worker::{
    AckOrdering, DeadLetterDrain, DeadLetterProcessor, DeliveryProcessor, ErrorReporter,
    FailureReport, FailureReportingDrain, NoTransaction, Outcome, RetryPolicy, TaskHandler,
    TaskProcessor, TracingErrorReporter, TransactionScope, WorkerError,
};
