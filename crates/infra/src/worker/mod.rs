//! Delivery processing: task handling, dead-letter draining, retries, error reporting.

pub mod dead_letter;
pub mod handler;
pub mod processor;
pub mod reporter;
pub mod retry;

pub use dead_letter::{DeadLetterProcessor, FailureReportingDrain};
pub use handler::{DeadLetterDrain, NoTransaction, TaskHandler, TransactionScope};
pub use processor::{AckOrdering, DeliveryProcessor, Outcome, TaskProcessor, WorkerError};
pub use reporter::{
    ERROR_TARGET, ErrorReporter, FailureAction, FailureReport, RecordingErrorReporter,
    TracingErrorReporter,
};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
