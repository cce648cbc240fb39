//! Operational error channel.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tracing::error;

use drawq_messaging::{MessageProperties, WireFormat};

/// Log target of failure reports.
pub const ERROR_TARGET: &str = "drawq::errors";

/// What happened to the delivery after the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    Requeued,
    DeadLettered,
    Rejected,
    LeftUnacked,
}

impl FailureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureAction::Requeued => "requeued",
            FailureAction::DeadLettered => "dead_lettered",
            FailureAction::Rejected => "rejected",
            FailureAction::LeftUnacked => "left_unacked",
        }
    }
}

/// One processing failure, with enough context to replay it by hand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub queue: String,
    /// Absent when the body could not be decoded.
    pub subject_id: Option<String>,
    /// Error chain, `outer: inner: root`.
    pub error: String,
    /// Debug rendering of the error: chain plus backtrace when one was captured.
    pub detail: String,
    pub body: Value,
    pub properties: MessageProperties,
    pub attempt: u32,
    pub action: FailureAction,
}

impl FailureReport {
    pub fn new(
        queue: impl Into<String>,
        err: &anyhow::Error,
        body: Value,
        properties: MessageProperties,
        attempt: u32,
        action: FailureAction,
    ) -> Self {
        Self {
            queue: queue.into(),
            subject_id: None,
            error: format!("{err:#}"),
            detail: format!("{err:?}"),
            body,
            properties,
            attempt,
            action,
        }
    }

    pub fn with_subject(mut self, subject_id: impl ToString) -> Self {
        self.subject_id = Some(subject_id.to_string());
        self
    }
}

/// Best-effort readable rendering of a raw body for a report.
pub fn body_for_report(format: WireFormat, bytes: &[u8]) -> Value {
    format
        .decode::<Value>(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Sink for [`FailureReport`]s.
pub trait ErrorReporter {
    fn report(&self, report: &FailureReport);
}

/// Emits one `error!` event per failure on target [`ERROR_TARGET`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, report: &FailureReport) {
        let properties = serde_json::to_string(&report.properties).unwrap_or_default();
        error!(
            target: ERROR_TARGET,
            queue = %report.queue,
            subject_id = report.subject_id.as_deref().unwrap_or("-"),
            attempt = report.attempt,
            action = report.action.as_str(),
            body = %report.body,
            properties = %properties,
            detail = %report.detail,
            "task failed: {}",
            report.error
        );
    }
}

/// Keeps reports in memory; clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct RecordingErrorReporter {
    reports: Arc<Mutex<Vec<FailureReport>>>,
}

impl RecordingErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<FailureReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorReporter for RecordingErrorReporter {
    fn report(&self, report: &FailureReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
    }
}

impl<R> ErrorReporter for Arc<R>
where
    R: ErrorReporter + ?Sized,
{
    fn report(&self, report: &FailureReport) {
        (**self).report(report)
    }
}
