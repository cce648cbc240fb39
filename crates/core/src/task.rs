//! Task request body and the explicit per-task context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::SubjectId;

/// Keyword arguments forwarded verbatim to the business-logic handler.
pub type TaskKwargs = Map<String, Value>;

/// Body of a "run a draw" request as it travels through the work queue.
///
/// `logging_kwargs` may be missing or `null`; both mean "no logging context".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBody {
    pub subject_id: SubjectId,
    #[serde(default)]
    pub task_kwargs: TaskKwargs,
    #[serde(default)]
    pub logging_kwargs: Option<Map<String, Value>>,
}

impl TaskBody {
    pub fn new(subject_id: impl Into<SubjectId>, task_kwargs: TaskKwargs) -> Self {
        Self {
            subject_id: subject_id.into(),
            task_kwargs,
            logging_kwargs: None,
        }
    }

    pub fn with_logging(mut self, logging_kwargs: Map<String, Value>) -> Self {
        self.logging_kwargs = Some(logging_kwargs);
        self
    }

    pub fn log_context(&self) -> LogContext {
        LogContext::from_kwargs(self.logging_kwargs.as_ref())
    }
}

/// Structured logging fields attached to everything a task logs.
///
/// Built from the request's `logging_kwargs` and passed explicitly to the
/// handler; an empty context produces a disabled span.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogContext {
    fields: BTreeMap<String, Value>,
}

impl LogContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_kwargs(kwargs: Option<&Map<String, Value>>) -> Self {
        let fields = kwargs
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Span carrying the context, or `Span::none()` when there is nothing to log.
    pub fn span(&self) -> tracing::Span {
        if self.fields.is_empty() {
            return tracing::Span::none();
        }
        tracing::info_span!("log_context", fields = %self)
    }
}

impl core::fmt::Display for LogContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut first = true;
        for (k, v) in &self.fields {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match v {
                Value::String(s) => write!(f, "{k}={s}")?,
                other => write!(f, "{k}={other}")?,
            }
        }
        Ok(())
    }
}

/// Everything a handler may know about the delivery it is running for.
#[derive(Debug, Clone)]
pub struct TaskContext {
    subject_id: SubjectId,
    attempt: u32,
    correlation_id: Option<String>,
    log: LogContext,
}

impl TaskContext {
    pub fn new(
        subject_id: SubjectId,
        attempt: u32,
        correlation_id: Option<String>,
        log: LogContext,
    ) -> Self {
        Self {
            subject_id,
            attempt,
            correlation_id,
            log,
        }
    }

    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    /// 1-based attempt number (1 on first delivery).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn log(&self) -> &LogContext {
        &self.log
    }
}
