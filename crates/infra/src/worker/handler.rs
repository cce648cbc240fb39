//! Seams to the embedding application's business logic.

use serde_json::Value;

use drawq_core::{SubjectId, TaskContext, TaskKwargs};
use drawq_messaging::MessageProperties;

/// Business logic bound to one task queue.
///
/// Every error (and panic) coming out of `resolve` or `handle` is treated as
/// transient: the delivery is requeued.
pub trait TaskHandler {
    /// What `subject_id` refers to (a user, an account...).
    type Subject;

    /// Result key prefix, e.g. `"gacha"`.
    fn domain(&self) -> &str;

    fn resolve(&self, subject_id: &SubjectId) -> anyhow::Result<Self::Subject>;

    fn handle(
        &self,
        ctx: &TaskContext,
        subject: &mut Self::Subject,
        task_kwargs: &TaskKwargs,
    ) -> anyhow::Result<Value>;
}

/// Transactional boundary around one handler call.
///
/// Commit on `Ok`, roll back on `Err`: the processor does nothing else to
/// undo partial work.
pub trait TransactionScope {
    fn atomic(&self, work: &mut dyn FnMut() -> anyhow::Result<Value>) -> anyhow::Result<Value>;
}

/// Runs the work as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransaction;

impl TransactionScope for NoTransaction {
    fn atomic(&self, work: &mut dyn FnMut() -> anyhow::Result<Value>) -> anyhow::Result<Value> {
        work()
    }
}

/// Consumer of dead-lettered messages.
pub trait DeadLetterDrain {
    fn drain(&self, body: &Value, properties: &MessageProperties) -> anyhow::Result<()>;
}

impl<F> DeadLetterDrain for F
where
    F: Fn(&Value, &MessageProperties) -> anyhow::Result<()>,
{
    fn drain(&self, body: &Value, properties: &MessageProperties) -> anyhow::Result<()> {
        self(body, properties)
    }
}
