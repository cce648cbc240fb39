//! `drawq-core`: data model shared by the draw worker pipeline.
//!
//! This crate contains **pure data** primitives (no broker, no storage, no IO):
//! the task request body, the explicit per-task context handed to business
//! logic, and the result/reply records written back to the requester.

pub mod error;
pub mod id;
pub mod result;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::SubjectId;
pub use result::{Reply, ResultKey, ResultRecord, ResultStatus};
pub use task::{LogContext, TaskBody, TaskContext, TaskKwargs};
