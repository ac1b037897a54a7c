//! Executor trait — performs the actual agent/tool work for a task.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Task, TaskResult};

/// The backend that runs a task (LLM calls, sandboxed commands, approvals).
///
/// The engine treats `execute` as an opaque call. Timeouts belong to the
/// executor; the engine only races it against its own cancellation signal.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, task: &Task) -> Result<TaskResult>;
}
