//! Task lifecycle manager — persisted state transitions.
//!
//! Every transition is computed on a copy, written through the store with the
//! status the caller expects to overwrite, and only then handed back. A failed
//! write leaves the caller holding the previous record, so memory never runs
//! ahead of durable state.

use std::sync::Arc;

use agentloom_core::error::{LoomError, Result};
use agentloom_core::traits::TaskStore;
use agentloom_core::types::{Task, TaskDraft, TaskResult, TaskStatus};
use chrono::{DateTime, Utc};

/// Message prefix for tasks failed by stale recovery.
pub const RECOVERED_PREFIX: &str = "recovered after interruption";

#[derive(Clone)]
pub struct TaskLifecycle {
    store: Arc<dyn TaskStore>,
}

impl TaskLifecycle {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// `queued → running`, persisted before the executor is invoked.
    pub fn begin(&self, task: &Task, worker_id: usize, now: DateTime<Utc>) -> Result<Task> {
        let next = task.started(worker_id, now)?;
        self.store.update_task(&next, TaskStatus::Queued)?;
        Ok(next)
    }

    /// `running → succeeded`.
    pub fn complete(&self, task: &Task, result: &TaskResult, now: DateTime<Utc>) -> Result<Task> {
        let next = task.succeeded(result, now)?;
        self.store.update_task(&next, TaskStatus::Running)?;
        Ok(next)
    }

    /// `running → failed`.
    pub fn fail(&self, task: &Task, message: &str, now: DateTime<Utc>) -> Result<Task> {
        let next = task.failed(message, now)?;
        self.store.update_task(&next, TaskStatus::Running)?;
        Ok(next)
    }

    /// Fail an orphaned `running` task. The guarded write makes a second
    /// recovery of the same task return `Conflict` instead of transitioning.
    pub fn recover(&self, task: &Task, stale_for: chrono::Duration, now: DateTime<Utc>) -> Result<Task> {
        let message = format!(
            "{RECOVERED_PREFIX}: no progress for {}s (attempt {})",
            stale_for.num_seconds().max(0),
            task.attempts
        );
        self.fail(task, &message, now)
    }

    /// Build the retry draft for a failed task. The original is only read.
    pub fn retry_draft(&self, task_id: &str) -> Result<TaskDraft> {
        let original = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| LoomError::TaskNotFound(task_id.to_string()))?;
        original.retry_draft()
    }
}
