//! TaskStore trait — durable record of tasks and objectives.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Objective, ObjectiveRunOutcome, Task, TaskFilter, TaskStatus};

/// Durable storage for tasks and objectives.
///
/// Calls are synchronous and short; implementations guard their own state.
/// The engine never keeps a second copy of history: only queued and running
/// tasks live in memory.
pub trait TaskStore: Send + Sync {
    // ─── Tasks ──────────────────────────────────────────────

    /// Insert a new task. A task whose `run_key` is already taken is
    /// rejected with `LoomError::RunAlreadyQueued`.
    fn create_task(&self, task: &Task) -> Result<()>;

    /// Overwrite a task only if its persisted status is still `expected`.
    /// Returns `LoomError::Conflict` otherwise, so a transition never lands twice.
    fn update_task(&self, task: &Task, expected: TaskStatus) -> Result<()>;

    fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Newest first, filtered by workspace and/or status.
    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Tasks in `queued`, oldest first.
    fn list_queued_oldest(&self, limit: usize) -> Result<Vec<Task>>;

    /// Tasks in `running` whose `updated_at` is older than `older_than`.
    fn list_stale_running(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<Task>>;

    // ─── Objectives ─────────────────────────────────────────

    fn create_objective(&self, objective: &Objective) -> Result<()>;

    fn update_objective(&self, objective: &Objective) -> Result<()>;

    fn get_objective(&self, id: &str) -> Result<Option<Objective>>;

    fn list_objectives(&self, workspace_id: Option<&str>) -> Result<Vec<Objective>>;

    /// Returns false when no such objective existed.
    fn delete_objective(&self, id: &str) -> Result<bool>;

    /// `active = true AND next_run_at <= now`, oldest due first.
    fn list_due_objectives(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Objective>>;

    /// Active objectives in a workspace triggered by `event_key`.
    fn list_event_objectives(
        &self,
        workspace_id: &str,
        event_key: &str,
        limit: usize,
    ) -> Result<Vec<Objective>>;

    /// Atomically fold a finished run into an objective's counters and
    /// return the updated record.
    fn record_objective_run(&self, id: &str, outcome: &ObjectiveRunOutcome) -> Result<Objective>;
}
