//! Store wrappers shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use agentloom_core::error::{LoomError, Result};
use agentloom_core::traits::TaskStore;
use agentloom_core::types::{Objective, ObjectiveRunOutcome, Task, TaskFilter, TaskStatus};
use chrono::{DateTime, Utc};

use crate::store::MemoryStore;

/// Delegates to a [`MemoryStore`] but refuses selected writes.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    /// Task updates moving into this status fail.
    pub fail_on: Option<TaskStatus>,
    /// Number of upcoming `update_objective` calls that fail.
    pub objective_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn failing_on(status: TaskStatus) -> Self {
        Self {
            fail_on: Some(status),
            ..Default::default()
        }
    }

    pub fn fail_next_objective_updates(&self, n: usize) {
        self.objective_failures.store(n, Ordering::SeqCst);
    }
}

impl TaskStore for FlakyStore {
    fn create_task(&self, task: &Task) -> Result<()> {
        self.inner.create_task(task)
    }

    fn update_task(&self, task: &Task, expected: TaskStatus) -> Result<()> {
        if self.fail_on == Some(task.status) {
            return Err(LoomError::Persistence("disk I/O error".into()));
        }
        self.inner.update_task(task, expected)
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.inner.get_task(id)
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.inner.list_tasks(filter)
    }

    fn list_queued_oldest(&self, limit: usize) -> Result<Vec<Task>> {
        self.inner.list_queued_oldest(limit)
    }

    fn list_stale_running(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        self.inner.list_stale_running(older_than, limit)
    }

    fn create_objective(&self, objective: &Objective) -> Result<()> {
        self.inner.create_objective(objective)
    }

    fn update_objective(&self, objective: &Objective) -> Result<()> {
        let armed = self
            .objective_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(LoomError::Persistence("database is locked".into()));
        }
        self.inner.update_objective(objective)
    }

    fn get_objective(&self, id: &str) -> Result<Option<Objective>> {
        self.inner.get_objective(id)
    }

    fn list_objectives(&self, workspace_id: Option<&str>) -> Result<Vec<Objective>> {
        self.inner.list_objectives(workspace_id)
    }

    fn delete_objective(&self, id: &str) -> Result<bool> {
        self.inner.delete_objective(id)
    }

    fn list_due_objectives(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Objective>> {
        self.inner.list_due_objectives(now, limit)
    }

    fn list_event_objectives(
        &self,
        workspace_id: &str,
        event_key: &str,
        limit: usize,
    ) -> Result<Vec<Objective>> {
        self.inner.list_event_objectives(workspace_id, event_key, limit)
    }

    fn record_objective_run(&self, id: &str, outcome: &ObjectiveRunOutcome) -> Result<Objective> {
        self.inner.record_objective_run(id, outcome)
    }
}
