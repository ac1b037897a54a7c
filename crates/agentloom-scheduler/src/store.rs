//! In-memory task store — tests and `--ephemeral` runs.
//! Nothing survives a restart; semantics match the SQLite store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use agentloom_core::error::{LoomError, Result};
use agentloom_core::traits::TaskStore;
use agentloom_core::types::{
    Objective, ObjectiveRunOutcome, Task, TaskFilter, TaskStatus, TriggerType,
};
use chrono::{DateTime, Utc};

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<String, Task>,
    objectives: HashMap<String, Objective>,
}

/// `Mutex`-guarded maps implementing [`TaskStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| LoomError::Persistence(format!("memory store poisoned: {e}")))
    }

    pub fn task_count(&self) -> usize {
        self.lock().map(|s| s.tasks.len()).unwrap_or(0)
    }
}

impl TaskStore for MemoryStore {
    fn create_task(&self, task: &Task) -> Result<()> {
        let mut state = self.lock()?;
        if state.tasks.contains_key(&task.id) {
            return Err(LoomError::Conflict(format!("task {} already exists", task.id)));
        }
        if let Some(key) = task.run_key.as_deref() {
            if state.tasks.values().any(|t| t.run_key.as_deref() == Some(key)) {
                return Err(LoomError::RunAlreadyQueued(key.to_string()));
            }
        }
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn update_task(&self, task: &Task, expected: TaskStatus) -> Result<()> {
        let mut state = self.lock()?;
        let current = state
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| LoomError::TaskNotFound(task.id.clone()))?;
        if current.status != expected {
            return Err(LoomError::Conflict(format!(
                "task {} is {}, expected {}",
                task.id, current.status, expected
            )));
        }
        *current = task.clone();
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.lock()?.tasks.get(id).cloned())
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let state = self.lock()?;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        tasks.truncate(filter.effective_limit());
        Ok(tasks)
    }

    fn list_queued_oldest(&self, limit: usize) -> Result<Vec<Task>> {
        let state = self.lock()?;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks.truncate(limit);
        Ok(tasks)
    }

    fn list_stale_running(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let state = self.lock()?;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running && t.updated_at < older_than)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        tasks.truncate(limit);
        Ok(tasks)
    }

    fn create_objective(&self, objective: &Objective) -> Result<()> {
        let mut state = self.lock()?;
        if state.objectives.contains_key(&objective.id) {
            return Err(LoomError::Conflict(format!(
                "objective {} already exists",
                objective.id
            )));
        }
        state.objectives.insert(objective.id.clone(), objective.clone());
        Ok(())
    }

    fn update_objective(&self, objective: &Objective) -> Result<()> {
        let mut state = self.lock()?;
        match state.objectives.get_mut(&objective.id) {
            Some(current) => {
                *current = objective.clone();
                Ok(())
            }
            None => Err(LoomError::ObjectiveNotFound(objective.id.clone())),
        }
    }

    fn get_objective(&self, id: &str) -> Result<Option<Objective>> {
        Ok(self.lock()?.objectives.get(id).cloned())
    }

    fn list_objectives(&self, workspace_id: Option<&str>) -> Result<Vec<Objective>> {
        let state = self.lock()?;
        let mut objectives: Vec<Objective> = state
            .objectives
            .values()
            .filter(|o| workspace_id.is_none_or(|ws| ws == o.workspace_id))
            .cloned()
            .collect();
        objectives.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(objectives)
    }

    fn delete_objective(&self, id: &str) -> Result<bool> {
        Ok(self.lock()?.objectives.remove(id).is_some())
    }

    fn list_due_objectives(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Objective>> {
        let state = self.lock()?;
        let mut due: Vec<Objective> = state
            .objectives
            .values()
            .filter(|o| o.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    fn list_event_objectives(
        &self,
        workspace_id: &str,
        event_key: &str,
        limit: usize,
    ) -> Result<Vec<Objective>> {
        let state = self.lock()?;
        let mut matched: Vec<Objective> = state
            .objectives
            .values()
            .filter(|o| {
                o.active
                    && o.workspace_id == workspace_id
                    && matches!(&o.trigger, TriggerType::Event { key } if key == event_key)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        matched.truncate(limit);
        Ok(matched)
    }

    fn record_objective_run(&self, id: &str, outcome: &ObjectiveRunOutcome) -> Result<Objective> {
        let mut state = self.lock()?;
        let objective = state
            .objectives
            .get_mut(id)
            .ok_or_else(|| LoomError::ObjectiveNotFound(id.to_string()))?;
        objective.apply_run_outcome(outcome);
        Ok(objective.clone())
    }
}
