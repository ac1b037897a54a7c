//! Built-in observers: structured logging, an activity ring buffer for
//! dashboards, and a fan-out composite.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use agentloom_core::error::LoomError;
use agentloom_core::traits::Observer;
use agentloom_core::types::{Task, TaskResult};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Logs every lifecycle event. The default observer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_task_queued(&self, task: &Task) {
        tracing::info!(task_id = %task.id, workspace = %task.workspace_id, "📥 Task queued: '{}'", task.title);
    }

    fn on_task_started(&self, task: &Task, worker_id: usize) {
        tracing::info!(task_id = %task.id, worker_id, attempt = task.attempts, "▶️ Task started: '{}'", task.title);
    }

    fn on_task_completed(&self, task: &Task, worker_id: usize, result: &TaskResult) {
        tracing::info!(task_id = %task.id, worker_id, "✅ Task completed: '{}': {}", task.title, result.summary);
    }

    fn on_task_failed(&self, task: &Task, worker_id: usize, error: &LoomError) {
        tracing::warn!(task_id = %task.id, worker_id, "❌ Task failed: '{}': {error}", task.title);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Queued,
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub kind: ActivityKind,
    pub task_id: String,
    pub workspace_id: String,
    pub title: String,
    pub worker_id: Option<usize>,
    /// Summary on completion, error text on failure.
    pub detail: Option<String>,
}

/// Bounded ring buffer of lifecycle events, newest last.
pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
    capacity: usize,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, kind: ActivityKind, task: &Task, worker_id: Option<usize>, detail: Option<String>) {
        let entry = ActivityEntry {
            at: Utc::now(),
            kind,
            task_id: task.id.clone(),
            workspace_id: task.workspace_id.clone(),
            title: task.title.clone(),
            worker_id,
            detail,
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.push_back(entry);
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The last `n` entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<ActivityEntry> {
        self.entries
            .lock()
            .map(|e| e.iter().rev().take(n).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(200)
    }
}

impl Observer for ActivityLog {
    fn on_task_queued(&self, task: &Task) {
        self.push(ActivityKind::Queued, task, None, None);
    }

    fn on_task_started(&self, task: &Task, worker_id: usize) {
        self.push(ActivityKind::Started, task, Some(worker_id), None);
    }

    fn on_task_completed(&self, task: &Task, worker_id: usize, result: &TaskResult) {
        self.push(ActivityKind::Completed, task, Some(worker_id), Some(result.summary.clone()));
    }

    fn on_task_failed(&self, task: &Task, worker_id: usize, error: &LoomError) {
        self.push(ActivityKind::Failed, task, Some(worker_id), Some(error.to_string()));
    }
}

/// Fans every event out to each inner observer in registration order.
#[derive(Default, Clone)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl Observer for CompositeObserver {
    fn on_task_queued(&self, task: &Task) {
        for o in &self.observers {
            o.on_task_queued(task);
        }
    }

    fn on_task_started(&self, task: &Task, worker_id: usize) {
        for o in &self.observers {
            o.on_task_started(task, worker_id);
        }
    }

    fn on_task_completed(&self, task: &Task, worker_id: usize, result: &TaskResult) {
        for o in &self.observers {
            o.on_task_completed(task, worker_id, result);
        }
    }

    fn on_task_failed(&self, task: &Task, worker_id: usize, error: &LoomError) {
        for o in &self.observers {
            o.on_task_failed(task, worker_id, error);
        }
    }
}
