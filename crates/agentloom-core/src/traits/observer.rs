//! Observer trait — side-effect sink for task lifecycle events.

use crate::error::LoomError;
use crate::types::{Task, TaskResult};

/// Notified of lifecycle events for UI and telemetry.
///
/// Hooks return nothing: an observer cannot influence task processing.
/// Every method defaults to a no-op so sinks only implement what they need.
pub trait Observer: Send + Sync {
    fn on_task_queued(&self, _task: &Task) {}

    fn on_task_started(&self, _task: &Task, _worker_id: usize) {}

    fn on_task_completed(&self, _task: &Task, _worker_id: usize, _result: &TaskResult) {}

    fn on_task_failed(&self, _task: &Task, _worker_id: usize, _error: &LoomError) {}
}
