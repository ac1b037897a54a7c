//! Data model shared by the engine, stores, and collaborators.

pub mod objective;
pub mod task;

pub use objective::{Objective, ObjectiveDraft, ObjectiveRunOutcome, TriggerType};
pub use task::{Task, TaskDraft, TaskFilter, TaskKind, TaskOrigin, TaskResult, TaskStatus};

/// Generate a prefixed unique id, e.g. `task-3f2a...`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}
