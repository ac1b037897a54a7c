//! Error taxonomy for the orchestration engine.

use thiserror::Error;

/// Errors surfaced by the engine and its collaborators.
#[derive(Debug, Error)]
pub enum LoomError {
    /// The in-memory queue is at its configured capacity.
    #[error("task queue is full")]
    QueueFull,

    #[error("invalid task: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("objective not found: {0}")]
    ObjectiveNotFound(String),

    #[error("task {id} is {status}; only failed tasks can be retried")]
    NotRetryable { id: String, status: String },

    #[error("invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// The persisted row no longer matches what the caller expected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A task for this run key already exists.
    #[error("run already queued: {0}")]
    RunAlreadyQueued(String),

    #[error("invalid trigger: {0}")]
    Trigger(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("execution cancelled: runtime shutting down")]
    Cancelled,

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoomError {
    pub fn is_queue_full(&self) -> bool {
        matches!(self, LoomError::QueueFull)
    }

    /// Producer-visible errors are returned synchronously from `enqueue`.
    pub fn is_rejection(&self) -> bool {
        matches!(self, LoomError::QueueFull | LoomError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, LoomError>;
