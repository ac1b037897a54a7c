//! Task definitions — a single unit of agent work and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LoomError, Result};

/// What kind of work a task carries. Producers that leave it unset get `General`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    General,
    Objective,
    ReindexMarkdown,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::General => "general",
            TaskKind::Objective => "objective",
            TaskKind::ReindexMarkdown => "reindex_markdown",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "general" => Ok(TaskKind::General),
            "objective" => Ok(TaskKind::Objective),
            "reindex_markdown" | "reindex" => Ok(TaskKind::ReindexMarkdown),
            other => Err(LoomError::Validation(format!("unknown task kind '{other}'"))),
        }
    }
}

/// Task status. Moves forward only: queued → running → succeeded | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Succeeded)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(LoomError::Validation(format!("unknown task status '{other}'"))),
        }
    }
}

/// The channel/user a task originated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOrigin {
    /// Connector name, e.g. "telegram", "discord", "imap".
    pub connector: String,
    /// Connector-specific conversation id (chat id, channel id, address).
    pub external_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Producer input for `enqueue`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDraft {
    pub workspace_id: String,
    pub context_id: String,
    #[serde(default)]
    pub kind: Option<TaskKind>,
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub origin: Option<TaskOrigin>,
    #[serde(default)]
    pub objective_id: Option<String>,
    #[serde(default)]
    pub retry_of_task_id: Option<String>,
    /// Idempotency key; at most one task per key is ever stored.
    #[serde(default)]
    pub run_key: Option<String>,
}

impl TaskDraft {
    pub fn new(workspace_id: &str, context_id: &str, title: &str, prompt: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            context_id: context_id.to_string(),
            title: title.to_string(),
            prompt: prompt.to_string(),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_origin(mut self, origin: TaskOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_run_key(mut self, run_key: impl Into<String>) -> Self {
        self.run_key = Some(run_key.into());
        self
    }

    /// Reject drafts missing any required field. Nothing is enqueued on failure.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("workspace_id", &self.workspace_id),
            ("context_id", &self.context_id),
            ("title", &self.title),
            ("prompt", &self.prompt),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(LoomError::Validation(format!("{field} is required")));
            }
        }
        Ok(())
    }
}

/// Transient result returned by an executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub summary: String,
    #[serde(default)]
    pub artifact_path: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl TaskResult {
    pub fn new(summary: &str) -> Self {
        Self {
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    pub fn with_artifact(mut self, path: &str) -> Self {
        self.artifact_path = Some(path.to_string());
        self
    }
}

/// A durable task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub workspace_id: String,
    pub context_id: String,
    pub kind: TaskKind,
    pub title: String,
    pub prompt: String,
    pub status: TaskStatus,
    /// Incremented each time a worker begins executing the task.
    pub attempts: u32,
    pub result_path: Option<String>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub retry_of_task_id: Option<String>,
    /// Set when the task was produced by an objective run.
    pub objective_id: Option<String>,
    #[serde(default)]
    pub run_key: Option<String>,
    pub origin: Option<TaskOrigin>,
    pub worker_id: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a queued task from a validated draft.
    pub fn from_draft(draft: TaskDraft, now: DateTime<Utc>) -> Result<Self> {
        draft.validate()?;
        Ok(Self {
            id: crate::types::new_id("task"),
            workspace_id: draft.workspace_id.trim().to_string(),
            context_id: draft.context_id.trim().to_string(),
            kind: draft.kind.unwrap_or_default(),
            title: draft.title.trim().to_string(),
            prompt: draft.prompt.trim().to_string(),
            status: TaskStatus::Queued,
            attempts: 0,
            result_path: None,
            result_summary: None,
            error_message: None,
            retry_of_task_id: draft.retry_of_task_id,
            objective_id: draft.objective_id,
            run_key: draft
                .run_key
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            origin: draft.origin,
            worker_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        })
    }

    fn guard(&self, next: TaskStatus) -> Result<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(LoomError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// The `running` record a worker persists before invoking the executor.
    pub fn started(&self, worker_id: usize, now: DateTime<Utc>) -> Result<Self> {
        self.guard(TaskStatus::Running)?;
        let mut next = self.clone();
        next.status = TaskStatus::Running;
        next.attempts += 1;
        next.worker_id = Some(worker_id);
        next.started_at = Some(now);
        next.updated_at = now;
        Ok(next)
    }

    pub fn succeeded(&self, result: &TaskResult, now: DateTime<Utc>) -> Result<Self> {
        self.guard(TaskStatus::Succeeded)?;
        let mut next = self.clone();
        next.status = TaskStatus::Succeeded;
        next.result_summary = Some(result.summary.clone());
        next.result_path = result.artifact_path.clone();
        next.error_message = None;
        next.finished_at = Some(now);
        next.updated_at = now;
        Ok(next)
    }

    pub fn failed(&self, message: &str, now: DateTime<Utc>) -> Result<Self> {
        self.guard(TaskStatus::Failed)?;
        let mut next = self.clone();
        next.status = TaskStatus::Failed;
        next.error_message = Some(message.to_string());
        next.result_path = None;
        next.result_summary = None;
        next.finished_at = Some(now);
        next.updated_at = now;
        Ok(next)
    }

    /// Draft for a retry of this failed task. The task itself is not touched.
    pub fn retry_draft(&self) -> Result<TaskDraft> {
        if self.status != TaskStatus::Failed {
            return Err(LoomError::NotRetryable {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        Ok(TaskDraft {
            workspace_id: self.workspace_id.clone(),
            context_id: self.context_id.clone(),
            kind: Some(self.kind),
            title: self.title.clone(),
            prompt: self.prompt.clone(),
            origin: self.origin.clone(),
            objective_id: self.objective_id.clone(),
            retry_of_task_id: Some(self.id.clone()),
            run_key: None,
        })
    }

    /// Wall-clock run time of the last attempt, when both ends are known.
    pub fn run_duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_milliseconds().max(0) as u64)
    }
}

/// Query filter for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub workspace_id: Option<String>,
    pub status: Option<TaskStatus>,
    /// 0 means the store default (100).
    pub limit: usize,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 { 100 } else { self.limit }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.workspace_id
            .as_deref()
            .is_none_or(|ws| ws == task.workspace_id)
            && self.status.is_none_or(|s| s == task.status)
    }
}
