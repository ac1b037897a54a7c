//! Objective definitions — recurring goals whose trigger produces tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LoomError, Result};

/// How/when an objective triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerType {
    /// Run every N seconds.
    Interval { every_secs: u64 },
    /// Run on a cron schedule (5-field expression or `@descriptor`).
    Cron { expression: String },
    /// Run once at a specific time.
    Once { at: DateTime<Utc> },
    /// Run when a named workspace event fires (never time-due).
    Event { key: String },
}

impl TriggerType {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerType::Interval { .. } => "interval",
            TriggerType::Cron { .. } => "cron",
            TriggerType::Once { .. } => "once",
            TriggerType::Event { .. } => "event",
        }
    }

    /// Time-based triggers get failure backoff; events do not.
    pub fn is_scheduled(&self) -> bool {
        !matches!(self, TriggerType::Event { .. })
    }
}

/// Result of one objective run, recorded once its task reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveRunOutcome {
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// `None` means the run succeeded.
    pub error: Option<String>,
}

impl ObjectiveRunOutcome {
    pub fn success(finished_at: DateTime<Utc>, duration_ms: u64) -> Self {
        Self {
            finished_at,
            duration_ms,
            error: None,
        }
    }

    pub fn failure(finished_at: DateTime<Utc>, duration_ms: u64, error: &str) -> Self {
        Self {
            finished_at,
            duration_ms,
            error: Some(error.to_string()),
        }
    }
}

/// Input for creating an objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveDraft {
    pub workspace_id: String,
    pub context_id: String,
    pub title: String,
    pub prompt: String,
    pub trigger: TriggerType,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl ObjectiveDraft {
    pub fn validate(&self) -> Result<()> {
        if self.workspace_id.trim().is_empty() {
            return Err(LoomError::Validation("workspace_id is required".into()));
        }
        if self.context_id.trim().is_empty() {
            return Err(LoomError::Validation("context_id is required".into()));
        }
        if self.title.trim().is_empty() {
            return Err(LoomError::Validation("title is required".into()));
        }
        match &self.trigger {
            TriggerType::Interval { every_secs: 0 } => {
                Err(LoomError::Trigger("interval must be at least 1 second".into()))
            }
            TriggerType::Cron { expression } if expression.trim().is_empty() => {
                Err(LoomError::Trigger("cron expression is empty".into()))
            }
            TriggerType::Event { key } if key.trim().is_empty() => {
                Err(LoomError::Trigger("event key is empty".into()))
            }
            _ => Ok(()),
        }
    }
}

/// A durable objective record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub id: String,
    pub workspace_id: String,
    pub context_id: String,
    pub title: String,
    pub prompt: String,
    pub trigger: TriggerType,
    pub timezone: String,
    /// Paused objectives are never evaluated by the scheduler.
    pub active: bool,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub avg_run_duration_ms: u64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub auto_paused_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Objective {
    /// Build an objective from a draft. `next_run_at` is filled in by the scheduler.
    pub fn from_draft(draft: ObjectiveDraft, now: DateTime<Utc>) -> Result<Self> {
        draft.validate()?;
        let timezone = draft
            .timezone
            .map(|tz| tz.trim().to_string())
            .filter(|tz| !tz.is_empty())
            .unwrap_or_else(|| "UTC".to_string());
        let trigger = match draft.trigger {
            TriggerType::Event { key } => TriggerType::Event {
                key: key.trim().to_ascii_lowercase(),
            },
            TriggerType::Cron { expression } => TriggerType::Cron {
                expression: expression.split_whitespace().collect::<Vec<_>>().join(" "),
            },
            other => other,
        };
        Ok(Self {
            id: crate::types::new_id("obj"),
            workspace_id: draft.workspace_id.trim().to_string(),
            context_id: draft.context_id.trim().to_string(),
            title: draft.title.trim().to_string(),
            prompt: draft.prompt.trim().to_string(),
            trigger,
            timezone,
            active: draft.active,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            avg_run_duration_ms: 0,
            next_run_at: None,
            last_run_at: None,
            last_error: None,
            auto_paused_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Active, time-triggered and past its due time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.trigger.is_scheduled()
            && self.next_run_at.is_some_and(|next| next <= now)
    }

    /// Fold a finished run into the counters.
    ///
    /// `run_count`, `success_count` and `failure_count` move together so that
    /// `success_count + failure_count == run_count` holds after every write.
    pub fn apply_run_outcome(&mut self, outcome: &ObjectiveRunOutcome) {
        self.run_count += 1;
        let total = self.avg_run_duration_ms as u128 * (self.run_count as u128 - 1)
            + outcome.duration_ms as u128;
        self.avg_run_duration_ms = (total / self.run_count as u128) as u64;
        match &outcome.error {
            None => {
                self.success_count += 1;
                self.consecutive_failures = 0;
                self.last_error = None;
            }
            Some(message) => {
                self.failure_count += 1;
                self.consecutive_failures += 1;
                self.last_error = Some(message.trim().to_string());
            }
        }
        self.updated_at = outcome.finished_at;
    }
}
