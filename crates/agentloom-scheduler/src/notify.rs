//! Notification dispatcher — decides who hears about a finished task.
//!
//! Policy is evaluated once per terminal transition. Delivery runs on a
//! spawned task and never touches the task record; failures are logged and
//! kept in the in-memory history.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentloom_core::config::NotificationConfig;
use agentloom_core::error::{LoomError, Result};
use agentloom_core::traits::Publisher;
use agentloom_core::types::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;

const HISTORY_LIMIT: usize = 100;
const LINE_LIMIT: usize = 900;
const MESSAGE_LIMIT: usize = 1400;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(12);

/// Who receives a result notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPolicy {
    Both,
    Admin,
    Origin,
    None,
}

impl NotifyPolicy {
    /// Case-insensitive; anything unrecognised means `Both`.
    pub fn parse(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "admin" => NotifyPolicy::Admin,
            "origin" => NotifyPolicy::Origin,
            "none" | "off" => NotifyPolicy::None,
            _ => NotifyPolicy::Both,
        }
    }

    /// Empty input inherits `fallback`.
    pub fn parse_or(input: &str, fallback: NotifyPolicy) -> Self {
        if input.trim().is_empty() {
            fallback
        } else {
            Self::parse(input)
        }
    }

    pub fn includes_origin(&self) -> bool {
        matches!(self, NotifyPolicy::Both | NotifyPolicy::Origin)
    }

    pub fn includes_admin(&self) -> bool {
        matches!(self, NotifyPolicy::Both | NotifyPolicy::Admin)
    }
}

/// A connector conversation to deliver to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeliveryTarget {
    pub connector: String,
    pub external_id: String,
}

impl DeliveryTarget {
    pub fn new(connector: &str, external_id: &str) -> Option<Self> {
        let connector = connector.trim().to_ascii_lowercase();
        let external_id = external_id.trim().to_string();
        if connector.is_empty() || external_id.is_empty() {
            return None;
        }
        Some(Self {
            connector,
            external_id,
        })
    }
}

impl FromStr for DeliveryTarget {
    type Err = LoomError;

    /// `connector:external_id`; the id may itself contain colons.
    fn from_str(s: &str) -> Result<Self> {
        s.split_once(':')
            .and_then(|(connector, external_id)| DeliveryTarget::new(connector, external_id))
            .ok_or_else(|| {
                LoomError::Config(format!(
                    "invalid delivery target '{s}', expected connector:external_id"
                ))
            })
    }
}

impl fmt::Display for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connector, self.external_id)
    }
}

/// Target set for one task under `policy`, de-duplicated, origin first.
/// Contexts prefixed `system:` have no human origin to notify.
pub fn resolve_targets(
    policy: NotifyPolicy,
    task: &Task,
    admin_targets: &[DeliveryTarget],
) -> Vec<DeliveryTarget> {
    let mut targets: Vec<DeliveryTarget> = Vec::new();
    let mut add = |target: DeliveryTarget| {
        if !targets.contains(&target) {
            targets.push(target);
        }
    };

    if policy.includes_origin() && !task.context_id.trim().starts_with("system:") {
        if let Some(target) = task
            .origin
            .as_ref()
            .and_then(|o| DeliveryTarget::new(&o.connector, &o.external_id))
        {
            add(target);
        }
    }
    if policy.includes_admin() {
        for target in admin_targets {
            add(target.clone());
        }
    }
    targets
}

fn title_or_default(task: &Task) -> &str {
    let title = task.title.trim();
    if title.is_empty() { "Task" } else { title }
}

pub fn build_success_message(task: &Task) -> String {
    let summary = task
        .result_summary
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("completed");
    let mut message = format!(
        "Task completed\n- id: `{}`\n- kind: `{}`\n- title: {}\n- summary: {}",
        task.id.trim(),
        task.kind,
        title_or_default(task),
        truncate_single_line(summary, LINE_LIMIT)
    );
    if let Some(path) = task.result_path.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        message.push_str(&format!("\n- output: `{path}`"));
    }
    truncate(&message, MESSAGE_LIMIT)
}

pub fn build_failure_message(task: &Task) -> String {
    let error = task
        .error_message
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown error");
    let message = format!(
        "Task failed\n- id: `{}`\n- kind: `{}`\n- title: {}\n- error: {}",
        task.id.trim(),
        task.kind,
        title_or_default(task),
        truncate_single_line(error, LINE_LIMIT)
    );
    truncate(&message, MESSAGE_LIMIT)
}

/// Collapse whitespace, then cap at `max` bytes on a char boundary.
pub fn truncate_single_line(input: &str, max: usize) -> String {
    let single = input.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate(&single, max)
}

fn truncate(input: &str, max: usize) -> String {
    let trimmed = input.trim();
    if max == 0 || trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut end = max;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", trimmed[..end].trim_end())
}

/// One delivery attempt, kept for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    pub task_id: String,
    pub target: DeliveryTarget,
    pub message: String,
    pub delivered: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct NotificationDispatcher {
    publishers: HashMap<String, Arc<dyn Publisher>>,
    success_policy: NotifyPolicy,
    failure_policy: NotifyPolicy,
    admin_targets: Vec<DeliveryTarget>,
    /// Ring buffer, last 100.
    history: Mutex<VecDeque<NotificationRecord>>,
}

impl NotificationDispatcher {
    pub fn new(success_policy: NotifyPolicy, failure_policy: NotifyPolicy) -> Self {
        Self {
            publishers: HashMap::new(),
            success_policy,
            failure_policy,
            admin_targets: Vec::new(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Build from config. Malformed admin targets are skipped with a warning.
    pub fn from_config(config: &NotificationConfig) -> Self {
        let base = NotifyPolicy::parse(&config.policy);
        let mut dispatcher = Self::new(
            NotifyPolicy::parse_or(&config.success_policy, base),
            NotifyPolicy::parse_or(&config.failure_policy, base),
        );
        for raw in &config.admin_targets {
            match raw.parse::<DeliveryTarget>() {
                Ok(target) => dispatcher.add_admin_target(target),
                Err(e) => tracing::warn!("⚠️ Skipping admin target: {e}"),
            }
        }
        dispatcher
    }

    pub fn register_publisher(&mut self, publisher: Arc<dyn Publisher>) {
        let name = publisher.name().trim().to_ascii_lowercase();
        if name.is_empty() {
            return;
        }
        tracing::debug!("📮 Publisher registered: {name}");
        self.publishers.insert(name, publisher);
    }

    pub fn add_admin_target(&mut self, target: DeliveryTarget) {
        if !self.admin_targets.contains(&target) {
            self.admin_targets.push(target);
        }
    }

    pub fn policy_for(&self, status: TaskStatus) -> Option<NotifyPolicy> {
        match status {
            TaskStatus::Succeeded => Some(self.success_policy),
            TaskStatus::Failed => Some(self.failure_policy),
            _ => None,
        }
    }

    /// Message and targets for a terminal task; `None` when nobody is addressed.
    pub fn plan(&self, task: &Task) -> Option<(String, Vec<DeliveryTarget>)> {
        let policy = self.policy_for(task.status)?;
        let message = match task.status {
            TaskStatus::Succeeded => build_success_message(task),
            _ => build_failure_message(task),
        };
        let targets: Vec<DeliveryTarget> = resolve_targets(policy, task, &self.admin_targets)
            .into_iter()
            .filter(|t| self.publishers.contains_key(&t.connector))
            .collect();
        if targets.is_empty() {
            None
        } else {
            Some((message, targets))
        }
    }

    /// Fire-and-forget delivery on the current runtime.
    pub fn notify(self: &Arc<Self>, task: &Task) {
        if self.publishers.is_empty() || self.plan(task).is_none() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("⚠️ No runtime for notification of task {}", task.id);
            return;
        };
        let dispatcher = Arc::clone(self);
        let task = task.clone();
        handle.spawn(async move {
            dispatcher.deliver(&task).await;
        });
    }

    /// Deliver to every resolved target, in order. Returns what was attempted.
    pub async fn deliver(&self, task: &Task) -> Vec<NotificationRecord> {
        let Some((message, targets)) = self.plan(task) else {
            return Vec::new();
        };
        let mut records = Vec::with_capacity(targets.len());
        for target in targets {
            let Some(publisher) = self.publishers.get(&target.connector) else {
                continue;
            };
            let outcome = tokio::time::timeout(
                PUBLISH_TIMEOUT,
                publisher.publish(&target.external_id, &message),
            )
            .await
            .unwrap_or_else(|_| Err(LoomError::Delivery("publish timed out".into())));

            let error = match outcome {
                Ok(()) => {
                    tracing::debug!("📨 Notified {target} about task {}", task.id);
                    None
                }
                Err(e) => {
                    tracing::error!("❌ Notification for task {} to {target} failed: {e}", task.id);
                    Some(e.to_string())
                }
            };
            let record = NotificationRecord {
                task_id: task.id.clone(),
                target,
                message: message.clone(),
                delivered: error.is_none(),
                error,
                timestamp: Utc::now(),
            };
            self.record(record.clone());
            records.push(record);
        }
        records
    }

    fn record(&self, record: NotificationRecord) {
        if let Ok(mut history) = self.history.lock() {
            history.push_back(record);
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
    }

    pub fn history(&self) -> Vec<NotificationRecord> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}
