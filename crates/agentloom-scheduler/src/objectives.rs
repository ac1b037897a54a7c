//! Objective scheduler — turns due objectives into tasks.
//!
//! The scheduler is a producer like any other: every run goes through a
//! [`TaskSink`]. A full queue defers the objective to the next tick without
//! touching it. Run statistics are folded in when the produced task
//! finishes, through the shared [`ObjectiveLedger`].
//!
//! Each run carries a durable run key (`objective:<id>:<slot unix>` or
//! `objective:<id>:event:<bucket>:<path>`), so a slot that was queued but
//! never marked as advanced is not queued a second time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use agentloom_core::config::SchedulerConfig;
use agentloom_core::error::{LoomError, Result};
use agentloom_core::traits::TaskStore;
use agentloom_core::types::{
    Objective, ObjectiveDraft, ObjectiveRunOutcome, Task, TaskDraft, TaskKind, TaskStatus,
    TriggerType,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cron;
use crate::engine::TaskSink;

/// Event fired when a markdown file in a workspace changes.
pub const MARKDOWN_UPDATED: &str = "markdown.updated";

const TITLE_LIMIT: usize = 72;
const EVENT_BATCH: usize = 20;
const EVENT_DEDUPE_SECS: i64 = 30;

/// Serialises objective writes so dispatch bookkeeping and run outcomes
/// never overwrite each other.
pub struct ObjectiveLedger {
    store: Arc<dyn TaskStore>,
    config: SchedulerConfig,
    write: Mutex<()>,
}

impl ObjectiveLedger {
    pub fn new(store: Arc<dyn TaskStore>, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            write: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.write
            .lock()
            .map_err(|e| LoomError::Persistence(format!("objective ledger poisoned: {e}")))
    }

    /// Read-modify-write one objective under the ledger lock.
    pub fn modify<F>(&self, id: &str, f: F) -> Result<Objective>
    where
        F: FnOnce(&mut Objective) -> Result<()>,
    {
        let _guard = self.guard()?;
        let mut objective = self
            .store
            .get_objective(id)?
            .ok_or_else(|| LoomError::ObjectiveNotFound(id.to_string()))?;
        f(&mut objective)?;
        self.store.update_objective(&objective)?;
        Ok(objective)
    }

    /// Fold a finished run into the counters, then apply the failure policy.
    pub fn record_outcome(
        &self,
        id: &str,
        outcome: &ObjectiveRunOutcome,
        now: DateTime<Utc>,
    ) -> Result<Objective> {
        let _guard = self.guard()?;
        let mut objective = self.store.record_objective_run(id, outcome)?;
        if outcome.error.is_some() && self.apply_failure_policy(&mut objective, now) {
            self.store.update_objective(&objective)?;
        }
        tracing::debug!(
            objective_id = id,
            runs = objective.run_count,
            failures = objective.failure_count,
            "📊 Objective run recorded"
        );
        Ok(objective)
    }

    /// A run that failed before producing a task (empty prompt, bad trigger,
    /// rejected enqueue). Counted as a failed run with zero duration.
    fn record_dispatch_failure(
        &self,
        id: &str,
        error: &str,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Objective> {
        self.modify(id, |objective| {
            objective.apply_run_outcome(&ObjectiveRunOutcome::failure(now, 0, error));
            objective.last_run_at = Some(now);
            objective.next_run_at = next_run_at;
            self.apply_failure_policy(objective, now);
            Ok(())
        })
    }

    /// Auto-pause after too many consecutive failures; otherwise push the
    /// next run of a recurring objective out by the backoff.
    fn apply_failure_policy(&self, objective: &mut Objective, now: DateTime<Utc>) -> bool {
        if !objective.active || objective.consecutive_failures == 0 {
            return false;
        }
        let consecutive = objective.consecutive_failures;
        if self.config.auto_pause_after > 0 && consecutive >= self.config.auto_pause_after {
            objective.active = false;
            objective.next_run_at = None;
            objective.auto_paused_reason =
                Some(format!("auto-paused after {consecutive} consecutive failures"));
            objective.updated_at = now;
            tracing::warn!(
                objective_id = %objective.id,
                "⏸️ Objective '{}' auto-paused after {consecutive} consecutive failures",
                objective.title
            );
            return true;
        }
        if !matches!(
            objective.trigger,
            TriggerType::Interval { .. } | TriggerType::Cron { .. }
        ) {
            return false;
        }
        let backoff = chrono::Duration::seconds(self.failure_backoff(consecutive).as_secs() as i64);
        let backoff_until = now.checked_add_signed(backoff).unwrap_or(now);
        if objective.next_run_at.is_none_or(|next| next < backoff_until) {
            objective.next_run_at = Some(backoff_until);
            objective.updated_at = now;
            return true;
        }
        false
    }

    /// `min * 2^(n-1)`, clamped to `[min, max]`.
    pub fn failure_backoff(&self, consecutive: u32) -> Duration {
        let min = Duration::from_secs(self.config.failure_backoff_min_secs.max(1));
        let max = Duration::from_secs(self.config.failure_backoff_max_secs).max(min);
        let exponent = consecutive.saturating_sub(1).min(20);
        min.saturating_mul(1u32 << exponent).clamp(min, max)
    }
}

/// Outcome of one poll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Tasks enqueued.
    pub dispatched: usize,
    /// Left due because the queue was full.
    pub deferred: usize,
    /// Recorded as failed runs without producing a task.
    pub failed: usize,
    /// Skipped because a task for the same run already exists.
    pub already_queued: usize,
}

pub struct ObjectiveScheduler {
    sink: Arc<dyn TaskSink>,
    ledger: Arc<ObjectiveLedger>,
    config: SchedulerConfig,
    /// `objective:path` → last event dispatch, for the dedupe window.
    recent_events: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ObjectiveScheduler {
    pub fn new(store: Arc<dyn TaskStore>, sink: Arc<dyn TaskSink>, config: SchedulerConfig) -> Self {
        let ledger = Arc::new(ObjectiveLedger::new(store, config.clone()));
        Self::with_ledger(ledger, sink)
    }

    /// Share a ledger with the engine that records run outcomes.
    pub fn with_ledger(ledger: Arc<ObjectiveLedger>, sink: Arc<dyn TaskSink>) -> Self {
        Self {
            config: ledger.config.clone(),
            sink,
            ledger,
            recent_events: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> Arc<ObjectiveLedger> {
        Arc::clone(&self.ledger)
    }

    fn store(&self) -> &Arc<dyn TaskStore> {
        self.ledger.store()
    }

    // ─── Polling ────────────────────────────────────────────

    /// Dispatch every due objective once.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self
            .store()
            .list_due_objectives(now, self.config.effective_due_batch())?;
        let mut report = TickReport::default();
        let mut seen = HashSet::new();

        for objective in due {
            if !seen.insert(objective.id.clone()) || !objective.is_due(now) {
                continue;
            }
            self.run_scheduled(&objective, now, &mut report);
        }

        if report != TickReport::default() {
            tracing::info!(
                "⏰ Scheduler tick: {} dispatched, {} deferred, {} failed, {} already queued",
                report.dispatched,
                report.deferred,
                report.failed,
                report.already_queued
            );
        }
        Ok(report)
    }

    fn run_scheduled(&self, objective: &Objective, now: DateTime<Utc>, report: &mut TickReport) {
        let next = match cron::next_run_after(&objective.trigger, &objective.timezone, now) {
            Ok(next) => next,
            Err(e) => {
                self.fail_run(objective, &e.to_string(), None, now, report);
                return;
            }
        };
        if objective.prompt.trim().is_empty() {
            self.fail_run(objective, "objective prompt is empty", next, now, report);
            return;
        }

        let draft = objective_task(objective, objective.prompt.trim(), schedule_run_key(objective, now));
        match self.sink.submit(draft) {
            Ok(task) => {
                report.dispatched += 1;
                self.advance(objective, next, now);
                tracing::info!(
                    objective_id = %objective.id,
                    task_id = %task.id,
                    "🔔 Objective '{}' queued",
                    objective.title
                );
            }
            Err(LoomError::RunAlreadyQueued(key)) => {
                report.already_queued += 1;
                tracing::info!(objective_id = %objective.id, "Scheduled run already queued ({key})");
                self.advance(objective, next, now);
            }
            Err(e) if e.is_queue_full() => {
                report.deferred += 1;
                tracing::warn!(
                    objective_id = %objective.id,
                    "⚠️ Queue full; objective '{}' stays due",
                    objective.title
                );
            }
            Err(e) => {
                let message = format!("enqueue objective task: {e}");
                self.fail_run(objective, &message, next, now, report);
            }
        }
    }

    /// Move past the slot just dispatched. A `next_run_at` changed since the
    /// tick loaded the objective (failure backoff, auto-pause) wins when later.
    fn advance(&self, objective: &Objective, next: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        let scheduled = objective.next_run_at;
        let marked = self.ledger.modify(&objective.id, |o| {
            o.last_run_at = Some(now);
            o.next_run_at = match (o.next_run_at, next) {
                (current, _) if current == scheduled => next,
                (Some(current), Some(next)) => Some(current.max(next)),
                (current, _) => current,
            };
            o.updated_at = now;
            Ok(())
        });
        if let Err(e) = marked {
            tracing::error!("❌ Failed to advance objective {}: {e}", objective.id);
        }
    }

    fn fail_run(
        &self,
        objective: &Objective,
        error: &str,
        next: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        report.failed += 1;
        tracing::warn!(objective_id = %objective.id, "⚠️ Objective run failed: {error}");
        if let Err(e) = self.ledger.record_dispatch_failure(&objective.id, error, next, now) {
            tracing::error!("❌ Failed to record objective failure {}: {e}", objective.id);
        }
    }

    /// Dispatch every active objective in `workspace_id` listening for
    /// `event_key`. Repeats of the same detail within 30s are dropped.
    pub fn handle_event(
        &self,
        workspace_id: &str,
        event_key: &str,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TickReport> {
        let workspace_id = workspace_id.trim();
        let event_key = event_key.trim().to_ascii_lowercase();
        let mut report = TickReport::default();
        if workspace_id.is_empty() || event_key.is_empty() {
            return Ok(report);
        }
        let detail = detail.map(str::trim).filter(|d| !d.is_empty());
        let objectives = self
            .store()
            .list_event_objectives(workspace_id, &event_key, EVENT_BATCH)?;

        for objective in objectives {
            if !self.claim_event(&objective.id, detail, now) {
                tracing::debug!(objective_id = %objective.id, "Event objective already queued");
                continue;
            }
            let prompt = objective.prompt.trim();
            if prompt.is_empty() {
                self.fail_run(&objective, "objective prompt is empty", None, now, &mut report);
                continue;
            }
            let prompt = match detail {
                Some(path) if event_key == MARKDOWN_UPDATED => {
                    format!("{prompt}\n\nChanged markdown file: `{path}`.")
                }
                Some(detail) => format!("{prompt}\n\nEvent detail: {detail}"),
                None => prompt.to_string(),
            };

            let run_key = event_run_key(&objective.id, detail, now);
            match self.sink.submit(objective_task(&objective, &prompt, run_key)) {
                Ok(task) => {
                    report.dispatched += 1;
                    let marked = self.ledger.modify(&objective.id, |o| {
                        o.last_run_at = Some(now);
                        o.updated_at = now;
                        Ok(())
                    });
                    if let Err(e) = marked {
                        tracing::error!("❌ Failed to mark objective {}: {e}", objective.id);
                    }
                    tracing::info!(
                        objective_id = %objective.id,
                        task_id = %task.id,
                        "🔔 Event objective '{}' queued ({event_key})",
                        objective.title
                    );
                }
                Err(LoomError::RunAlreadyQueued(key)) => {
                    report.already_queued += 1;
                    tracing::debug!(objective_id = %objective.id, "Event run already queued ({key})");
                }
                Err(e) => {
                    // Events are not replayed, so a rejected enqueue is a failed run.
                    self.release_event(&objective.id, detail);
                    let message = format!("enqueue objective task: {e}");
                    self.fail_run(&objective, &message, None, now, &mut report);
                }
            }
        }
        Ok(report)
    }

    fn event_key_for(objective_id: &str, detail: Option<&str>) -> String {
        format!("{objective_id}:{}", detail.unwrap_or("-").to_ascii_lowercase())
    }

    fn claim_event(&self, objective_id: &str, detail: Option<&str>, now: DateTime<Utc>) -> bool {
        let Ok(mut recent) = self.recent_events.lock() else {
            return true;
        };
        let window = chrono::Duration::seconds(EVENT_DEDUPE_SECS);
        recent.retain(|_, at| now - *at < window);
        let key = Self::event_key_for(objective_id, detail);
        if recent.contains_key(&key) {
            return false;
        }
        recent.insert(key, now);
        true
    }

    fn release_event(&self, objective_id: &str, detail: Option<&str>) {
        if let Ok(mut recent) = self.recent_events.lock() {
            recent.remove(&Self::event_key_for(objective_id, detail));
        }
    }

    /// Called when a task produced by an objective reaches a terminal state.
    pub fn record_outcome(&self, objective_id: &str, outcome: &ObjectiveRunOutcome) -> Result<Objective> {
        self.ledger.record_outcome(objective_id, outcome, Utc::now())
    }

    // ─── Admin surface ──────────────────────────────────────

    pub fn create_objective(&self, draft: ObjectiveDraft, now: DateTime<Utc>) -> Result<Objective> {
        let mut objective = Objective::from_draft(draft, now)?;
        cron::parse_timezone(&objective.timezone)?;
        objective.next_run_at = cron::initial_next_run(&objective.trigger, &objective.timezone, now)?;
        self.store().create_objective(&objective)?;
        tracing::info!(
            "📅 Objective added: '{}' ({}, {})",
            objective.title,
            objective.id,
            objective.trigger.name()
        );
        Ok(objective)
    }

    pub fn list_objectives(&self, workspace_id: Option<&str>) -> Result<Vec<Objective>> {
        self.store().list_objectives(workspace_id)
    }

    pub fn get_objective(&self, id: &str) -> Result<Objective> {
        self.store()
            .get_objective(id)?
            .ok_or_else(|| LoomError::ObjectiveNotFound(id.to_string()))
    }

    /// Stop evaluating. `next_run_at` is left as it was.
    pub fn pause(&self, id: &str, now: DateTime<Utc>) -> Result<Objective> {
        let objective = self.ledger.modify(id, |o| {
            o.active = false;
            o.updated_at = now;
            Ok(())
        })?;
        tracing::info!("⏸️ Objective paused: '{}'", objective.title);
        Ok(objective)
    }

    /// Re-activate and recompute the next run from `now`; missed runs are
    /// not replayed.
    pub fn resume(&self, id: &str, now: DateTime<Utc>) -> Result<Objective> {
        let objective = self.ledger.modify(id, |o| {
            o.next_run_at = cron::next_run_after(&o.trigger, &o.timezone, now)?;
            o.active = true;
            o.auto_paused_reason = None;
            o.consecutive_failures = 0;
            o.updated_at = now;
            Ok(())
        })?;
        tracing::info!(
            "▶️ Objective resumed: '{}' (next run {})",
            objective.title,
            objective
                .next_run_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "on event".into())
        );
        Ok(objective)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.ledger.guard()?;
        if self.store().delete_objective(id)? {
            tracing::info!("🗑️ Objective deleted: {id}");
            Ok(())
        } else {
            Err(LoomError::ObjectiveNotFound(id.to_string()))
        }
    }

    // ─── Loop ───────────────────────────────────────────────

    /// Tick immediately, then every poll interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.config.enabled {
            tracing::info!("⏰ Objective scheduler disabled");
            return;
        }
        let period = self.config.poll_interval();
        tracing::info!("⏰ Objective scheduler started (check every {}s)", period.as_secs());
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()) {
                        tracing::error!("❌ Scheduler tick failed: {e}");
                    }
                }
            }
        }
        tracing::info!("⏰ Objective scheduler stopped");
    }
}

/// `objective:<id>:<unix>` for the slot the objective was due at.
fn schedule_run_key(objective: &Objective, now: DateTime<Utc>) -> String {
    let slot = objective.next_run_at.unwrap_or(now);
    format!("objective:{}:{}", objective.id, slot.timestamp())
}

/// `objective:<id>:event:<bucket>:<path>`, one bucket per dedupe window.
fn event_run_key(objective_id: &str, detail: Option<&str>, now: DateTime<Utc>) -> String {
    let bucket = now.timestamp().div_euclid(EVENT_DEDUPE_SECS);
    let path = detail
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "-".into());
    format!("objective:{objective_id}:event:{bucket}:{path}")
}

/// The task an objective run produces.
fn objective_task(objective: &Objective, prompt: &str, run_key: String) -> TaskDraft {
    let mut title = objective.title.trim().to_string();
    if title.is_empty() {
        title = "Objective task".into();
    }
    if let Some((cut, _)) = title.char_indices().nth(TITLE_LIMIT) {
        title.truncate(cut);
    }
    TaskDraft {
        workspace_id: objective.workspace_id.clone(),
        context_id: objective.context_id.clone(),
        kind: Some(TaskKind::Objective),
        title,
        prompt: prompt.to_string(),
        origin: None,
        objective_id: Some(objective.id.clone()),
        retry_of_task_id: None,
        run_key: Some(run_key),
    }
}

/// The terminal task's outcome as an objective run.
pub fn outcome_of(task: &Task) -> ObjectiveRunOutcome {
    let finished_at = task.finished_at.unwrap_or(task.updated_at);
    let duration_ms = task.run_duration_ms().unwrap_or(0);
    match task.status {
        TaskStatus::Failed => ObjectiveRunOutcome::failure(
            finished_at,
            duration_ms,
            task.error_message.as_deref().unwrap_or("unknown error"),
        ),
        _ => ObjectiveRunOutcome::success(finished_at, duration_ms),
    }
}
