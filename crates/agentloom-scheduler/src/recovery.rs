//! Stale-task recovery — fails `running` tasks orphaned by a dead process.
//!
//! Only tasks still `running` in the store are considered and each
//! transition is guarded on that status, so repeated scans never
//! transition the same task twice.

use std::time::Duration;

use agentloom_core::error::{LoomError, Result};
use agentloom_core::types::Task;
use chrono::{DateTime, Utc};

use crate::lifecycle::TaskLifecycle;

const SCAN_BATCH: usize = 100;

pub struct StaleTaskRecovery {
    lifecycle: TaskLifecycle,
    stale_after: Duration,
}

impl StaleTaskRecovery {
    pub fn new(lifecycle: TaskLifecycle, stale_after: Duration) -> Self {
        Self {
            lifecycle,
            stale_after,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Fail every task `running` since before `now - stale_after`, except
    /// ids for which `is_held` returns true. Returns the failed records.
    pub fn scan<F>(&self, now: DateTime<Utc>, is_held: F) -> Result<Vec<Task>>
    where
        F: Fn(&str) -> bool,
    {
        let threshold = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| LoomError::Config(format!("stale threshold out of range: {e}")))?;
        let cutoff = now - threshold;
        let mut recovered = Vec::new();

        loop {
            let batch = self
                .lifecycle
                .store()
                .list_stale_running(cutoff, SCAN_BATCH)?;
            let batch_len = batch.len();
            let mut progressed = 0;

            for task in batch.iter().filter(|t| !is_held(&t.id)) {
                match self.lifecycle.recover(task, now - task.updated_at, now) {
                    Ok(failed) => {
                        tracing::warn!(
                            task_id = %failed.id,
                            "🩹 Recovered stale task '{}' (attempt {})",
                            failed.title,
                            failed.attempts
                        );
                        recovered.push(failed);
                        progressed += 1;
                    }
                    Err(LoomError::Conflict(reason)) => {
                        tracing::debug!(task_id = %task.id, "Stale task already moved on: {reason}");
                    }
                    Err(e) => {
                        tracing::error!(task_id = %task.id, "❌ Stale recovery failed: {e}");
                    }
                }
            }

            if batch_len < SCAN_BATCH || progressed == 0 {
                break;
            }
        }

        if !recovered.is_empty() {
            tracing::info!("🩺 Stale recovery failed {} orphaned tasks", recovered.len());
        }
        Ok(recovered)
    }
}
