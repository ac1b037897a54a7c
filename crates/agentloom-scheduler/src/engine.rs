//! Task engine — bounded queue plus a fixed worker pool.
//!
//! Wiring happens on `&mut self` before the engine is wrapped in an `Arc`;
//! after that every operation takes `&self` and is safe to call from any
//! producer. `enqueue` never awaits.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentloom_core::config::EngineConfig;
use agentloom_core::error::{LoomError, Result};
use agentloom_core::traits::{Executor, Observer, TaskStore};
use agentloom_core::types::{Task, TaskDraft, TaskFilter, TaskStatus};
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::executor::NoopExecutor;
use crate::lifecycle::TaskLifecycle;
use crate::notify::NotificationDispatcher;
use crate::objectives::{ObjectiveLedger, outcome_of};
use crate::observer::TracingObserver;
use crate::queue::{QueueStats, TaskQueue};
use crate::recovery::StaleTaskRecovery;

/// Anything that accepts new tasks through the normal enqueue path.
pub trait TaskSink: Send + Sync {
    fn submit(&self, draft: TaskDraft) -> Result<Task>;
}

pub struct TaskEngine {
    lifecycle: TaskLifecycle,
    queue: TaskQueue,
    concurrency: usize,
    recovery: StaleTaskRecovery,
    recovery_interval: Duration,
    executor: Arc<dyn Executor>,
    observer: Arc<dyn Observer>,
    notifier: Option<Arc<NotificationDispatcher>>,
    ledger: Option<Arc<ObjectiveLedger>>,
    running: AtomicBool,
}

impl TaskEngine {
    pub fn new(store: Arc<dyn TaskStore>, config: &EngineConfig) -> Self {
        let lifecycle = TaskLifecycle::new(store);
        Self {
            recovery: StaleTaskRecovery::new(lifecycle.clone(), config.stale_after()),
            lifecycle,
            queue: TaskQueue::new(config.effective_queue_capacity()),
            concurrency: config.effective_concurrency(),
            recovery_interval: config.recovery_interval(),
            executor: Arc::new(NoopExecutor::new(Duration::from_millis(config.noop_delay_ms))),
            observer: Arc::new(TracingObserver),
            notifier: None,
            ledger: None,
            running: AtomicBool::new(false),
        }
    }

    // ─── Wiring ─────────────────────────────────────────────

    pub fn set_executor(&mut self, executor: Arc<dyn Executor>) {
        tracing::debug!("🔧 Executor set: {}", executor.name());
        self.executor = executor;
    }

    pub fn set_observer(&mut self, observer: Arc<dyn Observer>) {
        self.observer = observer;
    }

    pub fn set_notifier(&mut self, notifier: Arc<NotificationDispatcher>) {
        self.notifier = Some(notifier);
    }

    /// Where finished objective runs are recorded.
    pub fn set_objective_ledger(&mut self, ledger: Arc<ObjectiveLedger>) {
        self.ledger = Some(ledger);
    }

    // ─── Producers ──────────────────────────────────────────

    /// Validate, persist and queue a new task.
    ///
    /// The `queued` record is written and `on_task_queued` fires against a
    /// reserved queue slot, before any worker can see the task. The queue
    /// lock is not held meanwhile, so observers may call back into the engine.
    pub fn enqueue(&self, draft: TaskDraft) -> Result<Task> {
        let task = Task::from_draft(draft, Utc::now())?;
        let store = self.lifecycle.store();
        self.queue.push_with(task.clone(), |t| {
            store.create_task(t)?;
            self.emit(|o| o.on_task_queued(t));
            Ok(())
        })?;
        tracing::debug!(task_id = %task.id, queued = self.queue.len(), "📥 Enqueued");
        Ok(task)
    }

    /// Queue a new attempt of a failed task. The original is left as is.
    pub fn retry(&self, task_id: &str) -> Result<Task> {
        let draft = self.lifecycle.retry_draft(task_id)?;
        let task = self.enqueue(draft)?;
        tracing::info!("🔁 Task {task_id} retried as {}", task.id);
        Ok(task)
    }

    /// Re-admit tasks that are durably `queued` but not in memory, oldest
    /// first: leftovers of a previous process, rows written by another
    /// process, and tasks whose `running` write failed. Stops early when the
    /// queue fills up.
    pub fn resume_queued(&self) -> Result<usize> {
        // Everything in memory or mid-pickup is among the oldest rows too.
        let limit = self.queue.capacity() + self.concurrency;
        let pending = self.lifecycle.store().list_queued_oldest(limit)?;

        let store = self.lifecycle.store();
        let mut resumed = 0;
        for task in pending {
            if self.queue.is_held(&task.id) {
                continue;
            }
            match self.queue.push_with(task, |t| {
                // A worker may have finished it since the listing.
                match store.get_task(&t.id)? {
                    Some(current) if current.status == TaskStatus::Queued => {}
                    _ => return Err(LoomError::Conflict(format!("task {} left the queue", t.id))),
                }
                self.emit(|o| o.on_task_queued(t));
                Ok(())
            }) {
                Ok(()) => resumed += 1,
                Err(LoomError::Conflict(_)) => continue,
                Err(e) if e.is_queue_full() => {
                    tracing::debug!("Queue full while resuming; {resumed} tasks re-admitted");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if resumed > 0 {
            tracing::info!("♻️ Resumed {resumed} queued tasks");
        }
        Ok(resumed)
    }

    // ─── Worker pool ────────────────────────────────────────

    /// Run the pool until `cancel` fires. Returns once every worker exited.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(LoomError::Config("worker pool already started".into()));
        }
        tracing::info!(
            "🚀 Worker pool started ({} workers, queue capacity {}, executor {})",
            self.concurrency,
            self.queue.capacity(),
            self.executor.name()
        );

        let mut workers = JoinSet::new();
        for worker_id in 1..=self.concurrency {
            let engine = Arc::clone(self);
            let cancel = cancel.clone();
            workers.spawn(async move { engine.worker_loop(worker_id, cancel).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("❌ Worker exited abnormally: {e}");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("🛑 Worker pool stopped ({} tasks left queued)", self.queue.len());
        Ok(())
    }

    async fn worker_loop(&self, worker_id: usize, cancel: CancellationToken) {
        tracing::debug!("👷 Worker {worker_id} ready");
        while let Some(task) = self.queue.next(&cancel).await {
            let task_id = task.id.clone();
            self.process_task(worker_id, task, &cancel).await;
            self.queue.release(&task_id);
        }
        tracing::debug!("👷 Worker {worker_id} exiting");
    }

    async fn process_task(&self, worker_id: usize, task: Task, cancel: &CancellationToken) {
        let running = match self.lifecycle.begin(&task, worker_id, Utc::now()) {
            Ok(running) => running,
            Err(LoomError::Conflict(reason)) => {
                // Picked up elsewhere; this copy was re-admitted concurrently.
                tracing::debug!(task_id = %task.id, "Task already taken: {reason}");
                return;
            }
            Err(e) => {
                // The durable record is still `queued`; memory stays there too.
                let err = LoomError::Persistence(format!("persist running transition: {e}"));
                tracing::error!(task_id = %task.id, "❌ {err}");
                self.emit(|o| o.on_task_started(&task, worker_id));
                self.emit(|o| o.on_task_failed(&task, worker_id, &err));
                return;
            }
        };
        self.emit(|o| o.on_task_started(&running, worker_id));

        let outcome = tokio::select! {
            result = self.executor.execute(&running) => result,
            _ = cancel.cancelled() => Err(LoomError::Cancelled),
        };

        match outcome {
            Ok(result) => match self.lifecycle.complete(&running, &result, Utc::now()) {
                Ok(done) => {
                    self.emit(|o| o.on_task_completed(&done, worker_id, &result));
                    self.after_terminal(&done);
                }
                Err(e) => {
                    let err = LoomError::Persistence(format!("persist completion: {e}"));
                    self.finish_failed(&running, worker_id, err);
                }
            },
            Err(err) => self.finish_failed(&running, worker_id, err),
        }
    }

    fn finish_failed(&self, running: &Task, worker_id: usize, err: LoomError) {
        let message = failure_message(&err);
        match self.lifecycle.fail(running, &message, Utc::now()) {
            Ok(failed) => {
                self.emit(|o| o.on_task_failed(&failed, worker_id, &err));
                self.after_terminal(&failed);
            }
            Err(e) => {
                // Left `running` durably; stale recovery finishes it later.
                tracing::error!(task_id = %running.id, "❌ Could not persist failure ({message}): {e}");
                self.emit(|o| o.on_task_failed(running, worker_id, &err));
            }
        }
    }

    /// Side effects of a persisted terminal transition.
    fn after_terminal(&self, task: &Task) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(task);
        }
        if let (Some(ledger), Some(objective_id)) = (&self.ledger, task.objective_id.as_deref()) {
            let outcome = outcome_of(task);
            if let Err(e) = ledger.record_outcome(objective_id, &outcome, Utc::now()) {
                tracing::warn!("⚠️ Failed to record run of objective {objective_id}: {e}");
            }
        }
    }

    fn emit<F: FnOnce(&dyn Observer)>(&self, f: F) {
        let observer = self.observer.as_ref();
        if catch_unwind(AssertUnwindSafe(|| f(observer))).is_err() {
            tracing::error!("❌ Observer panicked; event dropped");
        }
    }

    // ─── Recovery ───────────────────────────────────────────

    /// Fail orphaned `running` tasks. Tasks held by this process are skipped.
    pub fn recover_stale(&self, now: chrono::DateTime<Utc>) -> Result<Vec<Task>> {
        let recovered = self.recovery.scan(now, |id| self.queue.is_held(id))?;
        for task in &recovered {
            self.after_terminal(task);
        }
        Ok(recovered)
    }

    /// Recover stale tasks and re-admit stranded `queued` rows immediately,
    /// then every recovery interval until cancelled.
    pub async fn run_recovery_loop(&self, cancel: CancellationToken) {
        tracing::info!(
            "🩺 Stale recovery every {}s (threshold {}s)",
            self.recovery_interval.as_secs(),
            self.recovery.stale_after().as_secs()
        );
        let mut interval = tokio::time::interval(self.recovery_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.recover_stale(Utc::now()) {
                        tracing::warn!("⚠️ Stale recovery failed: {e}");
                    }
                    if let Err(e) = self.resume_queued() {
                        tracing::warn!("⚠️ Re-admitting queued tasks failed: {e}");
                    }
                }
            }
        }
    }

    // ─── Queries ────────────────────────────────────────────

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.lifecycle.store().list_tasks(filter)
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.lifecycle
            .store()
            .get_task(id)?
            .ok_or_else(|| LoomError::TaskNotFound(id.to_string()))
    }
}

impl TaskSink for TaskEngine {
    fn submit(&self, draft: TaskDraft) -> Result<Task> {
        self.enqueue(draft)
    }
}

/// Text stored in `error_message`.
fn failure_message(err: &LoomError) -> String {
    match err {
        LoomError::Execution(msg) | LoomError::Persistence(msg) => msg.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::FlakyStore;
    use agentloom_core::types::{TaskResult, TaskStatus};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock, Weak};

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Queued(String),
        Started(String, usize),
        Completed(String, String),
        Failed(String, String),
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingObserver {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
            self.events().iter().filter(|e| pred(e)).count()
        }
    }

    impl Observer for RecordingObserver {
        fn on_task_queued(&self, task: &Task) {
            self.events.lock().unwrap().push(Event::Queued(task.id.clone()));
        }
        fn on_task_started(&self, task: &Task, worker_id: usize) {
            self.events.lock().unwrap().push(Event::Started(task.id.clone(), worker_id));
        }
        fn on_task_completed(&self, task: &Task, _worker_id: usize, result: &TaskResult) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Completed(task.id.clone(), result.summary.clone()));
        }
        fn on_task_failed(&self, task: &Task, _worker_id: usize, error: &LoomError) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Failed(task.id.clone(), error.to_string()));
        }
    }

    enum Script {
        Succeed,
        Deadline,
        Hang,
    }

    struct ScriptedExecutor(Script);

    #[async_trait]
    impl Executor for ScriptedExecutor {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, _task: &Task) -> Result<TaskResult> {
            match self.0 {
                Script::Succeed => Ok(TaskResult::new("ok").with_artifact("tasks/task-1.md")),
                Script::Deadline => Err(LoomError::Execution("context deadline exceeded".into())),
                Script::Hang => std::future::pending().await,
            }
        }
    }

    fn config(concurrency: usize) -> EngineConfig {
        EngineConfig {
            concurrency,
            queue_capacity: Some(50),
            noop_delay_ms: 0,
            ..Default::default()
        }
    }

    fn draft() -> TaskDraft {
        TaskDraft::new("ws_1", "ctx_1", "Collect docs", "Index the docs folder")
    }

    fn engine_with(
        store: Arc<dyn TaskStore>,
        script: Script,
    ) -> (Arc<TaskEngine>, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let mut engine = TaskEngine::new(store, &config(1));
        engine.set_executor(Arc::new(ScriptedExecutor(script)));
        engine.set_observer(observer.clone());
        (Arc::new(engine), observer)
    }

    /// Mark a task as taken by a worker without running it.
    fn hold(engine: &TaskEngine, task: &Task) {
        engine.queue.push(task.clone()).unwrap();
        let popped = engine.queue.try_pop().unwrap();
        assert_eq!(popped.id, task.id);
    }

    async fn wait_for(observer: &RecordingObserver, n: usize) {
        for _ in 0..200 {
            if observer.events().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {n} events, got {:?}", observer.events());
    }

    async fn run_until(engine: &Arc<TaskEngine>, observer: &RecordingObserver, n: usize) {
        let cancel = CancellationToken::new();
        let pool = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.start(cancel).await })
        };
        wait_for(observer, n).await;
        cancel.cancel();
        pool.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_defaults() {
        let store = Arc::new(MemoryStore::new());
        let (engine, observer) = engine_with(store.clone(), Script::Succeed);
        let task = engine.enqueue(draft()).unwrap();
        assert!(!task.id.is_empty());
        assert_eq!(task.kind, agentloom_core::types::TaskKind::General);
        assert!(task.created_at.timestamp() > 0);
        assert_eq!(store.get_task(&task.id).unwrap().unwrap().status, TaskStatus::Queued);
        assert_eq!(observer.events(), vec![Event::Queued(task.id.clone())]);
    }

    #[tokio::test]
    async fn test_validation_rejects_before_queue() {
        let store = Arc::new(MemoryStore::new());
        let (engine, observer) = engine_with(store.clone(), Script::Succeed);
        let mut bad = draft();
        bad.workspace_id = String::new();
        assert!(matches!(engine.enqueue(bad), Err(LoomError::Validation(_))));
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(store.task_count(), 0);
        assert!(observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_success_sequence() {
        let store = Arc::new(MemoryStore::new());
        let (engine, observer) = engine_with(store.clone(), Script::Succeed);
        let task = engine.enqueue(draft()).unwrap();
        run_until(&engine, &observer, 3).await;

        assert_eq!(
            observer.events(),
            vec![
                Event::Queued(task.id.clone()),
                Event::Started(task.id.clone(), 1),
                Event::Completed(task.id.clone(), "ok".into()),
            ]
        );
        let stored = engine.get_task(&task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Succeeded);
        assert_eq!(stored.result_path.as_deref(), Some("tasks/task-1.md"));
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_deadline_failure_sequence() {
        let store = Arc::new(MemoryStore::new());
        let (engine, observer) = engine_with(store.clone(), Script::Deadline);
        let task = engine.enqueue(draft()).unwrap();
        run_until(&engine, &observer, 3).await;

        assert_eq!(observer.count(|e| matches!(e, Event::Completed(..))), 0);
        assert_eq!(observer.count(|e| matches!(e, Event::Failed(..))), 1);
        assert!(matches!(observer.events()[1], Event::Started(..)));
        let stored = engine.get_task(&task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.error_message.as_deref(), Some("context deadline exceeded"));
    }

    #[tokio::test]
    async fn test_queue_capacity_fifty() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _observer) = engine_with(store, Script::Hang);
        for _ in 0..50 {
            engine.enqueue(draft()).unwrap();
        }
        let err = engine.enqueue(draft()).unwrap_err();
        assert!(err.is_queue_full());
        assert_eq!(engine.queue_len(), 50);
    }

    #[tokio::test]
    async fn test_capacity_frees_after_dequeue() {
        let store = Arc::new(MemoryStore::new());
        let (engine, observer) = engine_with(store, Script::Hang);
        for _ in 0..50 {
            engine.enqueue(draft()).unwrap();
        }
        let cancel = CancellationToken::new();
        let pool = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.start(cancel).await })
        };
        // 50 queued + 1 started
        wait_for(&observer, 51).await;
        assert!(engine.enqueue(draft()).is_ok());
        assert!(engine.enqueue(draft()).unwrap_err().is_queue_full());
        cancel.cancel();
        pool.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_fails_in_flight_task() {
        let store = Arc::new(MemoryStore::new());
        let (engine, observer) = engine_with(store, Script::Hang);
        let first = engine.enqueue(draft()).unwrap();
        let second = engine.enqueue(draft()).unwrap();

        let cancel = CancellationToken::new();
        let pool = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.start(cancel).await })
        };
        wait_for(&observer, 3).await;
        cancel.cancel();
        pool.await.unwrap().unwrap();

        let failed = engine.get_task(&first.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(
            failed.error_message.as_deref(),
            Some("execution cancelled: runtime shutting down")
        );
        // never dequeued after cancellation
        assert_eq!(engine.get_task(&second.id).unwrap().status, TaskStatus::Queued);
        assert_eq!(engine.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _observer) = engine_with(store, Script::Succeed);
        let cancel = CancellationToken::new();
        let pool = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.start(cancel).await })
        };
        while !engine.is_running() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(engine.start(cancel.clone()).await, Err(LoomError::Config(_))));
        cancel.cancel();
        pool.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_retry_law() {
        let store = Arc::new(MemoryStore::new());
        let (engine, observer) = engine_with(store.clone(), Script::Deadline);
        let task = engine.enqueue(draft()).unwrap();
        run_until(&engine, &observer, 3).await;

        let before = engine.get_task(&task.id).unwrap();
        let retry = engine.retry(&task.id).unwrap();
        let after = engine.get_task(&task.id).unwrap();

        assert_ne!(retry.id, task.id);
        assert_eq!(retry.retry_of_task_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(retry.status, TaskStatus::Queued);
        assert_eq!(retry.prompt, before.prompt);
        assert_eq!(after.status, before.status);
        assert_eq!(after.error_message, before.error_message);
        assert_eq!(after.attempts, before.attempts);

        // only failed tasks retry
        assert!(matches!(engine.retry(&retry.id), Err(LoomError::NotRetryable { .. })));
        assert!(matches!(engine.retry("task-nope"), Err(LoomError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_persist_running_failure_skips_executor() {
        let store = Arc::new(FlakyStore::failing_on(TaskStatus::Running));
        let (engine, observer) = engine_with(store.clone(), Script::Succeed);
        let task = engine.enqueue(draft()).unwrap();
        run_until(&engine, &observer, 3).await;

        let events = observer.events();
        assert!(matches!(events[1], Event::Started(..)));
        assert!(matches!(&events[2], Event::Failed(_, msg) if msg.contains("persist running transition")));
        assert_eq!(observer.count(|e| matches!(e, Event::Completed(..))), 0);
        assert_eq!(engine.get_task(&task.id).unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_persist_completion_failure_marks_failed() {
        let store = Arc::new(FlakyStore::failing_on(TaskStatus::Succeeded));
        let (engine, observer) = engine_with(store.clone(), Script::Succeed);
        let task = engine.enqueue(draft()).unwrap();
        run_until(&engine, &observer, 3).await;

        assert_eq!(observer.count(|e| matches!(e, Event::Completed(..))), 0);
        let stored = engine.get_task(&task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error_message.unwrap().starts_with("persist completion:"));
    }

    #[tokio::test]
    async fn test_noop_executor_default() {
        let store = Arc::new(MemoryStore::new());
        let observer = Arc::new(RecordingObserver::default());
        let mut engine = TaskEngine::new(store, &config(2));
        engine.set_observer(observer.clone());
        let engine = Arc::new(engine);
        let task = engine.enqueue(draft()).unwrap();
        run_until(&engine, &observer, 3).await;
        assert_eq!(
            engine.get_task(&task.id).unwrap().result_summary.as_deref(),
            Some(crate::executor::NOOP_SUMMARY)
        );
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_break_processing() {
        struct Panicky;
        impl Observer for Panicky {
            fn on_task_started(&self, _task: &Task, _worker_id: usize) {
                panic!("dashboard crashed");
            }
        }
        let store = Arc::new(MemoryStore::new());
        let mut engine = TaskEngine::new(store, &config(1));
        engine.set_executor(Arc::new(ScriptedExecutor(Script::Succeed)));
        engine.set_observer(Arc::new(Panicky));
        let engine = Arc::new(engine);
        let task = engine.enqueue(draft()).unwrap();

        let cancel = CancellationToken::new();
        let pool = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.start(cancel).await })
        };
        for _ in 0..200 {
            if engine.get_task(&task.id).unwrap().status == TaskStatus::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        pool.await.unwrap().unwrap();
        assert_eq!(engine.get_task(&task.id).unwrap().status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_resume_queued_oldest_first() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut older = Task::from_draft(draft(), now - chrono::Duration::minutes(5)).unwrap();
        older.title = "older".into();
        let newer = Task::from_draft(draft(), now).unwrap();
        store.create_task(&newer).unwrap();
        store.create_task(&older).unwrap();

        let (engine, observer) = engine_with(store.clone(), Script::Succeed);
        assert_eq!(engine.resume_queued().unwrap(), 2);
        assert_eq!(engine.resume_queued().unwrap(), 0);
        assert_eq!(observer.events()[0], Event::Queued(older.id.clone()));
        assert_eq!(engine.queue_len(), 2);
    }

    #[tokio::test]
    async fn test_resume_admits_oldest_when_backlog_exceeds_capacity() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let backlog: Vec<Task> = (0..5)
            .map(|i| {
                let mut t = Task::from_draft(draft(), now - chrono::Duration::minutes(10 - i)).unwrap();
                t.title = format!("t{i}");
                t
            })
            .collect();
        for t in backlog.iter().rev() {
            store.create_task(t).unwrap();
        }

        let mut cfg = config(1);
        cfg.queue_capacity = Some(3);
        let engine = TaskEngine::new(store.clone(), &cfg);
        assert_eq!(engine.resume_queued().unwrap(), 3);

        let mut admitted = Vec::new();
        while let Some(task) = engine.queue.try_pop() {
            let running = task.started(1, Utc::now()).unwrap();
            store.update_task(&running, TaskStatus::Queued).unwrap();
            engine.queue.release(&task.id);
            admitted.push(task.title);
        }
        assert_eq!(admitted, vec!["t0", "t1", "t2"]);

        // the rest follows once there is room
        assert_eq!(engine.resume_queued().unwrap(), 2);
        assert_eq!(engine.queue_len(), 2);
    }

    #[tokio::test]
    async fn test_resume_picks_up_rows_written_elsewhere() {
        let store = Arc::new(MemoryStore::new());
        let (engine, observer) = engine_with(store.clone(), Script::Succeed);
        let cancel = CancellationToken::new();
        let pool = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.start(cancel).await })
        };

        // another process (e.g. the CLI) writes a queued row directly
        let outside = Task::from_draft(draft(), Utc::now()).unwrap();
        store.create_task(&outside).unwrap();
        let maintenance = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run_recovery_loop(cancel).await })
        };
        wait_for(&observer, 3).await;
        cancel.cancel();
        pool.await.unwrap().unwrap();
        maintenance.await.unwrap();

        assert_eq!(engine.get_task(&outside.id).unwrap().status, TaskStatus::Succeeded);
        assert_eq!(observer.count(|e| matches!(e, Event::Started(..))), 1);
    }

    #[tokio::test]
    async fn test_resume_skips_tasks_in_memory_or_in_flight() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _observer) = engine_with(store.clone(), Script::Succeed);
        let queued = engine.enqueue(draft()).unwrap();
        let picked = Task::from_draft(draft(), Utc::now()).unwrap();
        store.create_task(&picked).unwrap();
        hold(&engine, &picked);

        assert_eq!(engine.resume_queued().unwrap(), 0);
        assert!(engine.queue.contains(&queued.id));
        assert!(!engine.queue.contains(&picked.id));

        // released after a failed `running` write: picked up again
        engine.queue.release(&picked.id);
        assert_eq!(engine.resume_queued().unwrap(), 1);
        assert!(engine.queue.contains(&picked.id));
    }

    #[tokio::test]
    async fn test_observer_may_call_back_into_engine() {
        #[derive(Default)]
        struct QueueWatcher {
            engine: OnceLock<Weak<TaskEngine>>,
            seen: Mutex<Vec<usize>>,
        }
        impl Observer for QueueWatcher {
            fn on_task_queued(&self, _task: &Task) {
                if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                    self.seen.lock().unwrap().push(engine.queue_len());
                }
            }
        }

        let watcher = Arc::new(QueueWatcher::default());
        let mut engine = TaskEngine::new(Arc::new(MemoryStore::new()), &config(1));
        engine.set_observer(watcher.clone());
        let engine = Arc::new(engine);
        watcher.engine.set(Arc::downgrade(&engine)).unwrap();

        engine.enqueue(draft()).unwrap();
        engine.enqueue(draft()).unwrap();
        assert_eq!(*watcher.seen.lock().unwrap(), vec![0, 1]);
        assert_eq!(engine.queue_len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_and_workers_emit_each_event_once() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 25;
        let total = PRODUCERS * PER_PRODUCER;

        let store = Arc::new(MemoryStore::new());
        let observer = Arc::new(RecordingObserver::default());
        let mut engine = TaskEngine::new(
            store.clone(),
            &EngineConfig {
                concurrency: 4,
                queue_capacity: Some(total),
                noop_delay_ms: 0,
                ..Default::default()
            },
        );
        engine.set_executor(Arc::new(ScriptedExecutor(Script::Succeed)));
        engine.set_observer(observer.clone());
        let engine = Arc::new(engine);

        let cancel = CancellationToken::new();
        let pool = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.start(cancel).await })
        };
        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let engine = engine.clone();
            producers.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for i in 0..PER_PRODUCER {
                    let mut d = draft();
                    d.title = format!("p{p}-{i}");
                    ids.push(engine.enqueue(d).unwrap().id);
                    tokio::task::yield_now().await;
                }
                ids
            }));
        }
        let mut ids = Vec::new();
        for producer in producers {
            ids.extend(producer.await.unwrap());
        }
        for _ in 0..500 {
            if observer.count(|e| matches!(e, Event::Completed(..))) >= total {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        pool.await.unwrap().unwrap();

        let mut per_task: HashMap<String, [usize; 3]> = HashMap::new();
        let mut position: HashMap<String, Vec<usize>> = HashMap::new();
        for (at, event) in observer.events().into_iter().enumerate() {
            let (id, slot) = match event {
                Event::Queued(id) => (id, 0),
                Event::Started(id, worker) => {
                    assert!((1..=4).contains(&worker));
                    (id, 1)
                }
                Event::Completed(id, _) | Event::Failed(id, _) => (id, 2),
            };
            per_task.entry(id.clone()).or_default()[slot] += 1;
            position.entry(id).or_default().push(at);
        }
        assert_eq!(per_task.len(), total);
        for id in &ids {
            assert_eq!(per_task[id], [1, 1, 1], "events for {id}");
            let at = &position[id];
            assert!(at[0] < at[1] && at[1] < at[2], "out of order for {id}");
            assert_eq!(engine.get_task(id).unwrap().status, TaskStatus::Succeeded);
        }
        assert_eq!(engine.queue_stats().total_dequeued, total as u64);
    }

    #[tokio::test]
    async fn test_recover_stale_skips_in_flight() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _observer) = engine_with(store.clone(), Script::Succeed);
        let old = Utc::now() - chrono::Duration::hours(2);
        let orphan = Task::from_draft(draft(), old).unwrap();
        let held = Task::from_draft(draft(), old).unwrap();
        for t in [&orphan, &held] {
            store.create_task(t).unwrap();
            store.update_task(&t.started(9, old).unwrap(), TaskStatus::Queued).unwrap();
        }
        hold(&engine, &held);

        let recovered = engine.recover_stale(Utc::now()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, orphan.id);
        assert_eq!(engine.get_task(&held.id).unwrap().status, TaskStatus::Running);
        assert!(engine.recover_stale(Utc::now()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_objective_run_recorded_on_completion() {
        use crate::objectives::ObjectiveScheduler;
        use agentloom_core::config::SchedulerConfig;
        use agentloom_core::types::{ObjectiveDraft, TriggerType};

        let store = Arc::new(MemoryStore::new());
        let observer = Arc::new(RecordingObserver::default());
        let ledger = Arc::new(ObjectiveLedger::new(store.clone(), SchedulerConfig::default()));
        let mut engine = TaskEngine::new(store.clone(), &config(1));
        engine.set_executor(Arc::new(ScriptedExecutor(Script::Succeed)));
        engine.set_observer(observer.clone());
        engine.set_objective_ledger(ledger.clone());
        let engine = Arc::new(engine);
        let scheduler = ObjectiveScheduler::with_ledger(ledger, engine.clone());

        let now = Utc::now();
        let objective = scheduler
            .create_objective(
                ObjectiveDraft {
                    workspace_id: "ws_1".into(),
                    context_id: "ctx_1".into(),
                    title: "Inbox digest".into(),
                    prompt: "Summarize the inbox".into(),
                    trigger: TriggerType::Interval { every_secs: 60 },
                    timezone: None,
                    active: true,
                },
                now,
            )
            .unwrap();
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(scheduler.tick(later).unwrap().dispatched, 1);
        run_until(&engine, &observer, 3).await;

        let stored = store.get_objective(&objective.id).unwrap().unwrap();
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.success_count, 1);
        assert_eq!(stored.last_run_at, Some(later));
        let tasks = engine.list_tasks(&TaskFilter::default()).unwrap();
        assert_eq!(tasks[0].objective_id.as_deref(), Some(objective.id.as_str()));
        assert_eq!(tasks[0].kind, agentloom_core::types::TaskKind::Objective);
    }
}
