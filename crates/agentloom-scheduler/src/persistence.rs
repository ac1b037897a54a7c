//! SQLite-backed persistence for tasks and objectives.
//! Survives restarts; the task status column doubles as the transition guard.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use agentloom_core::error::{LoomError, Result};
use agentloom_core::traits::TaskStore;
use agentloom_core::types::{
    Objective, ObjectiveRunOutcome, Task, TaskFilter, TaskOrigin, TaskStatus, TriggerType,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

const TASK_COLUMNS: &str = "id, workspace_id, context_id, kind, title, prompt, status, attempts, \
     result_path, result_summary, error_message, retry_of_task_id, objective_id, origin, \
     worker_id, created_at, updated_at, started_at, finished_at, run_key";

const OBJECTIVE_COLUMNS: &str = "id, workspace_id, context_id, title, prompt, trigger, timezone, \
     active, run_count, success_count, failure_count, consecutive_failures, avg_run_duration_ms, \
     next_run_at, last_run_at, last_error, auto_paused_reason, created_at, updated_at";

/// SQLite-backed [`TaskStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("open database"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("open database"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(db_err("set busy timeout"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LoomError::Persistence(format!("connection poisoned: {e}")))
    }

    /// Create tables and indexes.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                context_id TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'general',
                title TEXT NOT NULL,
                prompt TEXT NOT NULL,
                status TEXT NOT NULL,            -- queued, running, succeeded, failed
                attempts INTEGER NOT NULL DEFAULT 0,
                result_path TEXT,
                result_summary TEXT,
                error_message TEXT,
                retry_of_task_id TEXT,
                objective_id TEXT,
                origin TEXT,                     -- JSON: {connector, external_id, user_id}
                worker_id INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                run_key TEXT                     -- objective run idempotency key
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status_updated ON tasks(status, updated_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_workspace_created ON tasks(workspace_id, created_at);

            CREATE TABLE IF NOT EXISTS objectives (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                context_id TEXT NOT NULL,
                title TEXT NOT NULL,
                prompt TEXT NOT NULL,
                trigger_type TEXT NOT NULL,      -- interval, cron, once, event
                trigger TEXT NOT NULL,           -- JSON, tagged by type
                event_key TEXT,                  -- set for event triggers only
                timezone TEXT NOT NULL DEFAULT 'UTC',
                active INTEGER NOT NULL DEFAULT 1,
                run_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                avg_run_duration_ms INTEGER NOT NULL DEFAULT 0,
                next_run_at TEXT,
                last_run_at TEXT,
                last_error TEXT,
                auto_paused_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_objectives_due ON objectives(active, next_run_at);
            CREATE INDEX IF NOT EXISTS idx_objectives_event ON objectives(workspace_id, event_key);
         ",
        )
        .map_err(db_err("migration"))?;

        // Databases created before run keys existed.
        let has_run_key: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('tasks') WHERE name = 'run_key'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(db_err("inspect tasks table"))?
            > 0;
        if !has_run_key {
            conn.execute_batch("ALTER TABLE tasks ADD COLUMN run_key TEXT;")
                .map_err(db_err("add run_key column"))?;
        }
        conn.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_run_key ON tasks(run_key)
             WHERE run_key IS NOT NULL;",
        )
        .map_err(db_err("create run_key index"))
    }

    fn query_tasks(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Task>> {
        let mut stmt = conn.prepare(sql).map_err(db_err("prepare task query"))?;
        let rows = stmt
            .query_map(params, TaskRow::read)
            .map_err(db_err("query tasks"))?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(db_err("read task"))?.into_task()?);
        }
        Ok(tasks)
    }

    fn query_objectives(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Objective>> {
        let mut stmt = conn.prepare(sql).map_err(db_err("prepare objective query"))?;
        let rows = stmt
            .query_map(params, ObjectiveRow::read)
            .map_err(db_err("query objectives"))?;
        let mut objectives = Vec::new();
        for row in rows {
            objectives.push(row.map_err(db_err("read objective"))?.into_objective()?);
        }
        Ok(objectives)
    }

    fn load_objective(conn: &Connection, id: &str) -> Result<Option<Objective>> {
        conn.query_row(
            &format!("SELECT {OBJECTIVE_COLUMNS} FROM objectives WHERE id = ?1"),
            params![id],
            ObjectiveRow::read,
        )
        .optional()
        .map_err(db_err("get objective"))?
        .map(ObjectiveRow::into_objective)
        .transpose()
    }

    fn write_objective(conn: &Connection, objective: &Objective, insert: bool) -> Result<usize> {
        let trigger = serde_json::to_string(&objective.trigger)
            .map_err(|e| LoomError::Persistence(format!("encode trigger: {e}")))?;
        let event_key = match &objective.trigger {
            TriggerType::Event { key } => Some(key.as_str()),
            _ => None,
        };
        let sql = if insert {
            "INSERT INTO objectives
             (id, workspace_id, context_id, title, prompt, trigger_type, trigger, event_key,
              timezone, active, run_count, success_count, failure_count, consecutive_failures,
              avg_run_duration_ms, next_run_at, last_run_at, last_error, auto_paused_reason,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21)"
        } else {
            "UPDATE objectives SET
                workspace_id = ?2, context_id = ?3, title = ?4, prompt = ?5, trigger_type = ?6,
                trigger = ?7, event_key = ?8, timezone = ?9, active = ?10, run_count = ?11,
                success_count = ?12, failure_count = ?13, consecutive_failures = ?14,
                avg_run_duration_ms = ?15, next_run_at = ?16, last_run_at = ?17,
                last_error = ?18, auto_paused_reason = ?19, created_at = ?20, updated_at = ?21
             WHERE id = ?1"
        };
        conn.execute(
            sql,
            params![
                objective.id,
                objective.workspace_id,
                objective.context_id,
                objective.title,
                objective.prompt,
                objective.trigger.name(),
                trigger,
                event_key,
                objective.timezone,
                objective.active as i32,
                objective.run_count as i64,
                objective.success_count as i64,
                objective.failure_count as i64,
                objective.consecutive_failures as i64,
                objective.avg_run_duration_ms as i64,
                objective.next_run_at.map(ts),
                objective.last_run_at.map(ts),
                objective.last_error,
                objective.auto_paused_reason,
                ts(objective.created_at),
                ts(objective.updated_at),
            ],
        )
        .map_err(|e| {
            if is_constraint(&e) {
                LoomError::Conflict(format!("objective {} already exists", objective.id))
            } else {
                LoomError::Persistence(format!("save objective: {e}"))
            }
        })
    }
}

impl TaskStore for SqliteStore {
    // ─── Tasks ──────────────────────────────────────────────

    fn create_task(&self, task: &Task) -> Result<()> {
        let origin = encode_origin(task.origin.as_ref())?;
        self.lock()?
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                             ?16, ?17, ?18, ?19, ?20)"
                ),
                params![
                    task.id,
                    task.workspace_id,
                    task.context_id,
                    task.kind.as_str(),
                    task.title,
                    task.prompt,
                    task.status.as_str(),
                    task.attempts as i64,
                    task.result_path,
                    task.result_summary,
                    task.error_message,
                    task.retry_of_task_id,
                    task.objective_id,
                    origin,
                    task.worker_id.map(|w| w as i64),
                    ts(task.created_at),
                    ts(task.updated_at),
                    task.started_at.map(ts),
                    task.finished_at.map(ts),
                    task.run_key,
                ],
            )
            .map_err(|e| {
                if is_constraint(&e) && is_run_key_violation(&e) {
                    LoomError::RunAlreadyQueued(task.run_key.clone().unwrap_or_default())
                } else if is_constraint(&e) {
                    LoomError::Conflict(format!("task {} already exists", task.id))
                } else {
                    LoomError::Persistence(format!("insert task: {e}"))
                }
            })?;
        Ok(())
    }

    fn update_task(&self, task: &Task, expected: TaskStatus) -> Result<()> {
        let origin = encode_origin(task.origin.as_ref())?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET
                    workspace_id = ?2, context_id = ?3, kind = ?4, title = ?5, prompt = ?6,
                    status = ?7, attempts = ?8, result_path = ?9, result_summary = ?10,
                    error_message = ?11, retry_of_task_id = ?12, objective_id = ?13,
                    origin = ?14, worker_id = ?15, created_at = ?16, updated_at = ?17,
                    started_at = ?18, finished_at = ?19
                 WHERE id = ?1 AND status = ?20",
                params![
                    task.id,
                    task.workspace_id,
                    task.context_id,
                    task.kind.as_str(),
                    task.title,
                    task.prompt,
                    task.status.as_str(),
                    task.attempts as i64,
                    task.result_path,
                    task.result_summary,
                    task.error_message,
                    task.retry_of_task_id,
                    task.objective_id,
                    origin,
                    task.worker_id.map(|w| w as i64),
                    ts(task.created_at),
                    ts(task.updated_at),
                    task.started_at.map(ts),
                    task.finished_at.map(ts),
                    expected.as_str(),
                ],
            )
            .map_err(db_err("update task"))?;
        if changed > 0 {
            return Ok(());
        }

        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![task.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("read task status"))?;
        match current {
            Some(status) => Err(LoomError::Conflict(format!(
                "task {} is {status}, expected {expected}",
                task.id
            ))),
            None => Err(LoomError::TaskNotFound(task.id.clone())),
        }
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            TaskRow::read,
        )
        .optional()
        .map_err(db_err("get task"))?
        .map(TaskRow::into_task)
        .transpose()
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        Self::query_tasks(
            &conn,
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE (?1 IS NULL OR workspace_id = ?1) AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3"
            ),
            params![
                filter.workspace_id,
                filter.status.map(|s| s.as_str()),
                filter.effective_limit() as i64,
            ],
        )
    }

    fn list_queued_oldest(&self, limit: usize) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        Self::query_tasks(
            &conn,
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE status = 'queued'
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    fn list_stale_running(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        Self::query_tasks(
            &conn,
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE status = 'running' AND updated_at < ?1
                 ORDER BY updated_at ASC, id ASC
                 LIMIT ?2"
            ),
            params![ts(older_than), limit as i64],
        )
    }

    // ─── Objectives ─────────────────────────────────────────

    fn create_objective(&self, objective: &Objective) -> Result<()> {
        let conn = self.lock()?;
        Self::write_objective(&conn, objective, true)?;
        Ok(())
    }

    fn update_objective(&self, objective: &Objective) -> Result<()> {
        let conn = self.lock()?;
        if Self::write_objective(&conn, objective, false)? == 0 {
            return Err(LoomError::ObjectiveNotFound(objective.id.clone()));
        }
        Ok(())
    }

    fn get_objective(&self, id: &str) -> Result<Option<Objective>> {
        let conn = self.lock()?;
        Self::load_objective(&conn, id)
    }

    fn list_objectives(&self, workspace_id: Option<&str>) -> Result<Vec<Objective>> {
        let conn = self.lock()?;
        Self::query_objectives(
            &conn,
            &format!(
                "SELECT {OBJECTIVE_COLUMNS} FROM objectives
                 WHERE (?1 IS NULL OR workspace_id = ?1)
                 ORDER BY created_at ASC, id ASC"
            ),
            params![workspace_id],
        )
    }

    fn delete_objective(&self, id: &str) -> Result<bool> {
        let deleted = self
            .lock()?
            .execute("DELETE FROM objectives WHERE id = ?1", params![id])
            .map_err(db_err("delete objective"))?;
        Ok(deleted > 0)
    }

    fn list_due_objectives(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Objective>> {
        let conn = self.lock()?;
        Self::query_objectives(
            &conn,
            &format!(
                "SELECT {OBJECTIVE_COLUMNS} FROM objectives
                 WHERE active = 1 AND trigger_type != 'event'
                   AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY next_run_at ASC, id ASC
                 LIMIT ?2"
            ),
            params![ts(now), limit as i64],
        )
    }

    fn list_event_objectives(
        &self,
        workspace_id: &str,
        event_key: &str,
        limit: usize,
    ) -> Result<Vec<Objective>> {
        let conn = self.lock()?;
        Self::query_objectives(
            &conn,
            &format!(
                "SELECT {OBJECTIVE_COLUMNS} FROM objectives
                 WHERE active = 1 AND workspace_id = ?1 AND event_key = ?2
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?3"
            ),
            params![workspace_id, event_key, limit as i64],
        )
    }

    fn record_objective_run(&self, id: &str, outcome: &ObjectiveRunOutcome) -> Result<Objective> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("begin transaction"))?;
        let mut objective = Self::load_objective(&tx, id)?
            .ok_or_else(|| LoomError::ObjectiveNotFound(id.to_string()))?;
        objective.apply_run_outcome(outcome);
        Self::write_objective(&tx, &objective, false)?;
        tx.commit().map_err(db_err("commit objective run"))?;
        Ok(objective)
    }
}

// ─── Row mapping ────────────────────────────────────────────

struct TaskRow {
    id: String,
    workspace_id: String,
    context_id: String,
    kind: String,
    title: String,
    prompt: String,
    status: String,
    attempts: i64,
    result_path: Option<String>,
    result_summary: Option<String>,
    error_message: Option<String>,
    retry_of_task_id: Option<String>,
    objective_id: Option<String>,
    origin: Option<String>,
    worker_id: Option<i64>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    run_key: Option<String>,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            context_id: row.get(2)?,
            kind: row.get(3)?,
            title: row.get(4)?,
            prompt: row.get(5)?,
            status: row.get(6)?,
            attempts: row.get(7)?,
            result_path: row.get(8)?,
            result_summary: row.get(9)?,
            error_message: row.get(10)?,
            retry_of_task_id: row.get(11)?,
            objective_id: row.get(12)?,
            origin: row.get(13)?,
            worker_id: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
            started_at: row.get(17)?,
            finished_at: row.get(18)?,
            run_key: row.get(19)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let origin = match self.origin.as_deref().filter(|o| !o.is_empty()) {
            Some(raw) => Some(serde_json::from_str::<TaskOrigin>(raw).map_err(|e| {
                LoomError::Persistence(format!("decode origin of task {}: {e}", self.id))
            })?),
            None => None,
        };
        Ok(Task {
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            attempts: self.attempts.max(0) as u32,
            worker_id: self.worker_id.map(|w| w.max(0) as usize),
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
            origin,
            id: self.id,
            workspace_id: self.workspace_id,
            context_id: self.context_id,
            title: self.title,
            prompt: self.prompt,
            result_path: self.result_path,
            result_summary: self.result_summary,
            error_message: self.error_message,
            retry_of_task_id: self.retry_of_task_id,
            objective_id: self.objective_id,
            run_key: self.run_key,
        })
    }
}

struct ObjectiveRow {
    id: String,
    workspace_id: String,
    context_id: String,
    title: String,
    prompt: String,
    trigger: String,
    timezone: String,
    active: i64,
    run_count: i64,
    success_count: i64,
    failure_count: i64,
    consecutive_failures: i64,
    avg_run_duration_ms: i64,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    last_error: Option<String>,
    auto_paused_reason: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ObjectiveRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            context_id: row.get(2)?,
            title: row.get(3)?,
            prompt: row.get(4)?,
            trigger: row.get(5)?,
            timezone: row.get(6)?,
            active: row.get(7)?,
            run_count: row.get(8)?,
            success_count: row.get(9)?,
            failure_count: row.get(10)?,
            consecutive_failures: row.get(11)?,
            avg_run_duration_ms: row.get(12)?,
            next_run_at: row.get(13)?,
            last_run_at: row.get(14)?,
            last_error: row.get(15)?,
            auto_paused_reason: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    fn into_objective(self) -> Result<Objective> {
        let trigger: TriggerType = serde_json::from_str(&self.trigger).map_err(|e| {
            LoomError::Persistence(format!("decode trigger of objective {}: {e}", self.id))
        })?;
        Ok(Objective {
            trigger,
            active: self.active != 0,
            run_count: self.run_count.max(0) as u64,
            success_count: self.success_count.max(0) as u64,
            failure_count: self.failure_count.max(0) as u64,
            consecutive_failures: self.consecutive_failures.max(0) as u32,
            avg_run_duration_ms: self.avg_run_duration_ms.max(0) as u64,
            next_run_at: self.next_run_at.as_deref().map(parse_ts).transpose()?,
            last_run_at: self.last_run_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            workspace_id: self.workspace_id,
            context_id: self.context_id,
            title: self.title,
            prompt: self.prompt,
            timezone: self.timezone,
            last_error: self.last_error,
            auto_paused_reason: self.auto_paused_reason,
        })
    }
}

/// Fixed-width UTC timestamps keep lexical and chronological order identical.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| LoomError::Persistence(format!("invalid timestamp '{raw}': {e}")))
}

fn encode_origin(origin: Option<&TaskOrigin>) -> Result<Option<String>> {
    origin
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| LoomError::Persistence(format!("encode origin: {e}")))
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> LoomError {
    move |e| LoomError::Persistence(format!("{context}: {e}"))
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

fn is_run_key_violation(e: &rusqlite::Error) -> bool {
    e.to_string().contains("tasks.run_key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloom_core::types::{ObjectiveDraft, TaskDraft, TaskResult};

    fn temp_db() -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("agentloom-test-{}", uuid::Uuid::new_v4()))
            .join("agentloom.db")
    }

    fn task(ws: &str, created_at: DateTime<Utc>) -> Task {
        let origin = TaskOrigin {
            connector: "telegram".into(),
            external_id: "42".into(),
            user_id: None,
        };
        Task::from_draft(
            TaskDraft::new(ws, "ctx_1", "Collect docs", "Index docs").with_origin(origin),
            created_at,
        )
        .unwrap()
    }

    fn objective(trigger: TriggerType) -> Objective {
        Objective::from_draft(
            ObjectiveDraft {
                workspace_id: "ws_1".into(),
                context_id: "ctx_1".into(),
                title: "Digest".into(),
                prompt: "Summarize".into(),
                trigger,
                timezone: None,
                active: true,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_task_survives_reopen() {
        let path = temp_db();
        let t = task("ws_1", Utc::now());
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_task(&t).unwrap();
            let running = t.started(2, Utc::now()).unwrap();
            store.update_task(&running, TaskStatus::Queued).unwrap();
            let done = running
                .succeeded(&TaskResult::new("ok").with_artifact("tasks/a.md"), Utc::now())
                .unwrap();
            store.update_task(&done, TaskStatus::Running).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get_task(&t.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Succeeded);
        assert_eq!(loaded.attempts, 1);
        assert_eq!(loaded.worker_id, Some(2));
        assert_eq!(loaded.result_path.as_deref(), Some("tasks/a.md"));
        assert_eq!(loaded.origin, t.origin);
        assert_eq!(loaded.created_at, t.created_at);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_guarded_update() {
        let store = SqliteStore::open_in_memory().unwrap();
        let t = task("ws_1", Utc::now());
        store.create_task(&t).unwrap();
        assert!(matches!(store.create_task(&t), Err(LoomError::Conflict(_))));

        let running = t.started(1, Utc::now()).unwrap();
        store.update_task(&running, TaskStatus::Queued).unwrap();
        // second writer loses
        assert!(matches!(
            store.update_task(&running, TaskStatus::Queued),
            Err(LoomError::Conflict(_))
        ));

        let ghost = task("ws_1", Utc::now());
        assert!(matches!(
            store.update_task(&ghost, TaskStatus::Queued),
            Err(LoomError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_run_key_unique_across_reopen() {
        let path = temp_db();
        let draft = TaskDraft::new("ws_1", "ctx_1", "Digest", "Summarize")
            .with_run_key("objective:obj-1:1767225600");
        let first = Task::from_draft(draft.clone(), Utc::now()).unwrap();
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_task(&first).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let second = Task::from_draft(draft, Utc::now()).unwrap();
        assert!(matches!(
            store.create_task(&second),
            Err(LoomError::RunAlreadyQueued(key)) if key == "objective:obj-1:1767225600"
        ));
        assert_eq!(
            store.get_task(&first.id).unwrap().unwrap().run_key,
            first.run_key
        );
        // keyless tasks are unconstrained
        store.create_task(&task("ws_1", Utc::now())).unwrap();
        store.create_task(&task("ws_1", Utc::now())).unwrap();
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_adds_run_key_to_old_schema() {
        let path = temp_db();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE tasks (
                    id TEXT PRIMARY KEY, workspace_id TEXT NOT NULL, context_id TEXT NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'general', title TEXT NOT NULL,
                    prompt TEXT NOT NULL, status TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0, result_path TEXT, result_summary TEXT,
                    error_message TEXT, retry_of_task_id TEXT, objective_id TEXT, origin TEXT,
                    worker_id INTEGER, created_at TEXT NOT NULL, updated_at TEXT NOT NULL,
                    started_at TEXT, finished_at TEXT
                );",
            )
            .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let t = Task::from_draft(
            TaskDraft::new("ws_1", "ctx_1", "Digest", "Summarize").with_run_key("k1"),
            Utc::now(),
        )
        .unwrap();
        store.create_task(&t).unwrap();
        assert_eq!(store.get_task(&t.id).unwrap().unwrap().run_key.as_deref(), Some("k1"));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_queued_oldest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let tasks: Vec<Task> = (0..5)
            .map(|i| task("ws_1", now - chrono::Duration::minutes(10 - i)))
            .collect();
        for t in tasks.iter().rev() {
            store.create_task(t).unwrap();
        }
        store
            .update_task(&tasks[0].started(1, now).unwrap(), TaskStatus::Queued)
            .unwrap();

        let ids: Vec<String> = store
            .list_queued_oldest(3)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![tasks[1].id.clone(), tasks[2].id.clone(), tasks[3].id.clone()]);
    }

    #[test]
    fn test_list_tasks_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let old = task("ws_1", now - chrono::Duration::minutes(5));
        let new = task("ws_1", now);
        let other = task("ws_2", now);
        for t in [&old, &new, &other] {
            store.create_task(t).unwrap();
        }

        let filter = TaskFilter {
            workspace_id: Some("ws_1".into()),
            ..Default::default()
        };
        let listed = store.list_tasks(&filter).unwrap();
        assert_eq!(
            listed.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec![new.id.as_str(), old.id.as_str()]
        );
        assert_eq!(store.list_tasks(&TaskFilter::status(TaskStatus::Queued)).unwrap().len(), 3);
        assert!(store.list_tasks(&TaskFilter::status(TaskStatus::Failed)).unwrap().is_empty());
    }

    #[test]
    fn test_stale_running_query() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let stale = task("ws_1", now - chrono::Duration::hours(2));
        let fresh = task("ws_1", now);
        store.create_task(&stale).unwrap();
        store.create_task(&fresh).unwrap();
        store
            .update_task(&stale.started(1, stale.created_at).unwrap(), TaskStatus::Queued)
            .unwrap();
        store
            .update_task(&fresh.started(1, now).unwrap(), TaskStatus::Queued)
            .unwrap();

        let found = store
            .list_stale_running(now - chrono::Duration::minutes(10), 100)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stale.id);
    }

    #[test]
    fn test_objective_queries() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut due = objective(TriggerType::Interval { every_secs: 60 });
        due.next_run_at = Some(now - chrono::Duration::seconds(1));
        let mut later = objective(TriggerType::Cron {
            expression: "0 8 * * *".into(),
        });
        later.next_run_at = Some(now + chrono::Duration::hours(1));
        let event = objective(TriggerType::Event {
            key: "markdown.updated".into(),
        });
        for o in [&due, &later, &event] {
            store.create_objective(o).unwrap();
        }

        let found = store.list_due_objectives(now, 20).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], due);

        let events = store
            .list_event_objectives("ws_1", "markdown.updated", 20)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger, event.trigger);
        assert!(store.list_event_objectives("ws_2", "markdown.updated", 20).unwrap().is_empty());

        let mut paused = due.clone();
        paused.active = false;
        store.update_objective(&paused).unwrap();
        assert!(store.list_due_objectives(now, 20).unwrap().is_empty());

        assert_eq!(store.list_objectives(Some("ws_1")).unwrap().len(), 3);
        assert!(store.delete_objective(&later.id).unwrap());
        assert!(!store.delete_objective(&later.id).unwrap());
        assert!(matches!(
            store.update_objective(&later),
            Err(LoomError::ObjectiveNotFound(_))
        ));
    }

    #[test]
    fn test_record_objective_run() {
        let store = SqliteStore::open_in_memory().unwrap();
        let o = objective(TriggerType::Interval { every_secs: 60 });
        store.create_objective(&o).unwrap();
        let now = Utc::now();

        store
            .record_objective_run(&o.id, &ObjectiveRunOutcome::failure(now, 100, "boom"))
            .unwrap();
        let updated = store
            .record_objective_run(&o.id, &ObjectiveRunOutcome::success(now, 300))
            .unwrap();
        assert_eq!(updated.run_count, 2);
        assert_eq!(updated.success_count + updated.failure_count, 2);
        assert_eq!(updated.avg_run_duration_ms, 200);
        assert_eq!(store.get_objective(&o.id).unwrap().unwrap(), updated);

        assert!(matches!(
            store.record_objective_run("obj-missing", &ObjectiveRunOutcome::success(now, 1)),
            Err(LoomError::ObjectiveNotFound(_))
        ));
    }
}
