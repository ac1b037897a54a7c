//! # Agentloom Scheduler
//!
//! Task orchestration runtime: a bounded FIFO queue drained by a fixed
//! worker pool, objectives that turn schedules and events into tasks, and
//! result notifications routed back to the originating channel.
//!
//! ## Design Principles
//! - One enqueue path for every producer (API, channels, scheduler, retry)
//! - The store is the source of truth; memory only holds queued/running work
//! - Every status change is a guarded write: queued → running → terminal
//! - SQLite persistence, in-memory store for tests and ephemeral runs
//!
//! ## Architecture
//! ```text
//! Producers ──enqueue──► TaskEngine
//!   │                      ├── TaskQueue (bounded FIFO, capacity = workers × 50)
//!   │                      ├── Workers 1..N → Executor (noop | http)
//!   │                      │     └── TaskLifecycle → TaskStore (sqlite | memory)
//!   │                      ├── Observers (tracing, activity log, composite)
//!   │                      ├── StaleTaskRecovery (orphaned `running` rows)
//!   │                      └── on terminal:
//!   │                            ├── NotificationDispatcher → Telegram / Webhook / Log
//!   │                            └── ObjectiveLedger (run counters, backoff, auto-pause)
//!   │
//! ObjectiveScheduler (tokio interval)
//!   ├── Interval: every 300s → "Check inbox"
//!   ├── Cron: "0 8 * * *" → "Morning digest"
//!   ├── Once: "2026-11-02T15:00:00Z" → "Prepare meeting notes"
//!   └── Event: "markdown.updated" → "Reindex changed note"
//! ```

pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod lifecycle;
pub mod notify;
pub mod objectives;
pub mod observer;
pub mod persistence;
pub mod queue;
pub mod recovery;
pub mod store;

#[cfg(test)]
mod testutil;

pub use engine::{TaskEngine, TaskSink};
pub use notify::{DeliveryTarget, NotificationDispatcher, NotifyPolicy};
pub use objectives::{ObjectiveLedger, ObjectiveScheduler, TickReport};
pub use persistence::SqliteStore;
pub use store::MemoryStore;
