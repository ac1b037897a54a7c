//! Bounded FIFO task queue shared by producers and workers.
//!
//! State lives behind a single `std::sync::Mutex` so `push` never awaits:
//! it either admits the task or returns `QueueFull` immediately. The lock
//! is only held for bookkeeping; admission work runs against a reserved
//! slot with the lock released.
//! Workers park on a `Notify` until a task arrives or cancellation fires.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use agentloom_core::error::{LoomError, Result};
use agentloom_core::types::Task;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct QueueState {
    items: VecDeque<Task>,
    /// Slots promised to producers whose admit step is still running.
    reserved: usize,
    /// Handed to a worker and not yet released.
    taken: HashSet<String>,
    total_enqueued: u64,
    total_dequeued: u64,
}

/// Bounded FIFO of tasks awaiting a worker.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    available: Notify,
}

/// Queue statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub capacity: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                reserved: 0,
                taken: HashSet::new(),
                total_enqueued: 0,
                total_dequeued: 0,
            }),
            capacity: capacity.max(1),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|e| LoomError::Persistence(format!("queue lock poisoned: {e}")))
    }

    /// Admit a task at the tail.
    ///
    /// A slot is reserved first, then `admit` runs without the queue lock,
    /// then the task is pushed. If `admit` fails the slot is released and
    /// nothing is queued. No worker can see the task before `admit` returns,
    /// so the engine persists the `queued` record and fires `on_task_queued`
    /// there. `admit` may call back into the queue.
    pub fn push_with<F>(&self, task: Task, admit: F) -> Result<()>
    where
        F: FnOnce(&Task) -> Result<()>,
    {
        let mut slot = self.reserve()?;
        admit(&task)?;
        slot.commit(task)?;
        self.available.notify_one();
        Ok(())
    }

    fn reserve(&self) -> Result<Reservation<'_>> {
        let mut state = self.lock()?;
        if state.items.len() + state.reserved >= self.capacity {
            return Err(LoomError::QueueFull);
        }
        state.reserved += 1;
        Ok(Reservation {
            queue: self,
            held: true,
        })
    }

    pub fn push(&self, task: Task) -> Result<()> {
        self.push_with(task, |_| Ok(()))
    }

    /// Take the head of the queue, if any. Each task is handed out once and
    /// stays held until [`release`](Self::release).
    pub fn try_pop(&self) -> Option<Task> {
        let mut state = self.lock().ok()?;
        let task = state.items.pop_front()?;
        state.taken.insert(task.id.clone());
        state.total_dequeued += 1;
        Some(task)
    }

    /// A worker is done with a popped task.
    pub fn release(&self, task_id: &str) {
        if let Ok(mut state) = self.lock() {
            state.taken.remove(task_id);
        }
    }

    /// Wait for the next task. Returns `None` once `cancel` fires; a task is
    /// never dequeued after cancellation has been observed.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<Task> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(task) = self.try_pop() {
                return Some(task);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.available.notified() => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.lock()
            .map(|s| s.items.iter().any(|t| t.id == task_id))
            .unwrap_or(false)
    }

    /// Waiting in the queue or held by a worker.
    pub fn is_held(&self, task_id: &str) -> bool {
        self.lock()
            .map(|s| s.taken.contains(task_id) || s.items.iter().any(|t| t.id == task_id))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> QueueStats {
        match self.lock() {
            Ok(state) => QueueStats {
                queued: state.items.len(),
                capacity: self.capacity,
                total_enqueued: state.total_enqueued,
                total_dequeued: state.total_dequeued,
            },
            Err(_) => QueueStats {
                queued: 0,
                capacity: self.capacity,
                total_enqueued: 0,
                total_dequeued: 0,
            },
        }
    }
}

/// A slot counted against capacity until committed or dropped.
struct Reservation<'a> {
    queue: &'a TaskQueue,
    held: bool,
}

impl Reservation<'_> {
    fn commit(&mut self, task: Task) -> Result<()> {
        let mut state = self.queue.lock()?;
        state.reserved = state.reserved.saturating_sub(1);
        self.held = false;
        state.items.push_back(task);
        state.total_enqueued += 1;
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        if let Ok(mut state) = self.queue.lock() {
            state.reserved = state.reserved.saturating_sub(1);
        }
    }
}
