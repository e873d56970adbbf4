//! Bounded background task queue.
//!
//! Memory extraction, episode summarization, and embedding backfill run as
//! fire-and-forget work after the user-visible reply is already out. The
//! queue caps how many run at once; when full, new work is dropped rather
//! than queued without bound. Callers never await completion.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::Result;

/// In-flight task ceiling when none is given.
pub const DEFAULT_TASK_LIMIT: usize = 8;

#[derive(Debug, Default)]
struct Counters {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Snapshot of queue activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
}

/// Best-effort background executor. Clones share the same limit and counters.
#[derive(Clone)]
pub struct TaskQueue {
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl TaskQueue {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Launch a task if a slot is free. Returns `false` when the queue is
    /// saturated and the task was dropped. Task failures are logged and
    /// counted, never propagated.
    pub fn spawn<F>(&self, label: &'static str, future: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(task = label, "background queue full, task dropped");
            return false;
        };
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);

        let counters = Arc::clone(&self.counters);
        tokio::spawn(async move {
            let result = future.await;
            drop(permit);
            match result {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(task = label, error = %e, "background task failed");
                }
            }
        });
        true
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_LIMIT)
    }
}
