//! Per-path write serialization.
//!
//! Mutating operations on the same normalized path run strictly FIFO;
//! operations on different paths never block each other. Queue entries are
//! created lazily on first use and removed once the last waiter leaves, so
//! idle paths cost nothing.
//!
//! There is no timeout or cancellation: a closure that never returns starves
//! later waiters on that path. Higher layers own cancellation policy.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::debug;

use crate::ledger::normalize_path;

#[derive(Debug, Default)]
struct Turn {
    next_ticket: u64,
    now_serving: u64,
}

#[derive(Debug, Default)]
struct PathQueue {
    turn: Mutex<Turn>,
    ready: Condvar,
    /// Number of holders + waiters; maintained under the table lock.
    waiters: Mutex<usize>,
}

/// Registry of per-path FIFO queues.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<HashMap<String, Arc<PathQueue>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` once every previously queued operation on the same path has
    /// finished (success, error, or panic). The slot is released on every
    /// exit path before the next queued operation starts.
    pub fn with_lock<R>(&self, path: &Path, f: impl FnOnce() -> R) -> R {
        let key = normalize_path(path);
        let queue = self.checkin(&key);

        // Take a ticket, then wait for our turn. Tickets are issued in
        // arrival order, which is what makes the queue FIFO.
        {
            let mut turn = lock(&queue.turn);
            let ticket = turn.next_ticket;
            turn.next_ticket += 1;
            while turn.now_serving != ticket {
                debug!(path = %key, ticket, "waiting for write lock");
                turn = queue
                    .ready
                    .wait(turn)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }

        let _release = SlotGuard {
            manager: self,
            key: &key,
            queue: &queue,
        };
        f()
    }

    fn checkin(&self, key: &str) -> Arc<PathQueue> {
        let mut table = lock(&self.table);
        let queue = table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(PathQueue::default()))
            .clone();
        *lock(&queue.waiters) += 1;
        queue
    }

    fn checkout(&self, key: &str, queue: &Arc<PathQueue>) {
        // Advance the turn before touching the table so the next waiter can
        // proceed even while we prune.
        {
            let mut turn = lock(&queue.turn);
            turn.now_serving += 1;
        }
        queue.ready.notify_all();

        let mut table = lock(&self.table);
        let mut waiters = lock(&queue.waiters);
        *waiters -= 1;
        if *waiters == 0 {
            table.remove(key);
        }
    }

    /// Number of paths with live queues (contended or held right now).
    pub fn active_paths(&self) -> usize {
        lock(&self.table).len()
    }
}

/// Releases the path slot when dropped, so a panic inside the locked closure
/// cannot wedge the queue.
struct SlotGuard<'a> {
    manager: &'a LockManager,
    key: &'a str,
    queue: &'a Arc<PathQueue>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.manager.checkout(self.key, self.queue);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
