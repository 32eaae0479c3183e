//! Bounded worker pool: admits tasks up to a worker-count limit and a
//! cumulative memory budget, blocking the admitter (not the caller's whole
//! task) until room is available.
//!
//! Grounded in the connection's own credit-wait idiom (see
//! [`crate::schemes::tunnel`]): a `Mutex`-guarded counter paired with a
//! `Notify` that wakes every waiter whenever the counter moves, rather than a
//! bespoke wait queue.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{future::Future, sync::Arc};

use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// How [`BoundedWorkerPool::terminate`] should treat work that is still
/// running or queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    /// Wait for every admitted task to finish on its own.
    Graceful,
    /// Cancel the pool's token (tasks observe it cooperatively) and still
    /// wait for them to unwind.
    Immediate,
}

struct MemoryBudget {
    max: i64,
    used: Mutex<i64>,
    freed: Notify,
}

impl MemoryBudget {
    fn new(max: i64) -> Self {
        Self {
            max,
            used: Mutex::new(0),
            freed: Notify::new(),
        }
    }

    /// Blocks until `cost` bytes are available, or the deadline passes.
    /// Returns `false` on timeout or when `cost` alone exceeds the budget.
    async fn reserve(&self, cost: i64, deadline: Option<tokio::time::Instant>) -> bool {
        if cost > self.max {
            return false;
        }
        loop {
            {
                let mut used = self.used.lock().await;
                if *used + cost <= self.max {
                    *used += cost;
                    return true;
                }
            }
            let notified = self.freed.notified();
            match deadline {
                None => notified.await,
                Some(dl) => {
                    if tokio::time::timeout_at(dl, notified).await.is_err() {
                        return false;
                    }
                },
            }
        }
    }

    async fn release(&self, cost: i64) {
        let mut used = self.used.lock().await;
        *used -= cost;
        drop(used);
        self.freed.notify_waiters();
    }
}

/// Executes inbound work (broadcast handlers, request handlers, topic event
/// handlers) without letting an application handler starve the reader task or
/// exhaust memory with unbounded buffering.
#[derive(Clone)]
pub struct BoundedWorkerPool {
    semaphore: Arc<Semaphore>,
    memory: Arc<MemoryBudget>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl BoundedWorkerPool {
    pub fn new(max_workers: usize, max_memory: i64) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            memory: Arc::new(MemoryBudget::new(max_memory)),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Admits `task` if a worker slot and `cost` bytes of budget become
    /// available within `timeout_ms` (0 = wait forever). `task` receives a
    /// child cancellation token it should honour if it runs long; the pool
    /// itself never forcibly aborts a running task on `Graceful` termination.
    ///
    /// Returns `false` if `cost` is negative, exceeds the pool's total
    /// budget, or admission did not complete before the deadline.
    pub async fn schedule<F, Fut>(&self, cost: i64, timeout_ms: u64, task: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if cost < 0 {
            return false;
        }
        let deadline = (timeout_ms > 0)
            .then(|| tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms));

        if !self.memory.reserve(cost, deadline).await {
            return false;
        }

        let permit = {
            let acquire = self.semaphore.clone().acquire_owned();
            match deadline {
                None => acquire.await.ok(),
                Some(dl) => tokio::time::timeout_at(dl, acquire).await.ok().and_then(Result::ok),
            }
        };
        let Some(permit) = permit else {
            self.memory.release(cost).await;
            return false;
        };

        if self.cancel.is_cancelled() {
            drop(permit);
            self.memory.release(cost).await;
            return false;
        }

        let memory = self.memory.clone();
        let child = self.cancel.child_token();
        self.tracker.spawn(async move {
            task(child).await;
            drop(permit);
            memory.release(cost).await;
        });
        true
    }

    pub async fn terminate(&self, mode: TerminateMode) {
        if mode == TerminateMode::Immediate {
            self.cancel.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}
