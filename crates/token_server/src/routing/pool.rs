//! Bounded dispatch pool for out-of-band token handling.
//!
//! Tokens that request `spawnThread` execution route here instead of on the
//! engine's dispatch task. Concurrency is bounded by a semaphore, the wait
//! queue is bounded by a counter, and shutdown drains orderly within a
//! grace period before force-cancelling what remains.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::DispatchSettings;

/// Bounded executor for pooled token handlers.
pub struct DispatchPool {
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    max_queue: usize,
    tasks: Mutex<JoinSet<()>>,
    grace: Duration,
}

impl DispatchPool {
    /// Creates a pool from the dispatch settings.
    pub fn new(settings: &DispatchSettings) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(settings.max_tasks)),
            waiting: Arc::new(AtomicUsize::new(0)),
            max_queue: settings.max_queue,
            tasks: Mutex::new(JoinSet::new()),
            grace: Duration::from_millis(settings.shutdown_grace_ms),
        }
    }

    /// Submits a handler. Returns `false` when the wait queue is full and
    /// the work was refused.
    pub fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.waiting.load(Ordering::Acquire) >= self.max_queue {
            warn!("🚦 Dispatch pool queue full, refusing pooled token");
            return false;
        }
        self.waiting.fetch_add(1, Ordering::AcqRel);
        let permits = self.permits.clone();
        let waiting = self.waiting.clone();
        self.tasks.lock().unwrap().spawn(async move {
            let permit = permits.acquire().await;
            waiting.fetch_sub(1, Ordering::AcqRel);
            let Ok(_permit) = permit else {
                // Pool shut down while this handler waited.
                return;
            };
            fut.await;
        });
        true
    }

    /// Handlers currently waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Drains the pool: orderly within the grace period, forced after.
    pub async fn shutdown(&self) {
        self.permits.close();
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let drained = tokio::time::timeout(self.grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("🚦 Dispatch pool drain deadline hit, cancelling stragglers");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        } else {
            debug!("Dispatch pool drained cleanly");
        }
    }
}
