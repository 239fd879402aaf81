//! Bounded dispatch queue with a separate concurrency cap.
//!
//! Submissions land in a bounded pending channel (backpressure suspends the
//! submitter). A single dispatch loop pulls tasks in order, reserves a running
//! slot from a semaphore (suspending the loop, not submitters, when the cap is
//! reached) and spawns each task on its own tokio task.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, info};

use quiver_core::QuiverConfig;

use crate::task::Task;

/// Point-in-time view of the dispatch queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Tasks waiting in the pending queue.
    pub pending: usize,
    /// Submitters suspended because the pending queue is full.
    pub overflow: usize,
    /// Tasks currently holding a running slot.
    pub running: usize,
}

struct QueueInner {
    config: QuiverConfig,
    pending: mpsc::Sender<Box<dyn Task>>,
    slots: Arc<Semaphore>,
    blocked: AtomicUsize,
    stopped: AtomicBool,
    stop_signal: Arc<Notify>,
}

/// Cloneable handle to a running dispatch queue.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

impl DispatchQueue {
    /// Create the queue and spawn its dispatch loop. Must run inside a tokio runtime.
    pub fn start(config: QuiverConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size);
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        let stop_signal = Arc::new(Notify::new());

        tokio::spawn(dispatch_loop(rx, Arc::clone(&slots), Arc::clone(&stop_signal)));
        info!(
            queue_size = config.queue_size,
            max_concurrent = config.max_concurrent,
            "dispatch queue started"
        );

        Self {
            inner: Arc::new(QueueInner {
                config,
                pending: tx,
                slots,
                blocked: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                stop_signal,
            }),
        }
    }

    /// A queue with no dispatch loop behind it: every submission is refused.
    /// Does not need a runtime.
    pub fn closed(config: QuiverConfig) -> Self {
        let (tx, _) = mpsc::channel(config.queue_size);
        Self {
            inner: Arc::new(QueueInner {
                config,
                pending: tx,
                slots: Arc::new(Semaphore::new(config.max_concurrent)),
                blocked: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                stop_signal: Arc::new(Notify::new()),
            }),
        }
    }

    pub fn config(&self) -> QuiverConfig {
        self.inner.config
    }

    /// Enqueue a task. Suspends while the pending queue is full.
    ///
    /// Returns `false` only once the queue has been stopped.
    pub async fn submit(&self, task: Box<dyn Task>) -> bool {
        if self.is_stopped() {
            return false;
        }
        match self.inner.pending.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(task)) => {
                let _blocked = BlockedGuard::enter(&self.inner.blocked);
                debug!(task_id = %task.id(), "pending queue full, submitter suspended");
                self.inner.pending.send(task).await.is_ok()
            }
        }
    }

    /// Close intake. The loop exits without draining pending tasks; tasks
    /// already running are not interrupted. Returns `false` if already stopped.
    pub fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("dispatch queue stop requested");
        self.inner.stop_signal.notify_one();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending_len(),
            overflow: self.inner.blocked.load(Ordering::Relaxed),
            running: self
                .inner
                .config
                .max_concurrent
                .saturating_sub(self.inner.slots.available_permits()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending_len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.inner.pending.capacity() == 0
    }

    fn pending_len(&self) -> usize {
        self.inner
            .config
            .queue_size
            .saturating_sub(self.inner.pending.capacity())
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Counts a suspended submitter for as long as it waits, even if its
/// future is dropped mid-wait.
struct BlockedGuard<'a>(&'a AtomicUsize);

impl<'a> BlockedGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for BlockedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<Box<dyn Task>>,
    slots: Arc<Semaphore>,
    stop_signal: Arc<Notify>,
) {
    let mut dispatched: u64 = 0;
    loop {
        let task = tokio::select! {
            biased;
            _ = stop_signal.notified() => break,
            next = rx.recv() => match next {
                Some(task) => task,
                // Every handle dropped and the queue drained.
                None => break,
            },
        };

        // The single admission point: waits here, not in submit, once the cap is reached.
        let slot = tokio::select! {
            biased;
            _ = stop_signal.notified() => break,
            slot = Arc::clone(&slots).acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => break,
            },
        };

        debug!(task_id = %task.id(), "dispatching task");
        tokio::spawn(task.execute(Some(slot)));
        dispatched += 1;
    }

    rx.close();
    info!(dispatched, "dispatch loop stopped");
}
