//! Timer scheduler: one actor task owning a [`heap::TimerHeap`].
//!
//! All heap mutation happens on the actor. Handles talk to it over an
//! unbounded command channel; sleepers and in-flight firings hold only weak
//! senders, so dropping every handle shuts the actor down.
//!
//! Submodules:
//! - `heap`: ordered store with lazy deletion, plus wake-up dedup

mod heap;
#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

use quiver_core::{QuiverError, TaskId};

use crate::task::TimedTask;

use heap::{Extracted, TimerHeap, WakeupSet};

/// Snapshot of the timer scheduler's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimerStats {
    /// Timed tasks waiting to fire.
    pub live: usize,
    /// Heap entries, stale ones included.
    pub heap_entries: usize,
    /// Interval timers not yet cancelled.
    pub intervals: usize,
    /// Sleepers currently armed.
    pub pending_wakeups: usize,
}

enum Command {
    Insert(TimedTask),
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Wake,
    Stats(oneshot::Sender<TimerStats>),
    Stop,
}

#[derive(Clone)]
pub(crate) struct TimerScheduler {
    tx: mpsc::UnboundedSender<Command>,
    stopped: Arc<AtomicBool>,
}

impl TimerScheduler {
    /// Spawn the actor. Must run inside a tokio runtime.
    pub(crate) fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, tx.downgrade()));
        info!("timer scheduler started");
        Self {
            tx,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A scheduler with no actor behind it. Does not need a runtime.
    pub(crate) fn closed() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self {
            tx,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn insert(&self, task: TimedTask) -> Result<(), QuiverError> {
        if self.is_stopped() {
            return Err(QuiverError::QueueClosed);
        }
        self.tx
            .send(Command::Insert(task))
            .map_err(|_| QuiverError::QueueClosed)
    }

    /// Remove a pending timer. For an interval this also stops a firing
    /// that is currently running from rescheduling.
    pub(crate) async fn cancel(&self, id: TaskId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Cancel { id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub(crate) async fn stats(&self) -> Result<TimerStats, QuiverError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Stats(reply))
            .map_err(|_| QuiverError::QueueClosed)?;
        rx.await.map_err(|_| QuiverError::QueueClosed)
    }

    /// Stop the actor. Timers that have not fired yet are dropped.
    pub(crate) fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(Command::Stop);
        true
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, weak: mpsc::WeakUnboundedSender<Command>) {
    let mut heap = TimerHeap::default();
    let mut wakeups = WakeupSet::default();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Insert(task) => {
                let id = task.id();
                if !heap.insert(task) {
                    debug!(task_id = %id, "cancelled interval not rescheduled");
                }
                drain(&mut heap, &mut wakeups, &weak);
            }
            Command::Wake => {
                wakeups.fired(Instant::now());
                drain(&mut heap, &mut wakeups, &weak);
            }
            Command::Cancel { id, reply } => {
                let removed = heap.delete(id);
                debug!(task_id = %id, removed, "timer cancel");
                let _ = reply.send(removed);
            }
            Command::Stats(reply) => {
                let _ = reply.send(TimerStats {
                    live: heap.len(),
                    heap_entries: heap.entries(),
                    intervals: heap.intervals(),
                    pending_wakeups: wakeups.len(),
                });
            }
            Command::Stop => break,
        }
    }

    info!(dropped = heap.len(), "timer scheduler stopped");
}

/// Fire everything due now, then make sure a sleeper covers the next deadline.
fn drain(heap: &mut TimerHeap, wakeups: &mut WakeupSet, weak: &mpsc::WeakUnboundedSender<Command>) {
    let now = Instant::now();
    loop {
        match heap.pop_due(now) {
            Extracted::Due(task) => spawn_firing(task, weak.clone()),
            Extracted::NotYet(at) => {
                if wakeups.register(at) {
                    spawn_sleeper(at, weak.clone());
                }
                break;
            }
            Extracted::Empty => break,
        }
    }
}

fn spawn_firing(task: TimedTask, weak: mpsc::WeakUnboundedSender<Command>) {
    tokio::spawn(async move {
        let id = task.id();
        let Some(next) = task.fire().await else {
            return;
        };
        let sent = weak
            .upgrade()
            .is_some_and(|tx| tx.send(Command::Insert(next)).is_ok());
        if !sent {
            debug!(task_id = %id, "timer scheduler gone, interval dropped");
        }
    });
}

fn spawn_sleeper(at: Instant, weak: mpsc::WeakUnboundedSender<Command>) {
    tokio::spawn(async move {
        tokio::time::sleep_until(at).await;
        if let Some(tx) = weak.upgrade() {
            let _ = tx.send(Command::Wake);
        }
    });
}
