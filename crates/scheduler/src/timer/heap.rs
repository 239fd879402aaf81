use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::Instant;

use quiver_core::TaskId;

use crate::task::{TimedTask, TimerKind};

/// Result of asking the heap for the next due task.
pub(crate) enum Extracted {
    Due(TimedTask),
    NotYet(Instant),
    Empty,
}

/// Min-ordered timer store with lazy deletion.
///
/// Heap entries are `(due, id)`; ids are allocated in submission order, so
/// equal due times come out FIFO. An entry is stale when its id is no longer
/// live, or the live task has since been rescheduled to another due time.
#[derive(Default)]
pub(crate) struct TimerHeap {
    order: BinaryHeap<Reverse<(Instant, TaskId)>>,
    live: HashMap<TaskId, TimedTask>,
    intervals: HashMap<TaskId, Arc<AtomicBool>>,
}

impl TimerHeap {
    /// Add a task. Returns `false` if it is an interval already cancelled.
    pub(crate) fn insert(&mut self, task: TimedTask) -> bool {
        let id = task.id();
        if let TimerKind::Interval { cancelled, .. } = task.kind() {
            if cancelled.load(Ordering::Acquire) {
                self.intervals.remove(&id);
                return false;
            }
            self.intervals.insert(id, Arc::clone(cancelled));
        }
        self.order.push(Reverse((task.due(), id)));
        self.live.insert(id, task);
        true
    }

    /// Remove a task so it never fires again.
    ///
    /// An interval is flagged even while a firing is in flight (it is absent
    /// from `live` then), so that firing does not reschedule it.
    pub(crate) fn delete(&mut self, id: TaskId) -> bool {
        if let Some(cancelled) = self.intervals.remove(&id) {
            cancelled.store(true, Ordering::Release);
            self.live.remove(&id);
            return true;
        }
        self.live.remove(&id).is_some()
    }

    /// Pop the earliest live task if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Extracted {
        while let Some(Reverse((due, id))) = self.order.peek().copied() {
            let fresh = self.live.get(&id).is_some_and(|task| task.due() == due);
            if !fresh {
                self.order.pop();
                continue;
            }
            if due > now {
                return Extracted::NotYet(due);
            }
            self.order.pop();
            return match self.live.remove(&id) {
                Some(task) => Extracted::Due(task),
                None => Extracted::Empty,
            };
        }
        Extracted::Empty
    }

    /// Live tasks waiting in the heap.
    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    /// Heap entries including stale ones not yet purged.
    pub(crate) fn entries(&self) -> usize {
        self.order.len()
    }

    /// Intervals not cancelled, including ones currently firing.
    pub(crate) fn intervals(&self) -> usize {
        self.intervals.len()
    }
}

/// Pending wake-up instants, deduplicated so at most one sleeper covers
/// any given earliest deadline.
#[derive(Default)]
pub(crate) struct WakeupSet {
    pending: BinaryHeap<Reverse<Instant>>,
}

impl WakeupSet {
    /// Record a wake-up at `at`. Returns `false` if an earlier or equal
    /// wake-up already covers it, meaning no new sleeper is needed.
    pub(crate) fn register(&mut self, at: Instant) -> bool {
        if let Some(Reverse(earliest)) = self.pending.peek() {
            if *earliest <= at {
                return false;
            }
        }
        self.pending.push(Reverse(at));
        true
    }

    /// Drop every wake-up that has fired by `now`.
    pub(crate) fn fired(&mut self, now: Instant) {
        while let Some(Reverse(at)) = self.pending.peek() {
            if *at > now {
                break;
            }
            self.pending.pop();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
