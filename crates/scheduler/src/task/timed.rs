use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use quiver_core::TaskId;

use super::TaskCore;

#[derive(Debug, Clone)]
pub(crate) enum TimerKind {
    Once,
    /// Fires every `period`; `cancelled` is shared with the timer scheduler
    /// so a cancel reaches a firing that is already in flight.
    Interval {
        period: Duration,
        cancelled: Arc<AtomicBool>,
    },
}

/// Time-triggered task. Outside the dispatch queue, so it takes no running
/// slot; errors have no receiver and are only logged.
pub(crate) struct TimedTask {
    core: TaskCore<()>,
    due: Instant,
    kind: TimerKind,
}

impl TimedTask {
    pub(crate) fn once(core: TaskCore<()>, due: Instant) -> Self {
        Self {
            core,
            due,
            kind: TimerKind::Once,
        }
    }

    pub(crate) fn interval(core: TaskCore<()>, first_due: Instant, period: Duration) -> Self {
        Self {
            core,
            due: first_due,
            kind: TimerKind::Interval {
                period,
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.core.id()
    }

    pub(crate) fn due(&self) -> Instant {
        self.due
    }

    pub(crate) fn kind(&self) -> &TimerKind {
        &self.kind
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        match &self.kind {
            TimerKind::Once => false,
            TimerKind::Interval { cancelled, .. } => cancelled.load(Ordering::Acquire),
        }
    }

    /// Run one firing. Returns the task again, due one period after its
    /// previous due time, when it should be rescheduled.
    pub(crate) async fn fire(mut self) -> Option<Self> {
        let id = self.id();
        if self.is_cancelled() {
            debug!(task_id = %id, "interval timer cancelled before firing");
            self.core.release();
            return None;
        }

        match self.core.invoke().await {
            Ok(Ok(())) => debug!(task_id = %id, "timer fired"),
            Ok(Err(e)) => warn!(task_id = %id, error = %e, "timer task failed"),
            Err(e) => {
                error!(task_id = %id, error = %e, "timer task could not run");
                return None;
            }
        }

        let TimerKind::Interval { period, cancelled } = &self.kind else {
            return None;
        };
        // Cancelled while the payload was running.
        if cancelled.load(Ordering::Acquire) {
            self.core.release();
            return None;
        }
        // Step from the previous due time so execution time never drifts the schedule.
        let period = *period;
        self.due += period;
        Some(self)
    }
}
