use std::any::Any;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use quiver_core::{QuiverConfig, QuiverError, TaskError, TaskId};

use crate::context::ObserverSlot;
use crate::group::Group;
use crate::queue::{DispatchQueue, QueueStats};
use crate::task::{
    await_outcome, DeferredHandle, FinishCallback, HandoffTask, Payload, ReportTask, Task,
    TaskCore, TimedTask,
};
use crate::timer::{TimerScheduler, TimerStats};

struct QuiverInner {
    config: QuiverConfig,
    queue: OnceLock<DispatchQueue>,
    timers: OnceLock<TimerScheduler>,
    observer: ObserverSlot,
}

/// Entry point: owns one dispatch queue and one timer scheduler, each
/// started lazily on first use.
///
/// Cheap to clone; every clone drives the same queue and timers.
#[derive(Clone)]
pub struct Quiver {
    inner: Arc<QuiverInner>,
}

impl Quiver {
    pub fn new(config: QuiverConfig) -> Result<Self, QuiverError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(QuiverInner {
                config,
                queue: OnceLock::new(),
                timers: OnceLock::new(),
                observer: ObserverSlot::default(),
            }),
        })
    }

    /// Build from `QUIVER_*` environment variables.
    pub fn from_env() -> Result<Self, QuiverError> {
        Self::new(QuiverConfig::from_env())
    }

    pub fn config(&self) -> QuiverConfig {
        self.inner.config
    }

    fn queue(&self) -> &DispatchQueue {
        self.inner
            .queue
            .get_or_init(|| DispatchQueue::start(self.inner.config))
    }

    fn timers(&self) -> &TimerScheduler {
        self.inner.timers.get_or_init(TimerScheduler::start)
    }

    // Queries and shutdown never start the queue or the timer actor.

    fn started_queue(&self) -> Option<&DispatchQueue> {
        self.inner.queue.get()
    }

    fn core<T, F, Fut>(&self, payload: F) -> TaskCore<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        TaskCore::new(Payload::once(payload), self.inner.observer.clone())
    }

    // ── Finish observer ─────────────────────────────────────────

    /// Register a callback seeing every finished task. Replaces any
    /// previous observer.
    pub fn set_finish_observer<F>(&self, observer: F)
    where
        F: Fn(TaskId, Option<&dyn Any>, Option<&TaskError>) + Send + Sync + 'static,
    {
        self.inner.observer.set(observer);
    }

    pub fn clear_finish_observer(&self) {
        self.inner.observer.clear();
    }

    // ── Dispatch queue ──────────────────────────────────────────

    /// Submit and return immediately. `on_finish`, if given, receives the
    /// outcome; without it a failure is only logged.
    pub async fn submit_async<T, F, Fut>(
        &self,
        payload: F,
        on_finish: Option<FinishCallback<T>>,
    ) -> Result<TaskId, QuiverError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let task = ReportTask::new(self.core(payload), on_finish);
        let id = task.id();
        if !self.queue().submit(Box::new(task)).await {
            return Err(QuiverError::QueueClosed);
        }
        Ok(id)
    }

    /// Submit and wait for the result. `timeout` covers the whole call,
    /// including time spent waiting for room in the pending queue.
    ///
    /// A timeout only gives up the wait: a submission still blocked on a full
    /// pending queue carries on in the background, and the task's outcome
    /// still reaches the finish observer.
    pub async fn submit_and_wait<T, F, Fut>(
        &self,
        payload: F,
        timeout: Option<Duration>,
    ) -> Result<T, QuiverError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let started = Instant::now();
        let (task, mut rx) = HandoffTask::channel(self.core(payload));
        let queue = self.queue().clone();
        let mut submit = Box::pin(async move { queue.submit(Box::new(task)).await });
        let accepted = match timeout {
            Some(budget) => match tokio::time::timeout(budget, &mut submit).await {
                Ok(accepted) => accepted,
                Err(_) => {
                    // The task still goes into the queue once there is room.
                    tokio::spawn(submit);
                    return Err(QuiverError::Timeout(budget));
                }
            },
            None => submit.await,
        };
        if !accepted {
            return Err(QuiverError::QueueClosed);
        }

        match timeout {
            Some(budget) => {
                let left = budget.saturating_sub(started.elapsed());
                await_outcome(&mut rx, Some(left))
                    .await
                    .map_err(|e| match e {
                        QuiverError::Timeout(_) => QuiverError::Timeout(budget),
                        other => other,
                    })
            }
            None => await_outcome(&mut rx, None).await,
        }
    }

    /// Submit and hand back a handle to receive the outcome later.
    pub async fn submit_deferred<T, F, Fut>(&self, payload: F) -> Result<DeferredHandle<T>, QuiverError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (task, handle) = HandoffTask::deferred(self.core(payload));
        if !self.queue().submit(Box::new(task)).await {
            return Err(QuiverError::QueueClosed);
        }
        Ok(handle)
    }

    /// All zeros until the first submission starts the queue.
    pub fn stats(&self) -> QueueStats {
        self.started_queue()
            .map(DispatchQueue::stats)
            .unwrap_or_default()
    }

    pub fn is_stopped(&self) -> bool {
        self.started_queue().is_some_and(DispatchQueue::is_stopped)
    }

    // ── Timers ──────────────────────────────────────────────────

    /// Run `payload` once, `delay` from now. Bypasses the dispatch queue.
    pub fn schedule_once<F, Fut>(&self, delay: Duration, payload: F) -> Result<TaskId, QuiverError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task = TimedTask::once(self.core(payload), Instant::now() + delay);
        let id = task.id();
        self.timers().insert(task)?;
        Ok(id)
    }

    /// Run `payload` every `period`, first after `first_delay` (one period
    /// when `None`). Firing times stay on the `first + k * period` grid.
    pub fn schedule_interval<F, Fut>(
        &self,
        period: Duration,
        payload: F,
        first_delay: Option<Duration>,
    ) -> Result<TaskId, QuiverError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if period.is_zero() {
            return Err(QuiverError::InvalidConfig("interval period must be non-zero".into()));
        }
        let core = TaskCore::new(Payload::repeat(payload), self.inner.observer.clone());
        let first_due = Instant::now() + first_delay.unwrap_or(period);
        let task = TimedTask::interval(core, first_due, period);
        let id = task.id();
        self.timers().insert(task)?;
        Ok(id)
    }

    /// Cancel a timed task. `false` if it already fired (one-shot) or is unknown.
    pub async fn cancel_timed(&self, id: TaskId) -> bool {
        match self.inner.timers.get() {
            Some(timers) => timers.cancel(id).await,
            None => false,
        }
    }

    pub async fn timer_stats(&self) -> Result<TimerStats, QuiverError> {
        match self.inner.timers.get() {
            Some(timers) => timers.stats().await,
            None => Ok(TimerStats::default()),
        }
    }

    // ── Groups ──────────────────────────────────────────────────

    /// New fan-in group. `cap` limits how many members run at a time.
    pub fn new_group<T: Send + 'static>(&self, cap: Option<usize>) -> Group<T> {
        Group::new(self.queue().clone(), self.inner.observer.clone(), cap)
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Stop the dispatch queue and the timer scheduler. Pending work is
    /// abandoned; running tasks finish. Returns `false` if already stopped.
    ///
    /// A queue or timer actor that never started is replaced by a closed
    /// handle, so later submissions are refused without spawning anything.
    pub fn stop(&self) -> bool {
        let config = self.inner.config;
        let stopped = self
            .inner
            .queue
            .get_or_init(|| DispatchQueue::closed(config))
            .stop();
        self.inner.timers.get_or_init(TimerScheduler::closed).stop();
        if stopped {
            info!("quiver stopped");
        }
        stopped
    }
}

impl std::fmt::Debug for Quiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Quiver")
            .field("config", &self.inner.config)
            .field("queue_started", &self.inner.queue.get().is_some())
            .field("timers_started", &self.inner.timers.get().is_some())
            .field("observer", &self.inner.observer)
            .finish()
    }
}
