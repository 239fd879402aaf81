//! Task abstraction and its completion variants.
//!
//! Every variant wraps a [`TaskCore`], which owns the payload and runs the
//! shared execution contract. Variants only differ in where the outcome goes:
//! - `report`: optional finish callback (fire-and-report)
//! - `handoff`: one-shot rendezvous, awaited now or through a [`DeferredHandle`]
//! - `member`: a group's result / error maps
//! - `timed`: nobody; fired once or on an interval by the timer scheduler

mod handoff;
mod member;
mod report;
mod timed;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::OwnedSemaphorePermit;

use quiver_core::{QuiverError, TaskError, TaskId};

use crate::context::{self, ObserverSlot};

pub use handoff::DeferredHandle;
pub use report::FinishCallback;

pub(crate) use handoff::{await_outcome, HandoffTask};
pub(crate) use member::MemberTask;
pub(crate) use report::ReportTask;
pub(crate) use timed::{TimedTask, TimerKind};

/// Outcome of a single payload invocation.
pub type Outcome<T> = Result<T, TaskError>;

/// Future produced by a payload.
pub type PayloadFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

/// A task the dispatch queue can run.
///
/// `execute` consumes the task, so a spent task can never run twice. The
/// running slot, when the task came through the dispatch queue, is released
/// before the outcome is delivered.
pub trait Task: Send + 'static {
    fn id(&self) -> TaskId;

    fn execute(self: Box<Self>, slot: Option<OwnedSemaphorePermit>) -> BoxFuture<'static, ()>;
}

/// Callable payload. Arguments are captured by the closure.
pub(crate) enum Payload<T> {
    /// Runs once, released on first invocation.
    Once(Box<dyn FnOnce() -> PayloadFuture<T> + Send>),
    /// Runs on every firing of an interval timer.
    Repeat(Box<dyn FnMut() -> PayloadFuture<T> + Send>),
}

impl<T: Send + 'static> Payload<T> {
    pub(crate) fn once<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Payload::Once(Box::new(move || f().boxed()))
    }

    pub(crate) fn repeat<F, Fut>(mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Payload::Repeat(Box::new(move || f().boxed()))
    }
}

/// Identifier, payload and observer shared by all task variants.
pub(crate) struct TaskCore<T> {
    id: TaskId,
    payload: Option<Payload<T>>,
    observer: ObserverSlot,
}

impl<T: Send + 'static> TaskCore<T> {
    pub(crate) fn new(payload: Payload<T>, observer: ObserverSlot) -> Self {
        Self {
            id: TaskId::next(),
            payload: Some(payload),
            observer,
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn is_spent(&self) -> bool {
        self.payload.is_none()
    }

    /// Drop the payload (and everything it captured) without running it.
    pub(crate) fn release(&mut self) {
        self.payload = None;
    }

    /// Invoke the payload once with this task recorded as current, catching
    /// errors and panics, then notify the finish observer.
    ///
    /// A `Once` payload is released by the call; invoking a released payload
    /// is a usage error.
    pub(crate) async fn invoke(&mut self) -> Result<Outcome<T>, QuiverError> {
        let id = self.id;
        let started = match self.payload.take() {
            None => return Err(QuiverError::AlreadyExecuted(id)),
            Some(Payload::Once(f)) => start(id, f),
            Some(Payload::Repeat(mut f)) => {
                let started = start(id, || f());
                self.payload = Some(Payload::Repeat(f));
                started
            }
        };

        let outcome = match started {
            Err(e) => Err(e),
            Ok(fut) => match context::scope(id, AssertUnwindSafe(fut).catch_unwind()).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(TaskError::from(e)),
                Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
            },
        };

        self.observer.notify(id, &outcome);
        Ok(outcome)
    }

    /// Invoke a one-shot payload, consuming the core.
    pub(crate) async fn run_once(mut self) -> Outcome<T> {
        match self.invoke().await {
            Ok(outcome) => outcome,
            Err(e) => Err(TaskError::Failed(e.to_string())),
        }
    }
}

/// Call the payload closure, which may itself panic before producing a future.
fn start<T, F>(id: TaskId, f: F) -> Result<PayloadFuture<T>, TaskError>
where
    F: FnOnce() -> PayloadFuture<T>,
{
    context::sync_scope(id, || std::panic::catch_unwind(AssertUnwindSafe(f)))
        .map_err(|panic| TaskError::Panicked(panic_message(panic.as_ref())))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
