use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tracing::debug;

use quiver_core::{QuiverError, TaskId};

use super::{Outcome, Task, TaskCore};

/// Task that hands its outcome to a single waiting receiver.
///
/// Backs both the synchronous wait (receiver awaited right after submission)
/// and the deferred handle (receiver given back to the caller).
pub(crate) struct HandoffTask<T> {
    core: TaskCore<T>,
    tx: oneshot::Sender<Outcome<T>>,
}

impl<T: Send + 'static> HandoffTask<T> {
    pub(crate) fn channel(core: TaskCore<T>) -> (Self, oneshot::Receiver<Outcome<T>>) {
        let (tx, rx) = oneshot::channel();
        (Self { core, tx }, rx)
    }

    pub(crate) fn deferred(core: TaskCore<T>) -> (Self, DeferredHandle<T>) {
        let id = core.id();
        let (task, rx) = Self::channel(core);
        (task, DeferredHandle { id, rx: Some(rx) })
    }

    async fn run(self, slot: Option<OwnedSemaphorePermit>) {
        let id = self.core.id();
        let outcome = self.core.run_once().await;
        drop(slot);

        if self.tx.send(outcome).is_err() {
            debug!(task_id = %id, "waiter gone, outcome dropped");
        }
    }
}

impl<T: Send + 'static> Task for HandoffTask<T> {
    fn id(&self) -> TaskId {
        self.core.id()
    }

    fn execute(self: Box<Self>, slot: Option<OwnedSemaphorePermit>) -> BoxFuture<'static, ()> {
        (*self).run(slot).boxed()
    }
}

/// Wait for a handed-off outcome. `None` waits indefinitely.
///
/// A sender dropped without a value means the task was abandoned by a
/// stopped queue.
pub(crate) async fn await_outcome<T>(
    rx: &mut oneshot::Receiver<Outcome<T>>,
    timeout: Option<Duration>,
) -> Result<T, QuiverError> {
    let received = match timeout {
        Some(budget) => tokio::time::timeout(budget, rx)
            .await
            .map_err(|_| QuiverError::Timeout(budget))?,
        None => rx.await,
    };
    match received {
        Ok(outcome) => outcome.map_err(QuiverError::from),
        Err(_) => Err(QuiverError::QueueClosed),
    }
}

/// Handle to a task's eventual outcome.
///
/// The outcome can be received exactly once; a timed-out `receive` leaves it
/// in place for a later call.
#[derive(Debug)]
pub struct DeferredHandle<T> {
    id: TaskId,
    rx: Option<oneshot::Receiver<Outcome<T>>>,
}

impl<T> DeferredHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the outcome. `None` waits indefinitely.
    pub async fn receive(&mut self, timeout: Option<Duration>) -> Result<T, QuiverError> {
        let rx = self.rx.as_mut().ok_or(QuiverError::AlreadyReceived(self.id))?;
        let result = await_outcome(rx, timeout).await;
        if !matches!(result, Err(QuiverError::Timeout(_))) {
            self.rx = None;
        }
        result
    }

    /// Whether the outcome has already been received.
    pub fn is_received(&self) -> bool {
        self.rx.is_none()
    }
}
