use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use quiver_core::TaskId;

use super::{Outcome, Task, TaskCore};

/// Callback invoked with the task id and its outcome once it finishes.
pub type FinishCallback<T> = Box<dyn FnOnce(TaskId, Outcome<T>) + Send>;

/// Fire-and-report task: the outcome goes to an optional callback, running
/// on the same logical task as the payload.
pub(crate) struct ReportTask<T> {
    core: TaskCore<T>,
    on_finish: Option<FinishCallback<T>>,
}

impl<T: Send + 'static> ReportTask<T> {
    pub(crate) fn new(core: TaskCore<T>, on_finish: Option<FinishCallback<T>>) -> Self {
        Self { core, on_finish }
    }

    async fn run(self, slot: Option<OwnedSemaphorePermit>) {
        let id = self.core.id();
        let outcome = self.core.run_once().await;
        drop(slot);

        match (self.on_finish, outcome) {
            (Some(on_finish), outcome) => on_finish(id, outcome),
            (None, Err(e)) => {
                warn!(task_id = %id, error = %e, "async task failed and no finish callback is set");
            }
            (None, Ok(_)) => debug!(task_id = %id, "async task finished"),
        }
    }
}

impl<T: Send + 'static> Task for ReportTask<T> {
    fn id(&self) -> TaskId {
        self.core.id()
    }

    fn execute(self: Box<Self>, slot: Option<OwnedSemaphorePermit>) -> BoxFuture<'static, ()> {
        (*self).run(slot).boxed()
    }
}
