use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, warn};

use quiver_core::TaskId;

use crate::group::{abandoned, GroupShared};

use super::{Task, TaskCore};

/// Group member: reports into its group's result / error maps.
///
/// A member dropped before its payload ran (a stopped queue abandoning it)
/// is recorded as failed, so the group still resolves.
pub(crate) struct MemberTask<T> {
    id: TaskId,
    core: Option<TaskCore<T>>,
    group: Arc<GroupShared<T>>,
}

impl<T: Send + 'static> MemberTask<T> {
    pub(crate) fn new(core: TaskCore<T>, group: Arc<GroupShared<T>>) -> Self {
        Self {
            id: core.id(),
            core: Some(core),
            group,
        }
    }

    async fn run(mut self, slot: Option<OwnedSemaphorePermit>) {
        let Some(core) = self.core.take() else {
            return;
        };
        let id = self.id;
        let outcome = core.run_once().await;
        drop(slot);

        let registered = match outcome {
            Ok(value) => self.group.register_result(id, value).await,
            Err(e) => self.group.register_error(id, e).await,
        };
        if let Err(e) = registered {
            error!(
                group_id = %self.group.id(),
                task_id = %id,
                error = %e,
                "group member could not report its outcome"
            );
        }
    }
}

impl<T> MemberTask<T> {
    /// Drop without recording anything.
    pub(crate) fn discard(mut self) {
        self.core = None;
    }
}

impl<T: Send + 'static> Task for MemberTask<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn execute(self: Box<Self>, slot: Option<OwnedSemaphorePermit>) -> BoxFuture<'static, ()> {
        (*self).run(slot).boxed()
    }
}

impl<T> Drop for MemberTask<T> {
    fn drop(&mut self) {
        if self.core.take().is_none() {
            return;
        }

        // Backlog members admitted in turn cannot be dispatched either.
        let mut id = self.id;
        loop {
            warn!(group_id = %self.group.id(), task_id = %id, "group member abandoned before running");
            match self.group.record(id, Err(abandoned())) {
                Ok(Some(mut next)) => {
                    id = next.id;
                    next.core = None;
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(group_id = %self.group.id(), task_id = %id, error = %e, "abandoned member not recorded");
                    break;
                }
            }
        }
    }
}
