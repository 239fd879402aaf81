//! Per-task execution context and the finish observer hook.

use std::any::Any;
use std::sync::{Arc, PoisonError, RwLock};

use quiver_core::{TaskError, TaskId};

tokio::task_local! {
    static CURRENT_TASK: TaskId;
}

/// Identifier of the task whose payload is currently running, if any.
///
/// Only set while a payload executes; `None` everywhere else.
pub fn current_task_id() -> Option<TaskId> {
    CURRENT_TASK.try_with(|id| *id).ok()
}

/// Run a synchronous closure with `id` recorded as the current task.
pub(crate) fn sync_scope<R>(id: TaskId, f: impl FnOnce() -> R) -> R {
    CURRENT_TASK.sync_scope(id, f)
}

/// Await `fut` with `id` recorded as the current task.
pub(crate) async fn scope<F: std::future::Future>(id: TaskId, fut: F) -> F::Output {
    CURRENT_TASK.scope(id, fut).await
}

/// Callback receiving `(id, result, error)` for every finished task of every
/// variant. Exactly one of `result` / `error` is set.
pub type FinishObserver =
    Arc<dyn Fn(TaskId, Option<&dyn Any>, Option<&TaskError>) + Send + Sync>;

/// Shared slot holding the finish observer. Last registration wins.
#[derive(Clone, Default)]
pub struct ObserverSlot(Arc<RwLock<Option<FinishObserver>>>);

impl ObserverSlot {
    pub fn set<F>(&self, observer: F)
    where
        F: Fn(TaskId, Option<&dyn Any>, Option<&TaskError>) + Send + Sync + 'static,
    {
        let observer: FinishObserver = Arc::new(observer);
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    pub fn clear(&self) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_set(&self) -> bool {
        self.0.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub(crate) fn notify<T: Any>(&self, id: TaskId, outcome: &Result<T, TaskError>) {
        // Clone out so the callback never runs under the lock.
        let observer = self.0.read().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(observer) = observer else { return };
        match outcome {
            Ok(value) => observer(id, Some(value as &dyn Any), None),
            Err(e) => observer(id, None, Some(e)),
        }
    }
}

impl std::fmt::Debug for ObserverSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSlot").field("set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn no_current_task_outside_scope() {
        assert_eq!(current_task_id(), None);
    }

    #[tokio::test]
    async fn current_task_visible_inside_scope() {
        let id = TaskId::next();
        let seen = scope(id, async { current_task_id() }).await;
        assert_eq!(seen, Some(id));
        assert_eq!(current_task_id(), None);
        assert_eq!(sync_scope(id, current_task_id), Some(id));
    }

    #[test]
    fn observer_receives_exactly_one_side() {
        let seen: Arc<Mutex<Vec<(Option<u32>, Option<TaskError>)>>> = Arc::default();
        let slot = ObserverSlot::default();
        let sink = Arc::clone(&seen);
        slot.set(move |_id, result, error| {
            let value = result.and_then(|r| r.downcast_ref::<u32>()).copied();
            sink.lock().unwrap().push((value, error.cloned()));
        });

        slot.notify(TaskId::next(), &Ok::<u32, TaskError>(7));
        slot.notify::<u32>(TaskId::next(), &Err(TaskError::Failed("nope".into())));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (Some(7), None));
        assert_eq!(seen[1], (None, Some(TaskError::Failed("nope".into()))));
    }

    #[test]
    fn last_registration_wins() {
        let hits: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let slot = ObserverSlot::default();
        let first = Arc::clone(&hits);
        slot.set(move |_, _, _| first.lock().unwrap().push("first"));
        let second = Arc::clone(&hits);
        slot.set(move |_, _, _| second.lock().unwrap().push("second"));

        slot.notify(TaskId::next(), &Ok::<(), TaskError>(()));
        assert_eq!(*hits.lock().unwrap(), vec!["second"]);

        slot.clear();
        assert!(!slot.is_set());
        slot.notify(TaskId::next(), &Ok::<(), TaskError>(()));
        assert_eq!(hits.lock().unwrap().len(), 1);
    }
}
