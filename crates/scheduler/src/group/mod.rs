//! Fan-in aggregator over a dynamic set of member tasks.
//!
//! A group collects members while `Preparing`, then is consumed exactly once,
//! either all at once ([`Group::wait_for_all`]) or incrementally in completion
//! order ([`Group::stream`]). An optional cap throttles how many members sit in
//! the dispatch queue at a time; the rest wait in a FIFO backlog and are
//! admitted as running members report back.
//!
//! Submodules:
//! - `stream`: the completion-ordered consumer

mod stream;

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use quiver_core::{GroupId, QuiverError, TaskError, TaskId};

use crate::context::ObserverSlot;
use crate::queue::DispatchQueue;
use crate::task::{MemberTask, Outcome, Payload, Task, TaskCore};

pub use stream::GroupStream;

/// Lifecycle of a group. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Preparing,
    Waiting,
    Done,
}

impl GroupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupState::Preparing => "preparing",
            GroupState::Waiting => "waiting",
            GroupState::Done => "done",
        }
    }
}

impl std::fmt::Display for GroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumeMode {
    WaitForAll,
    YieldEachOne,
}

struct Throttle<T> {
    cap: usize,
    backlog: VecDeque<MemberTask<T>>,
}

pub(crate) struct GroupInner<T> {
    state: GroupState,
    mode: Option<ConsumeMode>,
    members: HashSet<TaskId>,
    results: IndexMap<TaskId, T>,
    errors: IndexMap<TaskId, TaskError>,
    running: usize,
    throttle: Option<Throttle<T>>,
    all_done: Option<oneshot::Sender<()>>,
    each_done: Option<mpsc::UnboundedSender<TaskId>>,
}

impl<T> GroupInner<T> {
    fn unresolved(&self) -> usize {
        self.members.len() - self.results.len() - self.errors.len()
    }

    /// Fix the consumption mode and leave `Preparing`.
    fn begin(&mut self, mode: ConsumeMode, op: &'static str) -> Result<(), QuiverError> {
        if self.state != GroupState::Preparing {
            return Err(QuiverError::WrongState {
                op,
                state: self.state.as_str(),
            });
        }
        self.mode = Some(mode);
        self.state = GroupState::Waiting;
        Ok(())
    }

    /// Pop the next backlog member if a running position is free.
    fn admit_next(&mut self) -> Option<MemberTask<T>> {
        let throttle = self.throttle.as_mut()?;
        if self.running >= throttle.cap {
            return None;
        }
        let task = throttle.backlog.pop_front()?;
        self.running += 1;
        Some(task)
    }
}

/// Error recorded for a member the dispatch queue dropped unexecuted.
pub(crate) fn abandoned() -> TaskError {
    TaskError::Failed("dispatch queue closed".into())
}

pub(crate) struct GroupShared<T> {
    id: GroupId,
    queue: DispatchQueue,
    observer: ObserverSlot,
    state: Mutex<GroupInner<T>>,
}

impl<T: Send + 'static> GroupShared<T> {
    pub(crate) async fn register_result(&self, id: TaskId, value: T) -> Result<(), QuiverError> {
        self.register(id, Ok(value)).await
    }

    pub(crate) async fn register_error(&self, id: TaskId, error: TaskError) -> Result<(), QuiverError> {
        self.register(id, Err(error)).await
    }

    /// Record a member's outcome, then admit the next backlog member, if any.
    ///
    /// A backlog member the closed queue refuses records its own failure when
    /// it is dropped.
    async fn register(&self, id: TaskId, outcome: Outcome<T>) -> Result<(), QuiverError> {
        if let Some(task) = self.record(id, outcome)? {
            let member = task.id();
            if self.queue.submit(Box::new(task)).await {
                debug!(group_id = %self.id, task_id = %member, "backlog member admitted");
            }
        }
        Ok(())
    }
}

impl<T> GroupShared<T> {
    pub(crate) fn id(&self) -> GroupId {
        self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, GroupInner<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an outcome and hand back the backlog member it makes room for.
    /// The lock is released before returning.
    pub(crate) fn record(&self, id: TaskId, outcome: Outcome<T>) -> Result<Option<MemberTask<T>>, QuiverError> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if inner.state == GroupState::Done {
            return Err(QuiverError::WrongState {
                op: "register",
                state: inner.state.as_str(),
            });
        }
        if !inner.members.contains(&id) {
            return Err(QuiverError::UnknownMember(id));
        }
        if inner.results.contains_key(&id) || inner.errors.contains_key(&id) {
            return Err(QuiverError::AlreadyRegistered(id));
        }

        match outcome {
            Ok(value) => {
                inner.results.insert(id, value);
            }
            Err(e) => {
                debug!(group_id = %self.id, task_id = %id, error = %e, "group member failed");
                inner.errors.insert(id, e);
            }
        }
        inner.running = inner.running.saturating_sub(1);

        match inner.mode {
            Some(ConsumeMode::YieldEachOne) => {
                if let Some(tx) = &inner.each_done {
                    let _ = tx.send(id);
                }
            }
            Some(ConsumeMode::WaitForAll) if inner.unresolved() == 0 => {
                inner.state = GroupState::Done;
                if let Some(tx) = inner.all_done.take() {
                    let _ = tx.send(());
                }
            }
            _ => {}
        }

        Ok(inner.admit_next())
    }
}

/// Handle to one fan-in session.
pub struct Group<T> {
    shared: Arc<GroupShared<T>>,
}

impl<T: Send + 'static> Group<T> {
    /// `cap` of `Some(0)` is treated as 1.
    pub(crate) fn new(queue: DispatchQueue, observer: ObserverSlot, cap: Option<usize>) -> Self {
        let throttle = cap.map(|cap| Throttle {
            cap: cap.max(1),
            backlog: VecDeque::new(),
        });
        let id = GroupId::next();
        debug!(group_id = %id, cap = ?cap, "group created");
        Self {
            shared: Arc::new(GroupShared {
                id,
                queue,
                observer,
                state: Mutex::new(GroupInner {
                    state: GroupState::Preparing,
                    mode: None,
                    members: HashSet::new(),
                    results: IndexMap::new(),
                    errors: IndexMap::new(),
                    running: 0,
                    throttle,
                    all_done: None,
                    each_done: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> GroupId {
        self.shared.id
    }

    /// Add a member. It is dispatched right away unless the throttle is
    /// saturated, in which case it joins the backlog.
    pub async fn add<F, Fut>(&self, payload: F) -> Result<TaskId, QuiverError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let core = TaskCore::new(Payload::once(payload), self.shared.observer.clone());
        let task = MemberTask::new(core, Arc::clone(&self.shared));
        let id = task.id();

        {
            let mut guard = self.shared.lock();
            let inner = &mut *guard;
            if inner.state != GroupState::Preparing {
                task.discard();
                return Err(QuiverError::WrongState {
                    op: "add",
                    state: inner.state.as_str(),
                });
            }
            inner.members.insert(id);
            if let Some(throttle) = inner.throttle.as_mut() {
                if inner.running >= throttle.cap {
                    throttle.backlog.push_back(task);
                    debug!(group_id = %self.shared.id, task_id = %id, "member queued to backlog");
                    return Ok(id);
                }
            }
            inner.running += 1;
        }

        // A refused task records itself as failed on drop; it was never added.
        if !self.shared.queue.submit(Box::new(task)).await {
            let mut inner = self.shared.lock();
            inner.members.remove(&id);
            inner.errors.shift_remove(&id);
            return Err(QuiverError::QueueClosed);
        }
        Ok(id)
    }

    /// Wait until every member has resolved and return the successful
    /// results in completion order. Failed members are left out; see
    /// [`Group::errors`].
    ///
    /// On timeout nothing is returned; the members keep running.
    pub async fn wait_for_all(&self, timeout: Option<Duration>) -> Result<IndexMap<TaskId, T>, QuiverError> {
        let signal = {
            let mut inner = self.shared.lock();
            inner.begin(ConsumeMode::WaitForAll, "wait_for_all")?;
            if inner.unresolved() == 0 {
                inner.state = GroupState::Done;
                return Ok(std::mem::take(&mut inner.results));
            }
            let (tx, rx) = oneshot::channel();
            inner.all_done = Some(tx);
            rx
        };

        let signalled = match timeout {
            Some(budget) => tokio::time::timeout(budget, signal)
                .await
                .map_err(|_| QuiverError::Timeout(budget))?,
            None => signal.await,
        };
        signalled.map_err(|_| QuiverError::QueueClosed)?;

        Ok(std::mem::take(&mut self.shared.lock().results))
    }

    /// Errors recorded so far, in completion order.
    pub fn errors(&self) -> IndexMap<TaskId, TaskError> {
        self.shared.lock().errors.clone()
    }

    pub fn error(&self, id: TaskId) -> Option<TaskError> {
        self.shared.lock().errors.get(&id).cloned()
    }

    /// Members added so far.
    pub fn len(&self) -> usize {
        self.shared.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> GroupState {
        self.shared.lock().state
    }
}

impl<T: Clone + Send + 'static> Group<T> {
    /// Consume results one at a time in completion order.
    ///
    /// Results already in hand are replayed first. `timeout` is a budget for
    /// the whole stream, charged only while it waits.
    pub fn stream(&self, timeout: Option<Duration>) -> Result<GroupStream<T>, QuiverError> {
        let mut inner = self.shared.lock();
        inner.begin(ConsumeMode::YieldEachOne, "stream")?;

        let replay: VecDeque<(TaskId, T)> = inner
            .results
            .iter()
            .map(|(id, value)| (*id, value.clone()))
            .collect();
        let outstanding = inner.unresolved();
        let completions = if outstanding == 0 {
            inner.state = GroupState::Done;
            None
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            inner.each_done = Some(tx);
            Some(rx)
        };
        drop(inner);

        Ok(GroupStream::new(
            Arc::clone(&self.shared),
            replay,
            outstanding,
            completions,
            timeout,
        ))
    }
}

impl<T> std::fmt::Debug for Group<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").field("id", &self.shared.id).finish_non_exhaustive()
    }
}
