use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

use quiver_core::{QuiverError, TaskId};

use super::{GroupShared, GroupState};

/// Single-pass consumer of a group's successes in completion order.
///
/// Failed members are skipped. A timeout ends the stream with one
/// `Err(Timeout)` item; the members keep running.
pub struct GroupStream<T> {
    shared: Arc<GroupShared<T>>,
    replay: VecDeque<(TaskId, T)>,
    outstanding: usize,
    completions: Option<mpsc::UnboundedReceiver<TaskId>>,
    budget: Option<Duration>,
    remaining: Option<Duration>,
}

impl<T: Clone + Send + 'static> GroupStream<T> {
    pub(super) fn new(
        shared: Arc<GroupShared<T>>,
        replay: VecDeque<(TaskId, T)>,
        outstanding: usize,
        completions: Option<mpsc::UnboundedReceiver<TaskId>>,
        budget: Option<Duration>,
    ) -> Self {
        Self {
            shared,
            replay,
            outstanding,
            completions,
            budget,
            remaining: budget,
        }
    }

    /// Next `(id, result)` pair, or `None` once every member has resolved.
    pub async fn next(&mut self) -> Option<Result<(TaskId, T), QuiverError>> {
        if let Some(pair) = self.replay.pop_front() {
            return Some(Ok(pair));
        }

        while self.outstanding > 0 {
            let completions = self.completions.as_mut()?;
            let received = match self.remaining {
                Some(left) => {
                    let started = Instant::now();
                    let waited = tokio::time::timeout(left, completions.recv()).await;
                    match waited {
                        Ok(received) => {
                            self.remaining = Some(left.saturating_sub(started.elapsed()));
                            received
                        }
                        Err(_) => {
                            self.abort();
                            return Some(Err(QuiverError::Timeout(self.budget.unwrap_or(left))));
                        }
                    }
                }
                None => completions.recv().await,
            };

            let Some(id) = received else {
                self.abort();
                return Some(Err(QuiverError::QueueClosed));
            };
            self.outstanding -= 1;
            let value = self.shared.lock().results.get(&id).cloned();
            if self.outstanding == 0 {
                self.complete();
            }
            if let Some(value) = value {
                return Some(Ok((id, value)));
            }
        }
        None
    }

    /// Drain the rest of the stream and return every success, in completion
    /// order. This is the same map [`super::Group::wait_for_all`] produces.
    pub async fn into_results(mut self) -> Result<IndexMap<TaskId, T>, QuiverError> {
        while let Some(item) = self.next().await {
            item?;
        }
        Ok(std::mem::take(&mut self.shared.lock().results))
    }

    /// Adapt to a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<(TaskId, T), QuiverError>> + Send {
        futures::stream::unfold(self, |mut this| async move {
            let item = this.next().await?;
            Some((item, this))
        })
    }

    /// Members not yet seen by this stream.
    pub fn outstanding(&self) -> usize {
        self.replay.len() + self.outstanding
    }

    fn complete(&mut self) {
        self.completions = None;
        let mut inner = self.shared.lock();
        inner.state = GroupState::Done;
        inner.each_done = None;
    }

    /// Stop consuming. The group stays `Waiting` since members are unresolved.
    fn abort(&mut self) {
        self.outstanding = 0;
        self.completions = None;
        self.shared.lock().each_done = None;
    }
}

impl<T> std::fmt::Debug for GroupStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupStream")
            .field("group_id", &self.shared.id)
            .field("replay", &self.replay.len())
            .field("outstanding", &self.outstanding)
            .field("remaining", &self.remaining)
            .finish()
    }
}
