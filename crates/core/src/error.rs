use std::time::Duration;

use thiserror::Error;

use crate::ids::TaskId;

/// Failure raised by a task payload.
///
/// `Clone` so that group error maps can be handed out more than once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError::Failed(format!("{:#}", e))
    }
}

#[derive(Error, Debug)]
pub enum QuiverError {
    /// The dispatch queue or timer scheduler has been stopped.
    #[error("queue closed")]
    QueueClosed,

    /// A wait exceeded its budget. The underlying task keeps running.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("wrong state for {op}: {state}")]
    WrongState {
        op: &'static str,
        state: &'static str,
    },

    #[error("task {0} is not a member of this group")]
    UnknownMember(TaskId),

    #[error("outcome already registered for task {0}")]
    AlreadyRegistered(TaskId),

    #[error("task {0} already executed")]
    AlreadyExecuted(TaskId),

    #[error("outcome of task {0} already received")]
    AlreadyReceived(TaskId),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl QuiverError {
    /// Whether this error signals a usage bug rather than a runtime condition.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            QuiverError::WrongState { .. }
                | QuiverError::UnknownMember(_)
                | QuiverError::AlreadyRegistered(_)
                | QuiverError::AlreadyExecuted(_)
                | QuiverError::AlreadyReceived(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_chain_is_kept() {
        let err = anyhow::anyhow!("disk full").context("writing segment");
        let task_err = TaskError::from(err);
        assert_eq!(
            task_err,
            TaskError::Failed("writing segment: disk full".to_string())
        );
    }

    #[test]
    fn task_error_converts_into_quiver_error() {
        let err: QuiverError = TaskError::Panicked("boom".into()).into();
        assert!(matches!(err, QuiverError::Task(TaskError::Panicked(_))));
        assert_eq!(err.to_string(), "task panicked: boom");
    }

    #[test]
    fn consistency_classification() {
        assert!(QuiverError::AlreadyRegistered(TaskId::next()).is_consistency());
        assert!(QuiverError::WrongState { op: "add", state: "done" }.is_consistency());
        assert!(!QuiverError::QueueClosed.is_consistency());
        assert!(!QuiverError::Timeout(Duration::from_millis(10)).is_consistency());
    }
}
