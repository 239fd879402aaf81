//! Task scheduling engine: a bounded dispatch queue with a concurrency cap,
//! a timer scheduler, and fan-in groups, driven through [`Quiver`].

mod context;
pub mod group;
pub mod queue;
mod quiver;
pub mod task;
pub mod timer;

pub use context::{current_task_id, FinishObserver};
pub use group::{Group, GroupState, GroupStream};
pub use queue::QueueStats;
pub use quiver::Quiver;
pub use task::{DeferredHandle, FinishCallback, Outcome};
pub use timer::TimerStats;

pub use quiver_core::{GroupId, QuiverConfig, QuiverError, TaskError, TaskId};
