//! Task store contract.
//!
//! The store is the single durable resource of the scheduler: a table of
//! task rows keyed by a monotonic integer id. The in-memory queue is a pure
//! mirror of the store's `New` rows and is reconstructed from it on startup,
//! which is what lets queued work survive restarts.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::task::{Task, TaskStatus};

/// Schema version written to the store on first open. Opening a store with a
/// different version aborts startup.
pub const STORE_VERSION: i64 = 1;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be opened at all. Fatal at startup.
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    /// The store stayed busy beyond the bounded retry budget.
    #[error("task store busy")]
    Busy,

    /// A status update that the lifecycle does not allow. The row is left
    /// unchanged.
    #[error("illegal status transition {from:?} -> {to:?} for task {id}")]
    IllegalTransition {
        id: u64,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// The store was written by an incompatible version.
    #[error("task store schema version {found} is not supported (expected {expected})")]
    Incompatible { found: i64, expected: i64 },

    /// A status update referenced an id with no row.
    #[error("unknown task id {0}")]
    UnknownTask(u64),

    /// Any other storage-level failure.
    #[error("storage error: {0}")]
    Backend(String),
}

/// Legal status transitions: `New -> Running`, `Running -> Done`,
/// `Running -> Aborted`, and `New -> Aborted` (cancel before dispatch).
pub fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::New, TaskStatus::Running)
            | (TaskStatus::Running, TaskStatus::Done)
            | (TaskStatus::Running, TaskStatus::Aborted)
            | (TaskStatus::New, TaskStatus::Aborted)
    )
}

/// Durable append-and-update storage for tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a fresh task, assigning the next monotonic id. The id is
    /// written back into `task` and returned.
    async fn insert(&self, task: &mut Task) -> Result<u64, StoreError>;

    /// Apply a status transition, enforcing [`transition_allowed`].
    async fn update_status(&self, id: u64, status: TaskStatus) -> Result<(), StoreError>;

    /// All `New` rows, ordered by ascending id. Corrupt rows are logged and
    /// skipped.
    async fn load_new(&self) -> Result<Vec<Task>, StoreError>;

    /// Locate a live (`New` or `Running`) row by structural descriptor
    /// equality. Needed to accept runner results for tasks dispatched before
    /// a restart.
    async fn find_active(&self, descriptor: &Value) -> Result<Option<Task>, StoreError>;
}
