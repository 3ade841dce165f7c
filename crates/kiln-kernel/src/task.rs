//! The task model — immutable identity, mutable status, structural equality.
//!
//! A task is a JSON descriptor describing one parameterized action for a
//! runner, plus the bookkeeping the store needs: id, creation timestamp and
//! status. Identity semantics:
//!
//! - `id` is `0` until the task is first persisted; the store then assigns a
//!   globally monotonic positive integer.
//! - Two tasks are the *same work* when their descriptors are structurally
//!   equal JSON trees ([`Task::same_as`]), regardless of id or timestamp.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::json;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
///
/// `New` and `Running` are live; `Done` and `Aborted` are terminal. The
/// store enforces which transitions are legal — the model itself does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    Running,
    Done,
    Aborted,
}

impl TaskStatus {
    /// The integer encoding used in the store's STATUS column.
    ///
    /// Positive values other than `1` are reserved for future per-runner
    /// states and decode as `Running`.
    pub const fn code(self) -> i64 {
        match self {
            TaskStatus::New => 0,
            TaskStatus::Running => 1,
            TaskStatus::Done => -1,
            TaskStatus::Aborted => -2,
        }
    }

    /// Decode a STATUS column value.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TaskStatus::New),
            -1 => Some(TaskStatus::Done),
            -2 => Some(TaskStatus::Aborted),
            c if c > 0 => Some(TaskStatus::Running),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Aborted)
    }
}

// ---------------------------------------------------------------------------
// TaskError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskError {
    /// A stored descriptor no longer parses as JSON.
    #[error("corrupt task descriptor: {0}")]
    Corrupt(#[source] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One unit of work for a runner.
#[derive(Debug, Clone)]
pub struct Task {
    id: u64,
    timestamp: DateTime<Utc>,
    status: TaskStatus,
    descriptor: Value,
}

impl Task {
    /// A fresh, unpersisted task (id 0, status `New`, timestamp now).
    pub fn new(descriptor: Value) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            status: TaskStatus::New,
            descriptor,
        }
    }

    /// A fresh task whose descriptor is `template` with `${key}` placeholders
    /// resolved from `env`.
    pub fn from_template(template: &Value, env: &HashMap<String, String>) -> Self {
        Self::new(json::resolve_template(template, env))
    }

    /// Rebuild a task from its stored row.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Corrupt`] when the serialized descriptor is not
    /// valid JSON.
    pub fn deserialize(
        id: u64,
        timestamp: DateTime<Utc>,
        status: TaskStatus,
        serialized: &str,
    ) -> Result<Self, TaskError> {
        let descriptor = serde_json::from_str(serialized).map_err(TaskError::Corrupt)?;
        Ok(Self { id, timestamp, status, descriptor })
    }

    /// Canonical compact JSON of the descriptor.
    ///
    /// Object keys serialize in sorted order, so the output is stable across
    /// invocations for a given descriptor value.
    pub fn serialize(&self) -> String {
        self.descriptor.to_string()
    }

    /// Structural equality of the descriptors (id, timestamp and status are
    /// deliberately ignored).
    pub fn same_as(&self, other: &Task) -> bool {
        json::structural_eq(&self.descriptor, &other.descriptor)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Assigned by the store when the task is first persisted.
    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Unchecked at the model level; the store validates transitions.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    pub fn descriptor(&self) -> &Value {
        &self.descriptor
    }

    /// The owning project, when the descriptor carries one.
    pub fn project_name(&self) -> Option<&str> {
        json::find_str(&self.descriptor, "project")
    }
}
