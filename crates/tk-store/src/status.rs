// status.rs — TaskStatus: the constrained task lifecycle.
//
// The transition table is directed, not symmetric:
//   pending     → in_progress | deferred
//   in_progress → review | pending
//   review      → done | in_progress
//   done        → pending
//   deferred    → pending
// Every known status may also "transition" to itself (a no-op).
//
// Task files written by other tools can carry statuses outside this set.
// They load as `TaskStatus::Unknown`, are written back verbatim, and never
// take part in a transition: the lifecycle table is the only place an
// unrecognized status is rejected.
//
// `transition()` never mutates its input: it borrows the task and hands
// back an updated copy, so a rejected change leaves the caller's task intact.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::task::Task;

/// The lifecycle status of a task or subtask.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    /// Not started yet.
    #[default]
    Pending,

    /// Someone is actively working on it.
    InProgress,

    /// Work is finished and awaiting review.
    Review,

    /// Reviewed and complete.
    Done,

    /// Parked for later.
    Deferred,

    /// A status string outside the lifecycle, kept as read.
    Unknown(String),
}

const FROM_PENDING: &[TaskStatus] = &[TaskStatus::InProgress, TaskStatus::Deferred];
const FROM_IN_PROGRESS: &[TaskStatus] = &[TaskStatus::Review, TaskStatus::Pending];
const FROM_REVIEW: &[TaskStatus] = &[TaskStatus::Done, TaskStatus::InProgress];
const FROM_DONE: &[TaskStatus] = &[TaskStatus::Pending];
const FROM_DEFERRED: &[TaskStatus] = &[TaskStatus::Pending];
const NO_EDGES: &[TaskStatus] = &[];

impl TaskStatus {
    /// Every status in the lifecycle, in order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Review,
        TaskStatus::Done,
        TaskStatus::Deferred,
    ];

    /// Statuses reachable from this one (excluding the self-transition).
    /// Empty for an unknown status.
    pub fn next_statuses(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => FROM_PENDING,
            TaskStatus::InProgress => FROM_IN_PROGRESS,
            TaskStatus::Review => FROM_REVIEW,
            TaskStatus::Done => FROM_DONE,
            TaskStatus::Deferred => FROM_DEFERRED,
            TaskStatus::Unknown(_) => NO_EDGES,
        }
    }

    /// Check whether moving from this status to `next` is allowed.
    /// Nothing moves to or from an unknown status, not even itself.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        if !self.is_known() || !next.is_known() {
            return false;
        }
        self == next || self.next_statuses().contains(next)
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, TaskStatus::Unknown(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
            TaskStatus::Deferred => "deferred",
            TaskStatus::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strict parse: only lifecycle statuses are accepted.
impl FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StoreError::UnknownStatus(s.to_string()))
    }
}

/// Lenient conversion used when reading task files.
impl From<String> for TaskStatus {
    fn from(raw: String) -> Self {
        raw.parse().unwrap_or(TaskStatus::Unknown(raw))
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

/// Typed transition check.
pub fn can_transition(from: &TaskStatus, to: &TaskStatus) -> bool {
    from.can_transition_to(to)
}

/// String-level transition check. Unrecognized statuses never validate.
pub fn can_transition_str(from: &str, to: &str) -> bool {
    match (from.parse::<TaskStatus>(), to.parse::<TaskStatus>()) {
        (Ok(from), Ok(to)) => can_transition(&from, &to),
        _ => false,
    }
}

/// Edge list for a status string; empty for an unknown status.
pub fn valid_next_statuses(status: &str) -> Vec<TaskStatus> {
    status
        .parse::<TaskStatus>()
        .map(|s| s.next_statuses().to_vec())
        .unwrap_or_default()
}

/// Apply a status change to a copy of `task`.
///
/// On success the returned task carries `status = to` and a fresh
/// `status_updated_at`; every other field is identical to the input.
pub fn transition(task: &Task, to: TaskStatus) -> Result<Task, StoreError> {
    if !task.status.can_transition_to(&to) {
        return Err(StoreError::InvalidTransition {
            task_id: task.id,
            from: task.status.to_string(),
            to: to.to_string(),
        });
    }
    let mut next = task.clone();
    next.status = to;
    next.status_updated_at = Some(Utc::now());
    Ok(next)
}
