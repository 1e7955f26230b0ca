use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recurrence::Recurrence;

/// Lifecycle state of a task definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Considered by every tick.
    Active,
    /// Kept, but skipped by the scheduler until resumed.
    Paused,
    /// Logically deleted. The row stays so run history keeps its owner.
    Deleted,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            "deleted" => Ok(TaskStatus::Deleted),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A persisted task definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Opaque unique identifier, never changes after creation.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// Parsed five-field recurrence.
    pub recurrence: Recurrence,
    pub created_at: DateTime<Utc>,
    /// The occurrence of the last successful dispatch, if any.
    pub last_run_at: Option<DateTime<Utc>>,
    /// The occurrence the scheduler will dispatch next.
    pub next_due_at: DateTime<Utc>,
    pub status: TaskStatus,
}

impl Task {
    /// True once the clock has reached the pending occurrence.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_due_at
    }
}

/// Why an execution attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    /// The sink did not answer within the dispatch timeout.
    Timeout,
    /// The sink reported an error.
    Sink(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Sink(msg) => write!(f, "sink: {msg}"),
        }
    }
}

impl FailureReason {
    /// Inverse of `Display`, used when reading run history back from storage.
    pub fn parse(s: &str) -> Self {
        match s {
            "timeout" => FailureReason::Timeout,
            other => FailureReason::Sink(other.strip_prefix("sink: ").unwrap_or(other).to_string()),
        }
    }
}

/// Terminal result of a single dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Success {
        /// Opaque reference handed back by the sink (file path, message id, ...).
        artifact: Option<String>,
    },
    Failure {
        reason: FailureReason,
        /// Set when this failure exhausted the retry budget and the
        /// occurrence was abandoned.
        missed: bool,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success { .. })
    }
}

/// One row of the append-only run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub task_id: String,
    /// The occurrence this attempt was made for.
    pub scheduled_for: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
}

/// Status filter for listings. `None` means every status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self { status: None }
    }

    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| s == task.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [TaskStatus::Active, TaskStatus::Paused, TaskStatus::Deleted] {
            let parsed: TaskStatus = status.to_string().parse().expect("parse failed");
            assert_eq!(parsed, status);
        }
        assert!("archived".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn failure_reason_parses_display_form() {
        assert_eq!(FailureReason::parse("timeout"), FailureReason::Timeout);
        let sink = FailureReason::Sink("disk full".to_string());
        assert_eq!(FailureReason::parse(&sink.to_string()), sink);
    }
}
