//! `taskcron-scheduler` — durable cron-style task scheduling on SQLite.
//!
//! # Overview
//!
//! Task definitions live in a [`store::TaskStore`]. The [`registry::TaskRegistry`]
//! creates, lists, pauses, resumes and (logically) deletes them. On every tick
//! the [`engine::SchedulerLoop`] collects the Active tasks that are due, hands
//! each pending occurrence to an [`sink::ExecutionSink`] and records the
//! outcome, advancing the task to its next occurrence in the same write.
//!
//! # Recurrence grammar
//!
//! | Field        | Domain | Notes              |
//! |--------------|--------|--------------------|
//! | minute       | 0–59   |                    |
//! | hour         | 0–23   |                    |
//! | day-of-month | 1–31   |                    |
//! | month        | 1–12   |                    |
//! | day-of-week  | 0–6    | 0 = Sunday         |
//!
//! Each field is `*` or a single integer. All times are UTC.
//!
//! # Delivery guarantees
//!
//! An occurrence is executed until it succeeds or fails twice (one retry).
//! The run record and the advance of `next_due_at` are written atomically,
//! so a crash before the write retries the occurrence and a crash after it
//! does not repeat it.

pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod recurrence;
pub mod registry;
pub mod sink;
pub mod store;
pub mod types;

pub use clock::{Clock, IdGenerator, ManualClock, SequentialIds, SystemClock, UuidV7Ids};
pub use engine::{EngineConfig, SchedulerLoop, TickPhase, TickReport, MAX_RETRIES_PER_OCCURRENCE};
pub use error::{Result, SchedulerError};
pub use recurrence::Recurrence;
pub use registry::TaskRegistry;
pub use sink::{ArtifactRef, ExecutionSink};
pub use store::{PutMode, SqliteTaskStore, TaskIter, TaskPage, TaskStore};
pub use types::{FailureReason, RunOutcome, RunRecord, Task, TaskFilter, TaskStatus};
