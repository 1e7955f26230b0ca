use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection, OptionalExtension};
use tracing::{debug, instrument};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::recurrence::Recurrence;
use crate::types::{FailureReason, RunOutcome, RunRecord, Task, TaskFilter};

/// How `put` treats an id that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Overwrite the stored definition.
    Upsert,
    /// Fail with `Conflict` instead of overwriting.
    CreateIfAbsent,
}

/// One page of a cursored listing.
#[derive(Debug, Clone)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    /// Pass back as `after` to fetch the following page. `None` on the last page.
    pub next_cursor: Option<i64>,
}

/// Durable home of task definitions and their run history.
///
/// Every method is linearizable per task id, and every mutation is applied
/// as a single atomic unit. Storage failures surface as
/// [`SchedulerError::Storage`] and are never retried here.
pub trait TaskStore: Send + Sync {
    fn put(&self, task: &Task, mode: PutMode) -> Result<()>;

    /// Fetch a task in any status. `TaskNotFound` if the id was never stored.
    fn get(&self, id: &str) -> Result<Task>;

    /// Tasks in creation order, starting after cursor `after`.
    fn list_page(&self, filter: TaskFilter, after: Option<i64>, limit: usize) -> Result<TaskPage>;

    /// Atomic read-modify-write of one task.
    ///
    /// `f` sees the current row and may change anything but the id; the
    /// result is written back in the same transaction. `next_due_at` may not
    /// move backwards.
    fn modify(&self, id: &str, f: &mut dyn FnMut(&mut Task) -> Result<()>) -> Result<Task>;

    /// Append a run record without touching the task.
    fn append_run(&self, record: &RunRecord) -> Result<()>;

    /// Append a terminal run record and advance the task past
    /// `record.scheduled_for`, atomically.
    ///
    /// The advance is guarded on the task still being at
    /// `record.scheduled_for`; if another writer got there first nothing is
    /// written and `Conflict` is returned. On success `last_run_at` becomes
    /// the occurrence; a failed (abandoned) occurrence leaves it untouched.
    fn finish_occurrence(&self, record: &RunRecord, next_due_at: DateTime<Utc>) -> Result<()>;

    /// Number of failed attempts already recorded for one occurrence.
    fn count_failures(&self, task_id: &str, scheduled_for: DateTime<Utc>) -> Result<u32>;

    /// Full run history of a task, oldest first.
    fn list_runs(&self, task_id: &str) -> Result<Vec<RunRecord>>;
}

/// Lazy, finite listing over a [`TaskStore`], one page at a time.
///
/// Restart by building a new iterator. A storage error is yielded once and
/// ends the iteration.
pub struct TaskIter<'a> {
    store: &'a dyn TaskStore,
    filter: TaskFilter,
    page_size: usize,
    cursor: Option<i64>,
    buffer: std::vec::IntoIter<Task>,
    exhausted: bool,
}

impl<'a> TaskIter<'a> {
    pub fn new(store: &'a dyn TaskStore, filter: TaskFilter, page_size: usize) -> Self {
        Self {
            store,
            filter,
            page_size: page_size.max(1),
            cursor: None,
            buffer: Vec::new().into_iter(),
            exhausted: false,
        }
    }
}

impl Iterator for TaskIter<'_> {
    type Item = Result<Task>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(task) = self.buffer.next() {
                return Some(Ok(task));
            }
            if self.exhausted {
                return None;
            }
            match self.store.list_page(self.filter, self.cursor, self.page_size) {
                Ok(page) => {
                    self.exhausted = page.next_cursor.is_none();
                    self.cursor = page.next_cursor;
                    self.buffer = page.tasks.into_iter();
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

const TASK_COLUMNS: &str =
    "seq, id, name, recurrence, status, created_at, last_run_at, next_due_at";

const RUN_COLUMNS: &str =
    "task_id, scheduled_for, started_at, finished_at, outcome, reason, missed, artifact";

/// SQLite-backed [`TaskStore`].
///
/// Wraps a single connection in a `Mutex`, which serializes every operation
/// and makes each one linearizable.
pub struct SqliteTaskStore {
    db: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Wrap an open connection, enabling foreign keys and creating the
    /// schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| SchedulerError::Storage("task store lock poisoned".to_string()))
    }
}

impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    fn put(&self, task: &Task, mode: PutMode) -> Result<()> {
        let sql = match mode {
            PutMode::CreateIfAbsent => {
                "INSERT INTO tasks
                 (id, name, recurrence, status, created_at, last_run_at, next_due_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            }
            PutMode::Upsert => {
                "INSERT INTO tasks
                 (id, name, recurrence, status, created_at, last_run_at, next_due_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (id) DO UPDATE SET
                    name        = excluded.name,
                    recurrence  = excluded.recurrence,
                    status      = excluded.status,
                    created_at  = excluded.created_at,
                    last_run_at = excluded.last_run_at,
                    next_due_at = excluded.next_due_at"
            }
        };

        let db = self.conn()?;
        db.execute(
            sql,
            rusqlite::params![
                task.id,
                task.name,
                task.recurrence.to_string(),
                task.status.to_string(),
                ts(task.created_at),
                task.last_run_at.map(ts),
                ts(task.next_due_at),
            ],
        )
        .map_err(|e| {
            if is_constraint(&e) {
                SchedulerError::Conflict {
                    id: task.id.clone(),
                    reason: "task id already exists".to_string(),
                }
            } else {
                e.into()
            }
        })?;
        debug!("task stored");
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Task> {
        let db = self.conn()?;
        select_task(&db, id)?.ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })
    }

    #[instrument(skip(self))]
    fn list_page(&self, filter: TaskFilter, after: Option<i64>, limit: usize) -> Result<TaskPage> {
        let limit = limit.max(1);
        let db = self.conn()?;
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE seq > ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY seq
             LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params![
                    after.unwrap_or(0),
                    filter.status.map(|s| s.to_string()),
                    limit as i64
                ],
                row_to_task,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let next_cursor = if rows.len() == limit {
            rows.last().map(|(seq, _)| *seq)
        } else {
            None
        };
        Ok(TaskPage {
            tasks: rows.into_iter().map(|(_, task)| task).collect(),
            next_cursor,
        })
    }

    #[instrument(skip(self, f), fields(task_id = %id))]
    fn modify(&self, id: &str, f: &mut dyn FnMut(&mut Task) -> Result<()>) -> Result<Task> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;

        let current =
            select_task(&tx, id)?.ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        let mut updated = current.clone();
        f(&mut updated)?;

        if updated.id != current.id {
            return Err(SchedulerError::Validation("task id is immutable".to_string()));
        }
        if updated.next_due_at < current.next_due_at {
            return Err(SchedulerError::Validation(format!(
                "next_due_at may not move backwards ({} -> {})",
                current.next_due_at, updated.next_due_at
            )));
        }
        if updated == current {
            return Ok(current);
        }

        tx.execute(
            "UPDATE tasks SET name = ?1, recurrence = ?2, status = ?3,
                              last_run_at = ?4, next_due_at = ?5
             WHERE id = ?6",
            rusqlite::params![
                updated.name,
                updated.recurrence.to_string(),
                updated.status.to_string(),
                updated.last_run_at.map(ts),
                ts(updated.next_due_at),
                id,
            ],
        )?;
        tx.commit()?;
        debug!(status = %updated.status, "task modified");
        Ok(updated)
    }

    #[instrument(skip(self, record), fields(task_id = %record.task_id, scheduled_for = %record.scheduled_for))]
    fn append_run(&self, record: &RunRecord) -> Result<()> {
        let db = self.conn()?;
        insert_run(&db, record)
    }

    #[instrument(skip(self, record), fields(task_id = %record.task_id, scheduled_for = %record.scheduled_for))]
    fn finish_occurrence(&self, record: &RunRecord, next_due_at: DateTime<Utc>) -> Result<()> {
        if next_due_at <= record.scheduled_for {
            return Err(SchedulerError::Validation(format!(
                "next_due_at {next_due_at} must be after the finished occurrence {}",
                record.scheduled_for
            )));
        }

        let mut db = self.conn()?;
        let tx = db.transaction()?;
        insert_run(&tx, record)?;

        let last_run_at = record
            .outcome
            .is_success()
            .then(|| ts(record.scheduled_for));
        let advanced = tx.execute(
            "UPDATE tasks SET next_due_at = ?1, last_run_at = COALESCE(?2, last_run_at)
             WHERE id = ?3 AND next_due_at = ?4",
            rusqlite::params![
                ts(next_due_at),
                last_run_at,
                record.task_id,
                ts(record.scheduled_for),
            ],
        )?;
        if advanced == 0 {
            // Dropping `tx` rolls the run record back too.
            return Err(SchedulerError::Conflict {
                id: record.task_id.clone(),
                reason: format!("occurrence {} was already finished", record.scheduled_for),
            });
        }
        tx.commit()?;
        Ok(())
    }

    fn count_failures(&self, task_id: &str, scheduled_for: DateTime<Utc>) -> Result<u32> {
        let db = self.conn()?;
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM run_records
             WHERE task_id = ?1 AND scheduled_for = ?2 AND outcome = 'failure'",
            rusqlite::params![task_id, ts(scheduled_for)],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }

    fn list_runs(&self, task_id: &str) -> Result<Vec<RunRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {RUN_COLUMNS} FROM run_records WHERE task_id = ?1 ORDER BY seq"
        ))?;
        let runs = stmt
            .query_map([task_id], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}

// --- row mapping -----------------------------------------------------------

/// Timestamps are stored as fixed-width RFC 3339 so equality and ordering
/// work on the text.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn select_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            [id],
            row_to_task,
        )
        .optional()?;
    Ok(task.map(|(_, task)| task))
}

/// Map a `tasks` row to `(seq, Task)`.
fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, Task)> {
    let recurrence: String = row.get(3)?;
    let recurrence = Recurrence::parse(&recurrence)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    let status: String = row.get(4)?;
    let status = status.parse().map_err(|e| conversion_error(4, e))?;
    let last_run_at = row
        .get::<_, Option<String>>(6)?
        .map(|raw| parse_ts(6, &raw))
        .transpose()?;

    Ok((
        row.get(0)?,
        Task {
            id: row.get(1)?,
            name: row.get(2)?,
            recurrence,
            status,
            created_at: parse_ts(5, &row.get::<_, String>(5)?)?,
            last_run_at,
            next_due_at: parse_ts(7, &row.get::<_, String>(7)?)?,
        },
    ))
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let outcome: String = row.get(4)?;
    let outcome = match outcome.as_str() {
        "success" => RunOutcome::Success {
            artifact: row.get(7)?,
        },
        "failure" => RunOutcome::Failure {
            reason: FailureReason::parse(&row.get::<_, Option<String>>(5)?.unwrap_or_default()),
            missed: row.get::<_, i64>(6)? != 0,
        },
        other => return Err(conversion_error(4, format!("unknown run outcome: {other}"))),
    };

    Ok(RunRecord {
        task_id: row.get(0)?,
        scheduled_for: parse_ts(1, &row.get::<_, String>(1)?)?,
        started_at: parse_ts(2, &row.get::<_, String>(2)?)?,
        finished_at: parse_ts(3, &row.get::<_, String>(3)?)?,
        outcome,
    })
}

fn insert_run(conn: &Connection, record: &RunRecord) -> Result<()> {
    let (outcome, reason, missed, artifact) = match &record.outcome {
        RunOutcome::Success { artifact } => ("success", None, false, artifact.clone()),
        RunOutcome::Failure { reason, missed } => {
            ("failure", Some(reason.to_string()), *missed, None)
        }
    };

    conn.execute(
        &format!(
            "INSERT INTO run_records ({RUN_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        rusqlite::params![
            record.task_id,
            ts(record.scheduled_for),
            ts(record.started_at),
            ts(record.finished_at),
            outcome,
            reason,
            missed as i64,
            artifact,
        ],
    )
    .map_err(|e| match constraint_code(&e) {
        Some(rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY) => SchedulerError::TaskNotFound {
            id: record.task_id.clone(),
        },
        Some(_) => SchedulerError::Conflict {
            id: record.task_id.clone(),
            reason: format!(
                "a successful run is already recorded for {}",
                record.scheduled_for
            ),
        },
        None => e.into(),
    })?;
    Ok(())
}

fn constraint_code(e: &rusqlite::Error) -> Option<i32> {
    match e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Some(f.extended_code)
        }
        _ => None,
    }
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    constraint_code(e).is_some()
}
