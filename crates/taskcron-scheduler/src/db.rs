use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `tasks` and `run_records` tables (idempotent). `seq` gives
/// listings a stable creation order and a cursor for keyset pagination.
/// The partial unique index is the last line of defence against recording
/// two successful runs for the same occurrence.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            seq          INTEGER PRIMARY KEY AUTOINCREMENT,
            id           TEXT    NOT NULL UNIQUE,
            name         TEXT    NOT NULL,
            recurrence   TEXT    NOT NULL,   -- normalised five-field expression
            status       TEXT    NOT NULL DEFAULT 'active',
            created_at   TEXT    NOT NULL,
            last_run_at  TEXT,               -- RFC 3339 or NULL
            next_due_at  TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_tasks_status_seq ON tasks (status, seq);

        CREATE TABLE IF NOT EXISTS run_records (
            seq            INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id        TEXT    NOT NULL REFERENCES tasks (id),
            scheduled_for  TEXT    NOT NULL,
            started_at     TEXT    NOT NULL,
            finished_at    TEXT    NOT NULL,
            outcome        TEXT    NOT NULL,   -- 'success' | 'failure'
            reason         TEXT,
            missed         INTEGER NOT NULL DEFAULT 0,
            artifact       TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_runs_occurrence
            ON run_records (task_id, scheduled_for);

        CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_success
            ON run_records (task_id, scheduled_for)
            WHERE outcome = 'success';
        ",
    )?;
    Ok(())
}
