use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `triggers` table (idempotent) and an index on
/// `(status, fires_at_ms)` so the due-trigger query stays cheap with many
/// finished rows kept for audit.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS triggers (
            id           TEXT    NOT NULL PRIMARY KEY,
            device_id    TEXT    NOT NULL,
            schedule_id  TEXT    NOT NULL,
            kind         TEXT    NOT NULL,   -- notice_start | notice_end | stopwatch_start | stopwatch_end
            action       TEXT    NOT NULL,   -- JSON-encoded TriggerAction
            fires_at_ms  INTEGER NOT NULL,   -- Unix epoch milliseconds
            status       TEXT    NOT NULL DEFAULT 'pending',
            last_error   TEXT,
            created_at   TEXT    NOT NULL,
            updated_at   TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_triggers_due ON triggers (status, fires_at_ms);
        CREATE INDEX IF NOT EXISTS idx_triggers_schedule ON triggers (schedule_id);
        ",
    )?;
    Ok(())
}
