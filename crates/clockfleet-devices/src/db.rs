use rusqlite::Connection;

use crate::error::Result;

/// Initialise the device tables.
///
/// The two array fields of a device (scheduled notices, stopwatches) live in
/// child tables so appending or removing one element is a single-row
/// INSERT/DELETE rather than a rewrite of the whole device record.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS devices (
            id                  TEXT PRIMARY KEY NOT NULL,
            link_ref            TEXT NOT NULL UNIQUE,
            connectivity        TEXT NOT NULL DEFAULT 'offline',
            mode                TEXT NOT NULL DEFAULT 'clock',
            current_notice      TEXT,
            notice_duration_ms  INTEGER,
            notice_schedule_id  TEXT,
            pending_notice      INTEGER NOT NULL DEFAULT 0,
            stopwatch_id        TEXT,                         -- running stopwatch
            telemetry           TEXT NOT NULL DEFAULT '{}',   -- JSON object
            last_seen_ms        INTEGER,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scheduled_notices (
            schedule_id  TEXT PRIMARY KEY NOT NULL,
            device_id    TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            notice       TEXT NOT NULL,
            start_ms     INTEGER NOT NULL,
            duration_ms  INTEGER NOT NULL,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_scheduled_notices_device
            ON scheduled_notices(device_id, start_ms);

        CREATE TABLE IF NOT EXISTS stopwatches (
            schedule_id  TEXT PRIMARY KEY NOT NULL,
            device_id    TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            start_ms     INTEGER NOT NULL,
            end_ms       INTEGER NOT NULL,
            direction    TEXT NOT NULL,
            executed     INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_stopwatches_device
            ON stopwatches(device_id, start_ms);",
    )?;
    Ok(())
}
