use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use clockfleet_core::clock::rfc3339_now;
use clockfleet_core::{Connectivity, DeviceId, LinkRef, ScheduleId};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, instrument};

use crate::db::init_db;
use crate::error::{DeviceStoreError, Result};
use crate::overlap::find_conflict;
use crate::types::{Device, LinkUpsert, ModeChange, ScheduledNotice, Stopwatch};

const DEVICE_SELECT_SQL: &str = "SELECT id, link_ref, connectivity, mode, current_notice,
        notice_duration_ms, notice_schedule_id, pending_notice, telemetry,
        last_seen_ms, created_at, updated_at, stopwatch_id
 FROM devices";

/// Durable record of every device's connectivity, mode and pending work.
///
/// Wraps a single SQLite connection in a `Mutex`; each public method is one
/// short critical section. Array-field mutations are single-row statements
/// against the child tables, and the overlap check for scheduled notices runs
/// inside the same IMMEDIATE transaction as the insert it guards.
pub struct DeviceStore {
    db: Mutex<Connection>,
}

impl DeviceStore {
    /// Wrap a connection, creating the schema if it does not exist yet.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a device explicitly. Re-provisioning an existing id updates
    /// its link ref and leaves every other field alone.
    #[instrument(skip(self, id, link_ref), fields(device_id = %id, link_ref = %link_ref))]
    pub fn provision(&self, id: &DeviceId, link_ref: &LinkRef) -> Result<Device> {
        let db = self.conn();
        let now = rfc3339_now();
        db.execute(
            "INSERT INTO devices (id, link_ref, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 link_ref = excluded.link_ref,
                 updated_at = excluded.updated_at",
            rusqlite::params![id.as_str(), link_ref.as_str(), now],
        )?;
        debug!("device provisioned");
        fetch_device(&db, id)
    }

    #[instrument(skip(self), fields(device_id = %id))]
    pub fn get(&self, id: &DeviceId) -> Result<Device> {
        let db = self.conn();
        fetch_device(&db, id)
    }

    pub fn find_by_link_ref(&self, link_ref: &LinkRef) -> Result<Option<Device>> {
        let db = self.conn();
        let row = db
            .query_row(
                &format!("{DEVICE_SELECT_SQL} WHERE link_ref = ?1"),
                [link_ref.as_str()],
                row_to_device,
            )
            .optional()?;
        match row {
            Some(mut device) => {
                load_children(&db, &mut device)?;
                Ok(Some(device))
            }
            None => Ok(None),
        }
    }

    /// All devices ordered by id.
    pub fn list(&self) -> Result<Vec<Device>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!("{DEVICE_SELECT_SQL} ORDER BY id"))?;
        let mut devices = stmt
            .query_map([], row_to_device)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        for device in &mut devices {
            load_children(&db, device)?;
        }
        Ok(devices)
    }

    pub fn count(&self) -> Result<usize> {
        let db = self.conn();
        let n: i64 = db.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Create-or-merge a device from a device-link report.
    ///
    /// Telemetry is merged key by key into the stored object and `last_seen_ms`
    /// is refreshed. The previous connectivity is read in the same transaction
    /// so callers can tell a real offline→online transition from a repeat.
    #[instrument(skip(self, id, link_ref, connectivity, telemetry), fields(device_id = %id, %connectivity))]
    pub fn upsert_from_link(
        &self,
        id: &DeviceId,
        link_ref: &LinkRef,
        connectivity: Connectivity,
        telemetry: &serde_json::Value,
        seen_ms: i64,
    ) -> Result<LinkUpsert> {
        let patch = if telemetry.is_object() {
            telemetry.to_string()
        } else {
            "{}".to_string()
        };
        let now = rfc3339_now();

        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let previous: Option<String> = tx
            .query_row(
                "SELECT connectivity FROM devices WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let previous = previous
            .map(|s| Connectivity::from_str(&s))
            .transpose()
            .map_err(|e| DeviceStoreError::Database(conversion_error(2, e)))?;

        tx.execute(
            "INSERT INTO devices
                 (id, link_ref, connectivity, telemetry, last_seen_ms, created_at, updated_at)
             VALUES (?1, ?2, ?3, json(?4), ?5, ?6, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 connectivity = excluded.connectivity,
                 telemetry    = json_patch(devices.telemetry, excluded.telemetry),
                 last_seen_ms = excluded.last_seen_ms,
                 updated_at   = excluded.updated_at",
            rusqlite::params![
                id.as_str(),
                link_ref.as_str(),
                connectivity.as_str(),
                patch,
                seen_ms,
                now
            ],
        )?;
        let device = fetch_device(&tx, id)?;
        tx.commit()?;

        Ok(LinkUpsert { device, previous })
    }

    /// Atomically write the mode-related fields described by `change`.
    #[instrument(skip(self), fields(device_id = %id))]
    pub fn apply_mode_change(&self, id: &DeviceId, change: &ModeChange) -> Result<Device> {
        let db = self.conn();
        let now = rfc3339_now();
        let rows = match change {
            ModeChange::Clock => db.execute(
                "UPDATE devices
                 SET mode = 'clock', notice_schedule_id = NULL, stopwatch_id = NULL,
                     updated_at = ?2
                 WHERE id = ?1",
                rusqlite::params![id.as_str(), now],
            )?,
            ModeChange::Notice {
                text,
                duration_ms,
                schedule_id,
            } => db.execute(
                "UPDATE devices
                 SET mode = 'notice', current_notice = ?2, notice_duration_ms = ?3,
                     notice_schedule_id = ?4, pending_notice = 0, stopwatch_id = NULL,
                     updated_at = ?5
                 WHERE id = ?1",
                rusqlite::params![
                    id.as_str(),
                    text,
                    duration_ms,
                    schedule_id.as_ref().map(|s| s.as_str()),
                    now
                ],
            )?,
            ModeChange::PendingNotice {
                text,
                duration_ms,
                schedule_id,
            } => db.execute(
                "UPDATE devices
                 SET current_notice = ?2, notice_duration_ms = ?3,
                     notice_schedule_id = ?4, pending_notice = 1, updated_at = ?5
                 WHERE id = ?1",
                rusqlite::params![
                    id.as_str(),
                    text,
                    duration_ms,
                    schedule_id.as_ref().map(|s| s.as_str()),
                    now
                ],
            )?,
            ModeChange::DropPendingNotice => db.execute(
                "UPDATE devices SET pending_notice = 0, notice_schedule_id = NULL, updated_at = ?2
                 WHERE id = ?1",
                rusqlite::params![id.as_str(), now],
            )?,
            ModeChange::Stopwatch { schedule_id } => db.execute(
                "UPDATE devices SET mode = 'stopwatch', stopwatch_id = ?2, updated_at = ?3
                 WHERE id = ?1",
                rusqlite::params![id.as_str(), schedule_id.as_str(), now],
            )?,
        };
        if rows == 0 {
            return Err(DeviceStoreError::NotFound { id: id.clone() });
        }
        fetch_device(&db, id)
    }

    /// Append a scheduled notice unless it overlaps one already persisted.
    ///
    /// Validation reads the current rows inside an IMMEDIATE transaction, so
    /// two concurrent requests for the same device cannot both pass against
    /// a stale list.
    #[instrument(skip(self, entry), fields(device_id = %id, schedule_id = %entry.schedule_id))]
    pub fn push_scheduled_notice_checked(
        &self,
        id: &DeviceId,
        entry: &ScheduledNotice,
    ) -> Result<()> {
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_exists(&tx, id)?;

        let existing = fetch_scheduled_notices(&tx, id)?;
        if let Some(conflict) = find_conflict(&existing, entry.start_ms, entry.duration_ms) {
            debug!(conflicting = %conflict.schedule_id, "scheduled notice rejected");
            return Err(DeviceStoreError::Overlap {
                conflicting: conflict.schedule_id.clone(),
            });
        }

        tx.execute(
            "INSERT INTO scheduled_notices
                 (schedule_id, device_id, notice, start_ms, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                entry.schedule_id.as_str(),
                id.as_str(),
                entry.notice,
                entry.start_ms,
                entry.duration_ms,
                rfc3339_now()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove one scheduled notice, returning it if it existed.
    pub fn remove_scheduled_notice(
        &self,
        id: &DeviceId,
        schedule_id: &ScheduleId,
    ) -> Result<Option<ScheduledNotice>> {
        let db = self.conn();
        let removed = db
            .query_row(
                "DELETE FROM scheduled_notices WHERE device_id = ?1 AND schedule_id = ?2
                 RETURNING schedule_id, notice, start_ms, duration_ms",
                [id.as_str(), schedule_id.as_str()],
                row_to_scheduled_notice,
            )
            .optional()?;
        Ok(removed)
    }

    pub fn scheduled_notices(&self, id: &DeviceId) -> Result<Vec<ScheduledNotice>> {
        let db = self.conn();
        ensure_exists(&db, id)?;
        Ok(fetch_scheduled_notices(&db, id)?)
    }

    pub fn push_stopwatch(&self, id: &DeviceId, entry: &Stopwatch) -> Result<()> {
        let db = self.conn();
        ensure_exists(&db, id)?;
        db.execute(
            "INSERT INTO stopwatches
                 (schedule_id, device_id, start_ms, end_ms, direction, executed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.schedule_id.as_str(),
                id.as_str(),
                entry.start_ms,
                entry.end_ms,
                entry.count_direction.as_str(),
                entry.executed,
                rfc3339_now()
            ],
        )?;
        Ok(())
    }

    /// Flag a stopwatch as published. Returns false if the entry is gone.
    pub fn mark_stopwatch_executed(&self, id: &DeviceId, schedule_id: &ScheduleId) -> Result<bool> {
        let db = self.conn();
        let n = db.execute(
            "UPDATE stopwatches SET executed = 1 WHERE device_id = ?1 AND schedule_id = ?2",
            [id.as_str(), schedule_id.as_str()],
        )?;
        Ok(n > 0)
    }

    pub fn remove_stopwatch(
        &self,
        id: &DeviceId,
        schedule_id: &ScheduleId,
    ) -> Result<Option<Stopwatch>> {
        let db = self.conn();
        let removed = db
            .query_row(
                "DELETE FROM stopwatches WHERE device_id = ?1 AND schedule_id = ?2
                 RETURNING schedule_id, start_ms, end_ms, direction, executed",
                [id.as_str(), schedule_id.as_str()],
                row_to_stopwatch,
            )
            .optional()?;
        Ok(removed)
    }

    pub fn stopwatches(&self, id: &DeviceId) -> Result<Vec<Stopwatch>> {
        let db = self.conn();
        ensure_exists(&db, id)?;
        Ok(fetch_stopwatches(&db, id)?)
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn parse_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

/// Map a row from `DEVICE_SELECT_SQL` to a device without its array fields.
fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    let telemetry_raw: String = row.get(8)?;
    let telemetry = serde_json::from_str(&telemetry_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;
    Ok(Device {
        id: DeviceId(row.get(0)?),
        link_ref: LinkRef(row.get(1)?),
        connectivity: parse_column(row, 2)?,
        mode: parse_column(row, 3)?,
        current_notice: row.get(4)?,
        notice_duration_ms: row.get(5)?,
        notice_schedule_id: row.get::<_, Option<String>>(6)?.map(ScheduleId),
        pending_notice: row.get::<_, i64>(7)? != 0,
        telemetry,
        last_seen_ms: row.get(9)?,
        scheduled_notices: Vec::new(),
        stopwatches: Vec::new(),
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        stopwatch_id: row.get::<_, Option<String>>(12)?.map(ScheduleId),
    })
}

fn row_to_scheduled_notice(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledNotice> {
    Ok(ScheduledNotice {
        schedule_id: ScheduleId(row.get(0)?),
        notice: row.get(1)?,
        start_ms: row.get(2)?,
        duration_ms: row.get(3)?,
    })
}

fn row_to_stopwatch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Stopwatch> {
    Ok(Stopwatch {
        schedule_id: ScheduleId(row.get(0)?),
        start_ms: row.get(1)?,
        end_ms: row.get(2)?,
        count_direction: parse_column(row, 3)?,
        executed: row.get::<_, i64>(4)? != 0,
    })
}

fn ensure_exists(conn: &Connection, id: &DeviceId) -> Result<()> {
    let found = conn
        .query_row("SELECT 1 FROM devices WHERE id = ?1", [id.as_str()], |_| {
            Ok(())
        })
        .optional()?;
    found.ok_or_else(|| DeviceStoreError::NotFound { id: id.clone() })
}

fn fetch_device(conn: &Connection, id: &DeviceId) -> Result<Device> {
    let mut device = conn
        .query_row(
            &format!("{DEVICE_SELECT_SQL} WHERE id = ?1"),
            [id.as_str()],
            row_to_device,
        )
        .optional()?
        .ok_or_else(|| DeviceStoreError::NotFound { id: id.clone() })?;
    load_children(conn, &mut device)?;
    Ok(device)
}

fn load_children(conn: &Connection, device: &mut Device) -> rusqlite::Result<()> {
    device.scheduled_notices = fetch_scheduled_notices(conn, &device.id)?;
    device.stopwatches = fetch_stopwatches(conn, &device.id)?;
    Ok(())
}

fn fetch_scheduled_notices(
    conn: &Connection,
    id: &DeviceId,
) -> rusqlite::Result<Vec<ScheduledNotice>> {
    let mut stmt = conn.prepare_cached(
        "SELECT schedule_id, notice, start_ms, duration_ms
         FROM scheduled_notices WHERE device_id = ?1
         ORDER BY start_ms, schedule_id",
    )?;
    let rows = stmt.query_map([id.as_str()], row_to_scheduled_notice)?;
    rows.collect()
}

fn fetch_stopwatches(conn: &Connection, id: &DeviceId) -> rusqlite::Result<Vec<Stopwatch>> {
    let mut stmt = conn.prepare_cached(
        "SELECT schedule_id, start_ms, end_ms, direction, executed
         FROM stopwatches WHERE device_id = ?1
         ORDER BY start_ms, schedule_id",
    )?;
    let rows = stmt.query_map([id.as_str()], row_to_stopwatch)?;
    rows.collect()
}
