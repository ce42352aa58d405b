use std::sync::{Mutex, MutexGuard, PoisonError};

use clockfleet_core::clock::rfc3339_now;
use clockfleet_core::{DeviceId, ScheduleId, TriggerId};
use rusqlite::{Connection, OptionalExtension};
use tracing::{error, instrument};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::types::{CancelOutcome, Trigger, TriggerAction, TriggerStatus};

const TRIGGER_SELECT_SQL: &str = "SELECT id, device_id, action, fires_at_ms, status, last_error,
        created_at, updated_at
 FROM triggers";

/// A trigger row as stored, before its action JSON is decoded.
///
/// Decoding is deferred so one corrupt record can be marked failed without
/// aborting a listing that contains it.
#[derive(Debug, Clone)]
pub struct StoredTrigger {
    pub id: TriggerId,
    pub device_id: DeviceId,
    pub action_json: String,
    pub fires_at_ms: i64,
    pub status: String,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl StoredTrigger {
    pub fn decode(self) -> Result<Trigger> {
        let action: TriggerAction =
            serde_json::from_str(&self.action_json).map_err(|e| SchedulerError::InvalidTrigger {
                id: self.id.clone(),
                reason: e.to_string(),
            })?;
        let status = self
            .status
            .parse::<TriggerStatus>()
            .map_err(|reason| SchedulerError::InvalidTrigger {
                id: self.id.clone(),
                reason,
            })?;
        Ok(Trigger {
            id: self.id,
            device_id: self.device_id,
            action,
            fires_at_ms: self.fires_at_ms,
            status,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Durable persistence for triggers, independent of process lifetime.
///
/// Every state transition is a conditional UPDATE on `status`, so a trigger
/// can leave `Pending` exactly once: either the engine claims it or a cancel
/// wins, never both.
pub struct ScheduleStore {
    db: Mutex<Connection>,
}

impl ScheduleStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist a new pending trigger.
    #[instrument(skip(self, device_id, action), fields(device_id = %device_id, kind = %action.kind()))]
    pub fn insert(
        &self,
        device_id: &DeviceId,
        action: TriggerAction,
        fires_at_ms: i64,
    ) -> Result<Trigger> {
        let id = TriggerId::new();
        let now = rfc3339_now();
        let action_json =
            serde_json::to_string(&action).map_err(|e| SchedulerError::InvalidTrigger {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        let db = self.conn();
        db.execute(
            "INSERT INTO triggers
             (id, device_id, schedule_id, kind, action, fires_at_ms, status,
              last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', NULL, ?7, ?7)",
            rusqlite::params![
                id.as_str(),
                device_id.as_str(),
                action.schedule_id().as_str(),
                action.kind().as_str(),
                action_json,
                fires_at_ms,
                now
            ],
        )?;

        Ok(Trigger {
            id,
            device_id: device_id.clone(),
            action,
            fires_at_ms,
            status: TriggerStatus::Pending,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get(&self, id: &TriggerId) -> Result<Option<Trigger>> {
        let db = self.conn();
        let row = db
            .query_row(
                &format!("{TRIGGER_SELECT_SQL} WHERE id = ?1"),
                [id.as_str()],
                row_to_stored,
            )
            .optional()?;
        row.map(StoredTrigger::decode).transpose()
    }

    /// Pending rows with `fires_at_ms <= now_ms`, oldest first.
    pub fn due(&self, now_ms: i64) -> Result<Vec<StoredTrigger>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(&format!(
            "{TRIGGER_SELECT_SQL}
             WHERE status = 'pending' AND fires_at_ms <= ?1
             ORDER BY fires_at_ms, id"
        ))?;
        let rows = stmt
            .query_map([now_ms], row_to_stored)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Every pending row, oldest first.
    pub fn pending_rows(&self) -> Result<Vec<StoredTrigger>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(&format!(
            "{TRIGGER_SELECT_SQL} WHERE status = 'pending' ORDER BY fires_at_ms, id"
        ))?;
        let rows = stmt
            .query_map([], row_to_stored)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn pending_count(&self) -> Result<usize> {
        let db = self.conn();
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM triggers WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Earliest `fires_at_ms` among pending triggers.
    pub fn next_due_ms(&self) -> Result<Option<i64>> {
        let db = self.conn();
        let next: Option<i64> = db.query_row(
            "SELECT MIN(fires_at_ms) FROM triggers WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(next)
    }

    /// Pending → Fired. Returns false when the trigger is no longer pending
    /// (cancelled, or claimed already).
    pub fn claim(&self, id: &TriggerId) -> Result<bool> {
        let db = self.conn();
        let n = db.execute(
            "UPDATE triggers SET status = 'fired', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            rusqlite::params![id.as_str(), rfc3339_now()],
        )?;
        Ok(n == 1)
    }

    /// Fired → Executed | Failed.
    pub fn finish(&self, id: &TriggerId, outcome: std::result::Result<(), String>) -> Result<()> {
        let (status, last_error) = match outcome {
            Ok(()) => (TriggerStatus::Executed, None),
            Err(e) => (TriggerStatus::Failed, Some(e)),
        };
        let db = self.conn();
        db.execute(
            "UPDATE triggers SET status = ?2, last_error = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'fired'",
            rusqlite::params![id.as_str(), status.as_str(), last_error, rfc3339_now()],
        )?;
        Ok(())
    }

    /// Mark a record that cannot be decoded as failed so it stops being due.
    pub fn mark_failed(&self, id: &TriggerId, reason: &str) -> Result<()> {
        let db = self.conn();
        db.execute(
            "UPDATE triggers SET status = 'failed', last_error = ?2, updated_at = ?3
             WHERE id = ?1 AND status IN ('pending', 'fired')",
            rusqlite::params![id.as_str(), reason, rfc3339_now()],
        )?;
        Ok(())
    }

    /// Pending → Cancelled. Cancelling a trigger that already left `Pending`
    /// is a no-op reported as [`CancelOutcome::AlreadyFinal`].
    #[instrument(skip(self, id), fields(trigger_id = %id))]
    pub fn cancel(&self, id: &TriggerId) -> Result<CancelOutcome> {
        let db = self.conn();
        let n = db.execute(
            "UPDATE triggers SET status = 'cancelled', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            rusqlite::params![id.as_str(), rfc3339_now()],
        )?;
        if n == 1 {
            return Ok(CancelOutcome::Cancelled);
        }
        let status: Option<String> = db
            .query_row(
                "SELECT status FROM triggers WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            None => Err(SchedulerError::TriggerNotFound { id: id.clone() }),
            Some(s) => {
                let status = s
                    .parse::<TriggerStatus>()
                    .map_err(|reason| SchedulerError::InvalidTrigger {
                        id: id.clone(),
                        reason,
                    })?;
                Ok(CancelOutcome::AlreadyFinal(status))
            }
        }
    }

    /// Cancel every still-pending trigger of one schedule.
    #[instrument(skip(self, schedule_id), fields(schedule_id = %schedule_id))]
    pub fn cancel_schedule(&self, schedule_id: &ScheduleId) -> Result<Vec<TriggerId>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "UPDATE triggers SET status = 'cancelled', updated_at = ?2
             WHERE schedule_id = ?1 AND status = 'pending'
             RETURNING id",
        )?;
        let ids = stmt
            .query_map(
                rusqlite::params![schedule_id.as_str(), rfc3339_now()],
                |row| row.get::<_, String>(0).map(TriggerId),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Fired → Pending for triggers whose callback never finished because
    /// the process stopped. Returns how many were reset.
    pub fn reset_interrupted(&self) -> Result<usize> {
        let db = self.conn();
        let n = db.execute(
            "UPDATE triggers SET status = 'pending', updated_at = ?1 WHERE status = 'fired'",
            [rfc3339_now()],
        )?;
        if n > 0 {
            error!(count = n, "triggers were interrupted mid-callback; re-queued");
        }
        Ok(n)
    }
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredTrigger> {
    Ok(StoredTrigger {
        id: TriggerId(row.get(0)?),
        device_id: DeviceId(row.get(1)?),
        action_json: row.get(2)?,
        fires_at_ms: row.get(3)?,
        status: row.get(4)?,
        last_error: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ScheduleStore {
        ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn end(schedule: &str) -> TriggerAction {
        TriggerAction::NoticeEnd {
            schedule_id: ScheduleId::from(schedule),
        }
    }

    #[test]
    fn claim_succeeds_once() {
        let store = store();
        let t = store.insert(&DeviceId::from("d1"), end("s"), 100).unwrap();
        assert!(store.claim(&t.id).unwrap());
        assert!(!store.claim(&t.id).unwrap());
        store.finish(&t.id, Ok(())).unwrap();
        let t = store.get(&t.id).unwrap().unwrap();
        assert_eq!(t.status, TriggerStatus::Executed);
    }

    #[test]
    fn cancel_before_claim_blocks_firing() {
        let store = store();
        let t = store.insert(&DeviceId::from("d1"), end("s"), 100).unwrap();
        assert_eq!(store.cancel(&t.id).unwrap(), CancelOutcome::Cancelled);
        assert!(!store.claim(&t.id).unwrap());
        assert!(store.due(1_000).unwrap().is_empty());
    }

    #[test]
    fn cancel_after_claim_is_noop() {
        let store = store();
        let t = store.insert(&DeviceId::from("d1"), end("s"), 100).unwrap();
        assert!(store.claim(&t.id).unwrap());
        assert_eq!(
            store.cancel(&t.id).unwrap(),
            CancelOutcome::AlreadyFinal(TriggerStatus::Fired)
        );
    }

    #[test]
    fn cancel_unknown_is_not_found() {
        let store = store();
        let err = store.cancel(&TriggerId::from("nope".to_string())).unwrap_err();
        assert!(matches!(err, SchedulerError::TriggerNotFound { .. }));
    }

    #[test]
    fn due_is_ordered_and_bounded_by_now() {
        let store = store();
        let d = DeviceId::from("d1");
        store.insert(&d, end("late"), 300).unwrap();
        store.insert(&d, end("early"), 100).unwrap();
        store.insert(&d, end("future"), 10_000).unwrap();

        let due: Vec<_> = store
            .due(500)
            .unwrap()
            .into_iter()
            .map(|r| r.decode().unwrap().schedule_id().as_str().to_string())
            .collect();
        assert_eq!(due, vec!["early", "late"]);
        assert_eq!(store.next_due_ms().unwrap(), Some(100));
        assert_eq!(store.pending_count().unwrap(), 3);
    }

    #[test]
    fn cancel_schedule_hits_only_pending_of_that_schedule() {
        let store = store();
        let d = DeviceId::from("d1");
        let sid = ScheduleId::from("pair");
        let start = store
            .insert(
                &d,
                TriggerAction::NoticeStart {
                    schedule_id: sid.clone(),
                    notice: "hi".into(),
                    end_ms: 200,
                },
                100,
            )
            .unwrap();
        store
            .insert(&d, TriggerAction::NoticeEnd { schedule_id: sid.clone() }, 200)
            .unwrap();
        store.insert(&d, end("other"), 150).unwrap();

        assert!(store.claim(&start.id).unwrap());
        let cancelled = store.cancel_schedule(&sid).unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    #[test]
    fn reset_interrupted_requeues_fired() {
        let store = store();
        let t = store.insert(&DeviceId::from("d1"), end("s"), 100).unwrap();
        assert!(store.claim(&t.id).unwrap());
        assert_eq!(store.reset_interrupted().unwrap(), 1);
        assert_eq!(store.get(&t.id).unwrap().unwrap().status, TriggerStatus::Pending);
    }

    #[test]
    fn failed_outcome_keeps_error_text() {
        let store = store();
        let t = store.insert(&DeviceId::from("d1"), end("s"), 100).unwrap();
        store.claim(&t.id).unwrap();
        store.finish(&t.id, Err("device vanished".into())).unwrap();
        let t = store.get(&t.id).unwrap().unwrap();
        assert_eq!(t.status, TriggerStatus::Failed);
        assert_eq!(t.last_error.as_deref(), Some("device vanished"));
    }
}
