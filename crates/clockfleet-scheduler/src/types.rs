use clockfleet_core::{CountDirection, DeviceId, ScheduleId, TriggerId};
use serde::{Deserialize, Serialize};

/// What a trigger does when it fires, with the payload that action needs.
///
/// Stored as JSON in the `triggers.action` column; the `kind` tag is also
/// copied to its own column for listing and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerAction {
    /// Show a scheduled notice. `end_ms` closes its window.
    NoticeStart {
        schedule_id: ScheduleId,
        notice: String,
        end_ms: i64,
    },
    /// Take down the notice belonging to `schedule_id`.
    NoticeEnd { schedule_id: ScheduleId },
    /// Publish a scheduled stopwatch.
    StopwatchStart {
        schedule_id: ScheduleId,
        start_ms: i64,
        end_ms: i64,
        direction: CountDirection,
    },
    /// Return the device to clock mode once the stopwatch is over.
    StopwatchEnd { schedule_id: ScheduleId },
}

impl TriggerAction {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerAction::NoticeStart { .. } => TriggerKind::NoticeStart,
            TriggerAction::NoticeEnd { .. } => TriggerKind::NoticeEnd,
            TriggerAction::StopwatchStart { .. } => TriggerKind::StopwatchStart,
            TriggerAction::StopwatchEnd { .. } => TriggerKind::StopwatchEnd,
        }
    }

    pub fn schedule_id(&self) -> &ScheduleId {
        match self {
            TriggerAction::NoticeStart { schedule_id, .. }
            | TriggerAction::NoticeEnd { schedule_id }
            | TriggerAction::StopwatchStart { schedule_id, .. }
            | TriggerAction::StopwatchEnd { schedule_id } => schedule_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    NoticeStart,
    NoticeEnd,
    StopwatchStart,
    StopwatchEnd,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::NoticeStart => "notice_start",
            TriggerKind::NoticeEnd => "notice_end",
            TriggerKind::StopwatchStart => "stopwatch_start",
            TriggerKind::StopwatchEnd => "stopwatch_end",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a trigger.
///
/// `Pending → Fired → (Executed | Failed)`, or `Pending → Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// Waiting for `fires_at_ms`.
    Pending,
    /// Claimed by the engine; the callback is running.
    Fired,
    /// Callback completed.
    Executed,
    /// Callback returned an error or the record could not be decoded.
    Failed,
    /// Cancelled before it fired.
    Cancelled,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerStatus::Pending => "pending",
            TriggerStatus::Fired => "fired",
            TriggerStatus::Executed => "executed",
            TriggerStatus::Failed => "failed",
            TriggerStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TriggerStatus::Pending),
            "fired" => Ok(TriggerStatus::Fired),
            "executed" => Ok(TriggerStatus::Executed),
            "failed" => Ok(TriggerStatus::Failed),
            "cancelled" => Ok(TriggerStatus::Cancelled),
            other => Err(format!("unknown trigger status: {other}")),
        }
    }
}

/// A persisted trigger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    /// UUIDv7 primary key.
    pub id: TriggerId,
    pub device_id: DeviceId,
    pub action: TriggerAction,
    /// Unix epoch milliseconds at or after which the trigger fires.
    pub fires_at_ms: i64,
    pub status: TriggerStatus,
    /// Error text from the last failed callback, if any.
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        self.action.kind()
    }

    pub fn schedule_id(&self) -> &ScheduleId {
        self.action.schedule_id()
    }
}

/// Result of cancelling a single trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The trigger was pending and will never fire.
    Cancelled,
    /// Too late: the trigger already left `Pending`. Nothing changed.
    AlreadyFinal(TriggerStatus),
}

/// Summary of the startup pass over persisted triggers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Pending triggers whose time is still ahead.
    pub rearmed: usize,
    /// Pending triggers whose time passed while the process was down; they
    /// fire on the engine's first pass.
    pub overdue: usize,
    /// Triggers left `Fired` by a crash mid-callback, put back to `Pending`.
    pub interrupted: usize,
    /// Records whose action could not be decoded; marked `Failed`.
    pub undecodable: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_json_carries_kind_tag() {
        let action = TriggerAction::NoticeEnd {
            schedule_id: ScheduleId::from("s-1"),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "notice_end");
        assert_eq!(json["schedule_id"], "s-1");
        assert_eq!(action.kind().as_str(), "notice_end");
    }

    #[test]
    fn stopwatch_action_decodes() {
        let raw = r#"{"kind":"stopwatch_start","schedule_id":"s-2","start_ms":1,"end_ms":2,"direction":"down"}"#;
        let action: TriggerAction = serde_json::from_str(raw).unwrap();
        assert_eq!(action.kind(), TriggerKind::StopwatchStart);
        assert_eq!(action.schedule_id().as_str(), "s-2");
    }

    #[test]
    fn status_roundtrips_through_text() {
        for status in [
            TriggerStatus::Pending,
            TriggerStatus::Fired,
            TriggerStatus::Executed,
            TriggerStatus::Failed,
            TriggerStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TriggerStatus>(), Ok(status));
        }
        assert!("missed".parse::<TriggerStatus>().is_err());
    }
}
