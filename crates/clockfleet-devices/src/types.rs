use clockfleet_core::{Connectivity, CountDirection, DeviceId, DeviceMode, LinkRef, ScheduleId};
use serde::{Deserialize, Serialize};

/// One clock in the fleet, with both array fields loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub link_ref: LinkRef,
    pub connectivity: Connectivity,
    pub mode: DeviceMode,
    /// Text shown (or to be shown, when `pending_notice`) in notice mode.
    pub current_notice: Option<String>,
    pub notice_duration_ms: Option<i64>,
    /// Schedule the current or pending notice belongs to. End-triggers only
    /// deactivate the notice they were registered for.
    pub notice_schedule_id: Option<ScheduleId>,
    /// A notice was accepted while the device was offline and awaits replay.
    pub pending_notice: bool,
    /// Last telemetry object reported by the device, merged field by field.
    pub telemetry: serde_json::Value,
    pub last_seen_ms: Option<i64>,
    pub scheduled_notices: Vec<ScheduledNotice>,
    pub stopwatches: Vec<Stopwatch>,
    pub created_at: String,
    pub updated_at: String,
    /// Stopwatch on screen while `mode` is `stopwatch`. Cleared whenever the
    /// device leaves stopwatch mode.
    pub stopwatch_id: Option<ScheduleId>,
}

impl Device {
    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn scheduled_notice(&self, schedule_id: &ScheduleId) -> Option<&ScheduledNotice> {
        self.scheduled_notices
            .iter()
            .find(|n| &n.schedule_id == schedule_id)
    }

    pub fn stopwatch(&self, schedule_id: &ScheduleId) -> Option<&Stopwatch> {
        self.stopwatches.iter().find(|s| &s.schedule_id == schedule_id)
    }

    /// True when `schedule_id` is the stopwatch the device is showing.
    pub fn is_running_stopwatch(&self, schedule_id: &ScheduleId) -> bool {
        self.mode == DeviceMode::Stopwatch && self.stopwatch_id.as_ref() == Some(schedule_id)
    }

    /// True when the displayed (not pending) notice belongs to `schedule_id`.
    pub fn is_showing(&self, schedule_id: &ScheduleId) -> bool {
        self.mode == DeviceMode::Notice
            && !self.pending_notice
            && self.notice_schedule_id.as_ref() == Some(schedule_id)
    }
}

/// A future-dated notice occupying `[start_ms, start_ms + duration_ms)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledNotice {
    pub schedule_id: ScheduleId,
    pub notice: String,
    pub start_ms: i64,
    pub duration_ms: i64,
}

impl ScheduledNotice {
    pub fn end_ms(&self) -> i64 {
        self.start_ms + self.duration_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stopwatch {
    pub schedule_id: ScheduleId,
    pub start_ms: i64,
    pub end_ms: i64,
    pub count_direction: CountDirection,
    /// The stopwatch payload has been published to the device.
    pub executed: bool,
}

/// Mode-related fields written together by [`DeviceStore::apply_mode_change`].
///
/// [`DeviceStore::apply_mode_change`]: crate::store::DeviceStore::apply_mode_change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeChange {
    /// Back to the ordinary clock face. The notice text is kept so a later
    /// `set_mode(notice)` can show it again, but it no longer belongs to a
    /// schedule.
    Clock,
    /// Show `text` now; clears any pending notice.
    Notice {
        text: String,
        duration_ms: Option<i64>,
        schedule_id: Option<ScheduleId>,
    },
    /// Buffer `text` for replay on reconnect; the visible mode is unchanged.
    PendingNotice {
        text: String,
        duration_ms: Option<i64>,
        schedule_id: Option<ScheduleId>,
    },
    /// Forget a buffered notice whose window has closed.
    DropPendingNotice,
    /// Show the stopwatch `schedule_id`, replacing whatever was on screen.
    Stopwatch { schedule_id: ScheduleId },
}

/// Outcome of an inbound connectivity report.
#[derive(Debug, Clone)]
pub struct LinkUpsert {
    pub device: Device,
    /// Connectivity before this report; `None` when the device was created
    /// by it (first contact).
    pub previous: Option<Connectivity>,
}

impl LinkUpsert {
    /// The report moved the device from offline (or unknown) to online.
    pub fn came_online(&self) -> bool {
        self.device.connectivity.is_online()
            && !self.previous.is_some_and(|c| c.is_online())
    }

    pub fn changed(&self) -> bool {
        self.previous != Some(self.device.connectivity)
    }
}
