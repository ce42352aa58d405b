use clockfleet_core::{Connectivity, CountDirection, DeviceMode, LinkRef};
use serde::{Deserialize, Serialize};

/// Logical channel a command travels on. Each maps to its own topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkChannel {
    Mode,
    Notice,
    Stopwatch,
}

impl LinkChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkChannel::Mode => "mode",
            LinkChannel::Notice => "notice",
            LinkChannel::Stopwatch => "stopwatch",
        }
    }
}

impl std::fmt::Display for LinkChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message for one device. Serialised as JSON with a `type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DeviceCommand {
    /// Switch the display face.
    Mode { mode: DeviceMode },
    /// Show `text`; the device falls back to its clock face after
    /// `duration_ms` if given.
    Notice {
        text: String,
        duration_ms: Option<i64>,
    },
    /// Run a stopwatch between two instants.
    Stopwatch {
        start_ms: i64,
        end_ms: i64,
        direction: CountDirection,
    },
    StopwatchStop,
}

impl DeviceCommand {
    pub fn channel(&self) -> LinkChannel {
        match self {
            DeviceCommand::Mode { .. } => LinkChannel::Mode,
            DeviceCommand::Notice { .. } => LinkChannel::Notice,
            DeviceCommand::Stopwatch { .. } | DeviceCommand::StopwatchStop => {
                LinkChannel::Stopwatch
            }
        }
    }
}

/// Inbound connectivity/telemetry report, addressed by link ref.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub link_ref: LinkRef,
    pub status: Connectivity,
    /// Every field of the report except `status`. Always a JSON object.
    pub telemetry: serde_json::Value,
}

impl DeviceReport {
    /// Fold a newer report for the same device into this one: the newer
    /// status wins and telemetry fields are merged key by key.
    pub fn absorb(&mut self, newer: DeviceReport) {
        self.status = newer.status;
        match newer.telemetry {
            serde_json::Value::Object(fields) if self.telemetry.is_object() => {
                if let Some(held) = self.telemetry.as_object_mut() {
                    held.extend(fields);
                }
            }
            other => self.telemetry = other,
        }
    }
}
