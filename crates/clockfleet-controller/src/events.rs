use clockfleet_core::{Connectivity, DeviceId, DeviceMode};
use clockfleet_devices::Device;
use serde::Serialize;

/// Topic every status change is broadcast on.
pub const FLEET_STATUS_TOPIC: &str = "device:status";

/// Per-device status topic, `device:{id}:status`.
pub fn device_status_topic(id: &DeviceId) -> String {
    format!("device:{id}:status")
}

/// Fire-and-forget sink for status broadcasts. No acknowledgment is
/// expected and `emit` must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, topic: &str, payload: serde_json::Value);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub device_id: DeviceId,
    pub connectivity: Connectivity,
    pub mode: DeviceMode,
    pub pending_notice: bool,
    pub last_seen_ms: Option<i64>,
}

impl From<&Device> for StatusEvent {
    fn from(device: &Device) -> Self {
        Self {
            device_id: device.id.clone(),
            connectivity: device.connectivity,
            mode: device.mode,
            pending_notice: device.pending_notice,
            last_seen_ms: device.last_seen_ms,
        }
    }
}
