//! MQTT topic layout: `{prefix}/{linkRef}/{channel}` outbound and
//! `{prefix}/{linkRef}/status` inbound.

use clockfleet_core::{Connectivity, LinkRef};
use serde_json::{Map, Value};

use crate::{
    error::{LinkError, Result},
    types::{DeviceReport, LinkChannel},
};

const STATUS_SUFFIX: &str = "status";

#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn command(&self, link_ref: &LinkRef, channel: LinkChannel) -> String {
        format!("{}/{}/{}", self.prefix, link_ref, channel)
    }

    /// Wildcard subscription covering every device's status topic.
    pub fn status_filter(&self) -> String {
        format!("{}/+/{STATUS_SUFFIX}", self.prefix)
    }

    /// Link ref encoded in a status topic, or `None` for any other topic.
    pub fn status_link_ref(&self, topic: &str) -> Option<LinkRef> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let link_ref = rest.strip_suffix(STATUS_SUFFIX)?.strip_suffix('/')?;
        if link_ref.is_empty() || link_ref.contains('/') {
            return None;
        }
        Some(LinkRef::from(link_ref))
    }

    /// Decode an inbound status message.
    ///
    /// The payload is a JSON object with a `status` field; the remaining
    /// fields are telemetry. A bare `online` / `offline` string (as sent by a
    /// broker last-will) is accepted too, with empty telemetry.
    pub fn parse_report(&self, topic: &str, payload: &[u8]) -> Result<DeviceReport> {
        let invalid = |reason: String| LinkError::InvalidReport {
            topic: topic.to_string(),
            reason,
        };
        let link_ref = self
            .status_link_ref(topic)
            .ok_or_else(|| invalid("not a status topic".into()))?;

        let text = std::str::from_utf8(payload).map_err(|e| invalid(e.to_string()))?;
        let (status, telemetry) = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(mut fields)) => {
                let status = fields
                    .remove("status")
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .ok_or_else(|| invalid("missing status field".into()))?;
                (status, Value::Object(fields))
            }
            Ok(Value::String(s)) => (s, Value::Object(Map::new())),
            Ok(_) => return Err(invalid("expected a JSON object".into())),
            Err(_) => (text.trim().to_string(), Value::Object(Map::new())),
        };
        let status = status.parse::<Connectivity>().map_err(invalid)?;

        Ok(DeviceReport {
            link_ref,
            status,
            telemetry,
        })
    }
}
