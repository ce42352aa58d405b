use async_trait::async_trait;
use clockfleet_core::LinkRef;

use crate::{error::LinkError, types::DeviceCommand};

/// Outbound half of the device link.
///
/// `publish` requests at-least-once delivery and reports transport failure
/// as an error value. Whether that failure is fatal is the caller's call.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Stable lowercase identifier (e.g. `"mqtt"`), used in logs.
    fn name(&self) -> &str;

    async fn publish(&self, link_ref: &LinkRef, command: &DeviceCommand) -> Result<(), LinkError>;
}
