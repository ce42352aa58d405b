//! `clockfleet-link` — the device link: outbound commands, inbound status
//! reports, and their MQTT transport.

pub mod backlog;
pub mod error;
pub mod link;
pub mod mqtt;
pub mod topics;
pub mod types;

pub use backlog::ReportBacklog;
pub use error::{LinkError, Result};
pub use link::DeviceLink;
pub use mqtt::{spawn_link_loop, MqttLink};
pub use topics::Topics;
pub use types::{DeviceCommand, DeviceReport, LinkChannel};
