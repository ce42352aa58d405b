//! `clockfleet-controller` — the device mode state machine.
//!
//! [`DeviceController`] turns commands (set mode, send or schedule a notice,
//! start or stop a stopwatch) and device reports into state changes,
//! device-link publishes and scheduler triggers. It is also the
//! [`TriggerHandler`](clockfleet_scheduler::TriggerHandler) the scheduler
//! calls back when a trigger fires.

pub mod controller;
pub mod error;
pub mod events;
pub mod router;

pub use controller::{DeviceController, ScheduleRef};
pub use error::{ControllerError, Result};
pub use events::{device_status_topic, EventSink, StatusEvent, FLEET_STATUS_TOPIC};
pub use router::spawn_report_router;
