//! `clockfleet-core` — identifiers, enums, configuration and the clock
//! abstraction shared by every clockfleet crate.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ClockfleetError, Result};
pub use types::{
    Connectivity, CountDirection, DeviceId, DeviceMode, LinkRef, ScheduleId, TriggerId,
};
