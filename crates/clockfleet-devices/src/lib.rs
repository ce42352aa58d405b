//! `clockfleet-devices` — the durable device state store.
//!
//! Each device row carries connectivity, mode and the current or pending
//! notice. The two array fields (scheduled notices and stopwatches) live in
//! child tables and are mutated one element at a time. [`overlap`] holds the
//! half-open interval rule used to admit scheduled notices.

pub mod db;
pub mod error;
pub mod overlap;
pub mod store;
pub mod types;

pub use error::{DeviceStoreError, Result};
pub use store::DeviceStore;
pub use types::{Device, LinkUpsert, ModeChange, ScheduledNotice, Stopwatch};
