//! `clockfleet-scheduler` — durable, time-triggered actions for the clock
//! fleet.
//!
//! # Overview
//!
//! Triggers are persisted to a SQLite `triggers` table before they are
//! acknowledged, so a restart loses none of them. The
//! [`engine::SchedulerEngine`] sleeps until the earliest pending deadline
//! and hands each due trigger to a [`engine::TriggerHandler`].
//!
//! # Lifecycle
//!
//! | Status      | Meaning                                              |
//! |-------------|------------------------------------------------------|
//! | `pending`   | Waiting for `fires_at_ms`                            |
//! | `fired`     | Claimed by the engine, callback in progress          |
//! | `executed`  | Callback completed                                   |
//! | `failed`    | Callback errored or the record was undecodable       |
//! | `cancelled` | Cancelled before it fired                            |
//!
//! A trigger leaves `pending` exactly once. Overdue triggers found at startup
//! fire on the first pass instead of being dropped.

pub mod db;
pub mod engine;
pub mod error;
pub mod store;
pub mod types;

pub use engine::{HandlerError, SchedulerEngine, SchedulerHandle, TriggerHandler};
pub use error::{Result, SchedulerError};
pub use store::ScheduleStore;
pub use types::{CancelOutcome, RecoveryReport, Trigger, TriggerAction, TriggerKind, TriggerStatus};
