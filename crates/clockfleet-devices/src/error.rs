use clockfleet_core::{DeviceId, ScheduleId};
use thiserror::Error;

/// Errors raised by the device state store.
#[derive(Debug, Error)]
pub enum DeviceStoreError {
    /// No device row with the given id.
    #[error("device not found: {id}")]
    NotFound { id: DeviceId },

    /// The proposed scheduled notice intersects an accepted one.
    #[error("scheduled notice overlaps existing schedule {conflicting}")]
    Overlap { conflicting: ScheduleId },

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, DeviceStoreError>;
