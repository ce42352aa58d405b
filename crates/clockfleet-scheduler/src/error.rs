use clockfleet_core::TriggerId;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The trigger action could not be encoded or decoded.
    #[error("Invalid trigger {id}: {reason}")]
    InvalidTrigger { id: TriggerId, reason: String },

    /// No trigger with the given ID exists in the store.
    #[error("Trigger not found: {id}")]
    TriggerNotFound { id: TriggerId },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
