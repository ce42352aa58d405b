use clockfleet_core::{DeviceId, ScheduleId};
use clockfleet_devices::DeviceStoreError;
use clockfleet_link::LinkError;
use clockfleet_scheduler::SchedulerError;
use thiserror::Error;

/// Errors returned by [`DeviceController`](crate::DeviceController)
/// operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Device not found: {id}")]
    DeviceNotFound { id: DeviceId },

    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: ScheduleId },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested interval intersects an already accepted one.
    #[error("Scheduled notice overlaps schedule {conflicting}")]
    Overlap { conflicting: ScheduleId },

    /// The device link refused the message. Any state change made before
    /// the publish is kept.
    #[error("Delivery failed: {0}")]
    DeliveryFailure(#[from] LinkError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Short error code string for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ControllerError::DeviceNotFound { .. } | ControllerError::ScheduleNotFound { .. } => {
                "NOT_FOUND"
            }
            ControllerError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ControllerError::Overlap { .. } => "OVERLAP",
            ControllerError::DeliveryFailure(_) => "DELIVERY_FAILURE",
            ControllerError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<DeviceStoreError> for ControllerError {
    fn from(e: DeviceStoreError) -> Self {
        match e {
            DeviceStoreError::NotFound { id } => ControllerError::DeviceNotFound { id },
            DeviceStoreError::Overlap { conflicting } => ControllerError::Overlap { conflicting },
            DeviceStoreError::Database(e) => ControllerError::Internal(e.to_string()),
        }
    }
}

impl From<SchedulerError> for ControllerError {
    fn from(e: SchedulerError) -> Self {
        ControllerError::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
