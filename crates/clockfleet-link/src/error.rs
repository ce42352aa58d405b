use thiserror::Error;

/// Errors raised by a device link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The transport refused or could not queue the message.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// A command could not be serialised.
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// An inbound status message was not understood.
    #[error("Invalid report on {topic}: {reason}")]
    InvalidReport { topic: String, reason: String },
}

pub type Result<T> = std::result::Result<T, LinkError>;
