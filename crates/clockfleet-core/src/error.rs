use thiserror::Error;

/// Process-level errors (bootstrap, configuration, I/O).
///
/// Subsystem crates define their own error enums; this one covers what the
/// gateway binary needs before any subsystem exists.
#[derive(Debug, Error)]
pub enum ClockfleetError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClockfleetError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            ClockfleetError::Config(_) => "CONFIG_ERROR",
            ClockfleetError::Database(_) => "DATABASE_ERROR",
            ClockfleetError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ClockfleetError>;
