//! Error types for the CLI

use std::path::PathBuf;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Bootstrap(#[from] ksctl_bootstrap::Error),

    #[error(transparent)]
    State(#[from] ksctl_common::Error),

    #[error(transparent)]
    Telemetry(#[from] ksctl_common::telemetry::TelemetryError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot read inventory {path}: {message}")]
    Inventory { path: PathBuf, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }
}
