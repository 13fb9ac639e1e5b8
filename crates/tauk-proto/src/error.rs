//! Error types shared by the collaborator traits.

use thiserror::Error;

/// Errors raised by an [`AutomationDriver`](crate::AutomationDriver) adapter.
///
/// Capture code never propagates these; they are logged and the artifact
/// is left unset.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("driver session is no longer available")]
    SessionClosed,

    #[error("driver does not support '{0}'")]
    Unsupported(&'static str),
}

impl DriverError {
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by a [`ReportingApi`](crate::ReportingApi) implementation.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Transport(String),

    #[error("{operation} failed with status {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("Missing field in response: {0}")]
    MissingField(String),

    #[error("invalid test id '{0}'")]
    InvalidTestId(String),

    #[error("run has not been initialized")]
    NotInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for reporting API operations.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
