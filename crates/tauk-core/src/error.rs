//! Error types surfaced to callers of the reporting SDK.

use crate::exec_lock::LockError;
use std::path::PathBuf;
use std::time::Duration;
use tauk_proto::{ApiError, TestStatus};
use thiserror::Error;

/// Errors that reach the caller.
///
/// Capture failures and per-test upload failures never show up here; they
/// are logged and swallowed so that reporting cannot change a test's outcome.
#[derive(Debug, Error)]
pub enum TaukError {
    /// Required configuration is missing.
    #[error("configuration error: {0}")]
    Config(String),

    /// A configuration value has the wrong shape.
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("timed out after {timeout:?} waiting for execution lock {}", path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("no free port for the companion in {start}..{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("companion failed to launch: {0}")]
    CompanionLaunch(String),

    #[error("companion request failed: {0}")]
    Companion(String),

    #[error("reporting service error: {0}")]
    Api(#[from] ApiError),

    /// Two integrations tried to record the same test.
    #[error("test case '{method_name}' is already registered in suite '{filename}'")]
    DuplicateTestCase { filename: String, method_name: String },

    #[error("no active test case '{name}' in suite '{filename}'")]
    TestCaseNotFound { filename: String, name: String },

    /// Raised when a driver or attachment is registered outside an observed test.
    #[error("no active test in scope")]
    NoActiveTest,

    #[error("attachment not found: {}", .0.display())]
    AttachmentNotFound(PathBuf),

    #[error("{what} exceeds the limit of {limit} (got {actual})")]
    SizeExceeded {
        what: &'static str,
        limit: u64,
        actual: u64,
    },

    #[error("cannot change status from {from} to {to}")]
    InvalidStatusTransition { from: TestStatus, to: TestStatus },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, TaukError>;
