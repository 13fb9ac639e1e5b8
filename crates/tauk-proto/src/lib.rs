//! # tauk-proto
//!
//! Shared types, error definitions, and collaborator traits for the Tauk
//! reporting SDK.
//!
//! This crate provides the foundational abstractions used across all Tauk crates,
//! including:
//! - Test status, automation type, platform and attachment enums
//! - The [`AutomationDriver`] capability trait implemented by driver adapters
//! - The [`ReportingApi`] trait for the remote collection service
//! - Common error types

mod driver;
mod error;
mod reporting;
mod types;

pub use driver::{AutomationDriver, Capabilities, CapabilitiesExt, LogEntry, NATIVE_CONTEXT};
pub use error::{ApiError, ApiResult, DriverError};
pub use reporting::{ReportingApi, RunInit, RunMetadata, UploadResult};
pub use types::{AttachmentKind, AutomationType, PlatformName, TestStatus};
