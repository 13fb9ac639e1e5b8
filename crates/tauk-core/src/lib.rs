//! # tauk-core
//!
//! Test reporting for browser and mobile automation runs.
//!
//! This crate provides:
//! - The execution context: execution directory, run id negotiation between
//!   processes under a file lock, and teardown
//! - Test case records and the per-process registry of suites
//! - Best-effort capture of screenshots, views and Appium logs
//! - Attribution of failures to a line of the test's source file
//! - The companion subprocess client for browser debug-protocol capture
//! - [`ReportingClient`], the entry point for test-framework integrations
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tauk_core::{ReportingClient, TaukConfig, test_descriptor};
//!
//! # async fn example(driver: Arc<dyn tauk_core::AutomationDriver>) -> anyhow::Result<()> {
//! let client = ReportingClient::get_or_init(TaukConfig::from_env()?).await?;
//! let _guard = client.shutdown_guard();
//!
//! let outcome = client
//!     .observe(test_descriptor!("login_works"), move |_test| async move {
//!         let scope = ReportingClient::global()
//!             .ok_or_else(|| anyhow::anyhow!("client not initialized"))?
//!             .register_driver(driver, None)
//!             .await?;
//!         // drive the browser ...
//!         scope.quit().await?;
//!         Ok::<_, anyhow::Error>(())
//!     })
//!     .await?;
//! outcome?;
//! # Ok(())
//! # }
//! ```

pub mod attribution;
pub mod capture;
mod client;
pub mod companion;
pub mod config;
pub mod context;
pub mod error;
pub mod exec_lock;
pub mod execution_dir;
pub mod logging;
pub mod platform;
pub mod run_file;
pub mod test_case;
pub mod test_data;
pub mod testing;

pub use attribution::{CodeLine, ErrorDetail, ExceptionInfo, SourceListing, StackFrame};
pub use client::{ReportingClient, ShutdownGuard, TestDescriptor};
pub use companion::{Companion, CompanionConfig};
pub use config::{LogLevel, TaukConfig};
pub use context::ExecutionContext;
pub use error::{Result, TaukError};
pub use exec_lock::{EXEC_LOCK_TIMEOUT, ExecLock, LockError};
pub use execution_dir::{DirRole, ExecutionDir};
pub use run_file::{RunFileState, SharedRunFile};
pub use test_case::{Attachment, DriverScope, TestCaseRecord};
pub use test_data::{TestData, TestHandle, TestSuite};

pub use tauk_proto::{
    AttachmentKind, AutomationDriver, AutomationType, Capabilities, DriverError, LogEntry,
    PlatformName, ReportingApi, TestStatus,
};
