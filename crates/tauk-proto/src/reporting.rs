//! The remote collection service as seen by the execution context.

use crate::error::ApiResult;
use crate::types::AttachmentKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Describes the client and host when a run is initialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub language: String,
    pub tauk_client_version: String,
    /// UTC milliseconds since the epoch.
    pub start_timestamp: i64,
    pub timezone: String,
    pub dst: bool,
    pub multi_process_run: bool,
    pub host_os_name: String,
    pub host_os_version: String,
}

/// Response of a run initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInit {
    pub run_id: String,
    pub latest_client_version: Option<String>,
}

/// External test ids keyed by suite filename, then method name.
pub type UploadResult = HashMap<String, HashMap<String, String>>;

/// Operations the core needs from the remote reporting service.
#[async_trait]
pub trait ReportingApi: Send + Sync {
    /// Starts a run, or re-asserts `hint_run_id` if the service still
    /// considers it live. Returns the run id the service settled on.
    async fn initialize_run(
        &self,
        metadata: &RunMetadata,
        hint_run_id: Option<&str>,
    ) -> ApiResult<RunInit>;

    /// Uploads a `{"test_suites": [...]}` document for one test.
    async fn upload_test_result(&self, payload: &serde_json::Value) -> ApiResult<UploadResult>;

    async fn upload_attachment(
        &self,
        path: &Path,
        kind: AttachmentKind,
        external_test_id: &str,
    ) -> ApiResult<()>;

    /// Marks the run complete, shipping the error log when one is given.
    async fn finish_execution(&self, error_log: Option<&Path>) -> ApiResult<()>;

    /// Replaces the credentials, e.g. with those read from a shared run file.
    fn set_credentials(&self, api_token: &str, project_id: &str);

    /// Current `(api_token, project_id)`.
    fn credentials(&self) -> (String, String);

    /// Run id established by the last successful initialization.
    fn run_id(&self) -> Option<String>;
}
