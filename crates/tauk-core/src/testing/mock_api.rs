//! Mock reporting service that records calls and answers from a script.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tauk_proto::{
    ApiError, ApiResult, AttachmentKind, ReportingApi, RunInit, RunMetadata, UploadResult,
};

/// One `initialize_run` call.
#[derive(Debug, Clone)]
pub struct InitializeCall {
    pub metadata: RunMetadata,
    pub hint: Option<String>,
    /// Credentials in effect when the call was made.
    pub credentials: (String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAttachment {
    pub path: PathBuf,
    pub kind: AttachmentKind,
    pub test_id: String,
}

/// Reporting service double.
///
/// Run ids come from the script, then from fresh UUIDs. A hinted run id is
/// confirmed unless the mock was built with [`MockReportingApi::rejecting_hints`].
#[derive(Debug, Clone)]
pub struct MockReportingApi {
    state: Arc<Mutex<ApiState>>,
}

#[derive(Debug)]
struct ApiState {
    api_token: String,
    project_id: String,
    run_id: Option<String>,
    scripted_run_ids: VecDeque<String>,
    confirm_hints: bool,
    fail_initialize: bool,
    initialize_delay: Option<Duration>,
    fail_uploads: bool,
    next_test_id: usize,
    initializations: Vec<InitializeCall>,
    uploads: Vec<Value>,
    attachments: Vec<UploadedAttachment>,
    finishes: Vec<Option<String>>,
}

impl MockReportingApi {
    pub fn new(api_token: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ApiState {
                api_token: api_token.into(),
                project_id: project_id.into(),
                run_id: None,
                scripted_run_ids: VecDeque::new(),
                confirm_hints: true,
                fail_initialize: false,
                initialize_delay: None,
                fail_uploads: false,
                next_test_id: 1,
                initializations: Vec::new(),
                uploads: Vec::new(),
                attachments: Vec::new(),
                finishes: Vec::new(),
            })),
        }
    }

    /// Run ids handed out by fresh initializations, in order.
    pub fn with_run_ids(self, run_ids: &[&str]) -> Self {
        self.state().scripted_run_ids = run_ids.iter().map(|id| (*id).to_string()).collect();
        self
    }

    /// Treats every hinted run id as stale.
    pub fn rejecting_hints(self) -> Self {
        self.state().confirm_hints = false;
        self
    }

    pub fn failing_initialize(self) -> Self {
        self.state().fail_initialize = true;
        self
    }

    /// Makes every `initialize_run` call take at least `delay`.
    pub fn with_initialize_delay(self, delay: Duration) -> Self {
        self.state().initialize_delay = Some(delay);
        self
    }

    pub fn failing_uploads(self) -> Self {
        self.state().fail_uploads = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, ApiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn initializations(&self) -> Vec<InitializeCall> {
        self.state().initializations.clone()
    }

    pub fn uploads(&self) -> Vec<Value> {
        self.state().uploads.clone()
    }

    pub fn attachments(&self) -> Vec<UploadedAttachment> {
        self.state().attachments.clone()
    }

    /// Error log contents per `finish_execution` call; `None` for a clean finish.
    pub fn finishes(&self) -> Vec<Option<String>> {
        self.state().finishes.clone()
    }
}

fn unavailable(operation: &'static str) -> ApiError {
    ApiError::Status {
        operation,
        status: 503,
        body: "service unavailable".to_string(),
    }
}

#[async_trait]
impl ReportingApi for MockReportingApi {
    async fn initialize_run(
        &self,
        metadata: &RunMetadata,
        hint_run_id: Option<&str>,
    ) -> ApiResult<RunInit> {
        let delay = self.state().initialize_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        let credentials = (state.api_token.clone(), state.project_id.clone());
        state.initializations.push(InitializeCall {
            metadata: metadata.clone(),
            hint: hint_run_id.map(str::to_string),
            credentials,
        });
        if state.fail_initialize {
            return Err(unavailable("initialize"));
        }

        let run_id = match hint_run_id {
            Some(hint) if state.confirm_hints => hint.to_string(),
            _ => state
                .scripted_run_ids
                .pop_front()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        };
        state.run_id = Some(run_id.clone());
        Ok(RunInit {
            run_id,
            latest_client_version: None,
        })
    }

    async fn upload_test_result(&self, payload: &Value) -> ApiResult<UploadResult> {
        let mut state = self.state();
        if state.fail_uploads {
            return Err(unavailable("upload"));
        }
        state.uploads.push(payload.clone());

        let mut result: UploadResult = HashMap::new();
        let suites = payload["test_suites"].as_array().cloned().unwrap_or_default();
        for suite in suites {
            let filename = suite["filename"].as_str().unwrap_or_default().to_string();
            for case in suite["test_cases"].as_array().cloned().unwrap_or_default() {
                let method = case["method_name"].as_str().unwrap_or_default().to_string();
                let id = format!("test-{}", state.next_test_id);
                state.next_test_id += 1;
                result.entry(filename.clone()).or_default().insert(method, id);
            }
        }
        Ok(result)
    }

    async fn upload_attachment(
        &self,
        path: &Path,
        kind: AttachmentKind,
        external_test_id: &str,
    ) -> ApiResult<()> {
        if external_test_id.is_empty() {
            return Err(ApiError::InvalidTestId(external_test_id.to_string()));
        }
        let mut state = self.state();
        if state.fail_uploads {
            return Err(unavailable("attachment"));
        }
        state.attachments.push(UploadedAttachment {
            path: path.to_path_buf(),
            kind,
            test_id: external_test_id.to_string(),
        });
        Ok(())
    }

    async fn finish_execution(&self, error_log: Option<&Path>) -> ApiResult<()> {
        let contents = error_log.map(fs::read_to_string).transpose()?;
        self.state().finishes.push(contents);
        Ok(())
    }

    fn set_credentials(&self, api_token: &str, project_id: &str) {
        let mut state = self.state();
        state.api_token = api_token.to_string();
        state.project_id = project_id.to_string();
    }

    fn credentials(&self) -> (String, String) {
        let state = self.state();
        (state.api_token.clone(), state.project_id.clone())
    }

    fn run_id(&self) -> Option<String> {
        self.state().run_id.clone()
    }
}
