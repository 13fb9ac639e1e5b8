use crate::config::ApiConfig;
use crate::types::{InitializeRunRequest, InitializeRunResponse, UploadResponse};
use async_trait::async_trait;
use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::header::CONTENT_ENCODING;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use tauk_proto::{
    ApiError, ApiResult, AttachmentKind, ReportingApi, RunInit, RunMetadata, UploadResult,
};
use tracing::{debug, error, info, warn};

/// Header carrying the attachment discriminator.
pub const ATTACHMENT_TYPE_HEADER: &str = "Tauk-Attachment-Type";

/// Keys whose values are too large to be useful in debug logs.
const STRIPPED_KEYS: [&str; 3] = ["screenshot", "view", "log"];

#[derive(Debug, Default)]
struct SessionState {
    api_token: String,
    project_id: String,
    run_id: Option<String>,
}

/// Client for the Tauk reporting service.
pub struct TaukApi {
    client: Client,
    config: ApiConfig,
    state: RwLock<SessionState>,
}

impl TaukApi {
    /// Create a new Tauk API client with configuration
    pub fn new(config: ApiConfig) -> ApiResult<Self> {
        // Teardown may run on a different runtime than the requests before
        // it, and a pooled connection is driven by the runtime that opened it.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(transport)?;

        let state = SessionState {
            api_token: config.api_token.clone(),
            project_id: config.project_id.clone(),
            run_id: None,
        };

        Ok(Self {
            client,
            config,
            state: RwLock::new(state),
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn project_id(&self) -> String {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .project_id
            .clone()
    }

    fn api_token(&self) -> String {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .api_token
            .clone()
    }

    /// URL below `execution/{project}/{run}/`.
    fn run_url(&self, suffix: &str) -> ApiResult<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let run_id = state.run_id.as_deref().ok_or(ApiError::NotInitialized)?;
        Ok(format!(
            "{}/execution/{}/{}/{}",
            self.config.api_url, state.project_id, run_id, suffix
        ))
    }

    /// Sends a request, retrying connect failures, timeouts and 5xx responses.
    async fn send(
        &self,
        operation: &'static str,
        build: impl Fn(&Client) -> RequestBuilder + Send + Sync,
    ) -> ApiResult<Response> {
        let token = self.api_token();
        let mut attempt: u32 = 0;

        loop {
            let result = build(&self.client).bearer_auth(&token).send().await;
            let retryable = match &result {
                Ok(response) => response.status().is_server_error(),
                Err(e) => e.is_connect() || e.is_timeout(),
            };

            if !retryable || attempt >= self.config.max_retries {
                let response = result.map_err(transport)?;
                return check_status(operation, response).await;
            }

            attempt += 1;
            match &result {
                Ok(response) => warn!(
                    "{} returned {}, retrying ({}/{})",
                    operation,
                    response.status(),
                    attempt,
                    self.config.max_retries
                ),
                Err(e) => warn!(
                    "{} failed: {}, retrying ({}/{})",
                    operation, e, attempt, self.config.max_retries
                ),
            }
            tokio::time::sleep(self.config.retry_delay * attempt).await;
        }
    }
}

#[async_trait]
impl ReportingApi for TaukApi {
    async fn initialize_run(
        &self,
        metadata: &RunMetadata,
        hint_run_id: Option<&str>,
    ) -> ApiResult<RunInit> {
        let url = format!(
            "{}/execution/{}/initialize",
            self.config.api_url,
            self.project_id()
        );
        let body = InitializeRunRequest {
            metadata,
            run_id: hint_run_id,
        };

        debug!("Initializing run with url [{}], run hint [{:?}]", url, hint_run_id);
        let response = self
            .send("initialize run", |client| client.post(&url).json(&body))
            .await?;

        let parsed: InitializeRunResponse = response.json().await.map_err(transport)?;
        let run_id = parsed
            .run_id
            .ok_or_else(|| ApiError::MissingField("run_id".to_string()))?;

        if let Some(latest) = &parsed.latest_tauk_client_version
            && self.config.client_version != "develop"
            && *latest != self.config.client_version
        {
            warn!(
                "You are currently using Tauk [{}]. Consider updating to the latest version [{}]",
                self.config.client_version, latest
            );
        }

        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .run_id = Some(run_id.clone());
        info!("Setting run ID for current execution as {}", run_id);

        Ok(RunInit {
            run_id,
            latest_client_version: parsed.latest_tauk_client_version,
        })
    }

    async fn upload_test_result(&self, payload: &Value) -> ApiResult<UploadResult> {
        let url = self.run_url("report/upload")?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!("Uploading test: url[{}], body[{}]", url, shortened_json(payload));
        }

        let response = self
            .send("upload test", |client| client.post(&url).json(payload))
            .await?;
        let parsed: UploadResponse = response.json().await.map_err(transport)?;
        debug!("Upload result: {:?}", parsed.result);

        parsed
            .result
            .ok_or_else(|| ApiError::MissingField("result".to_string()))
    }

    async fn upload_attachment(
        &self,
        path: &Path,
        kind: AttachmentKind,
        external_test_id: &str,
    ) -> ApiResult<()> {
        if external_test_id.trim().is_empty() {
            return Err(ApiError::InvalidTestId(external_test_id.to_string()));
        }

        let url = self.run_url(&format!("attachment/upload/{}", external_test_id))?;
        let content = tokio::fs::read(path).await?;

        debug!(
            "Uploading test attachment: url[{}], kind[{}], file[{}] ({} bytes)",
            url,
            kind,
            path.display(),
            content.len()
        );
        self.send("upload attachment", |client| {
            client
                .post(&url)
                .header(ATTACHMENT_TYPE_HEADER, kind.as_str())
                .body(content.clone())
        })
        .await?;

        Ok(())
    }

    async fn finish_execution(&self, error_log: Option<&Path>) -> ApiResult<()> {
        let end_ts = Utc::now().timestamp_millis();
        let url = self.run_url(&format!("finish/{}", end_ts))?;

        let Some(path) = error_log else {
            debug!("Sending execution finish: url[{}]", url);
            self.send("finish execution", |client| client.post(&url))
                .await?;
            return Ok(());
        };

        let body = gzip(&tokio::fs::read(path).await?)?;
        debug!(
            "Sending execution finish: url[{}], file[{}] ({} compressed bytes)",
            url,
            path.display(),
            body.len()
        );
        self.send("finish execution", |client| {
            client
                .post(&url)
                .header(CONTENT_ENCODING, "gzip")
                .body(body.clone())
        })
        .await?;

        Ok(())
    }

    fn set_credentials(&self, api_token: &str, project_id: &str) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.api_token = api_token.to_string();
        state.project_id = project_id.to_string();
    }

    fn credentials(&self) -> (String, String) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        (state.api_token.clone(), state.project_id.clone())
    }

    fn run_id(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .run_id
            .clone()
    }
}

fn transport(e: reqwest::Error) -> ApiError {
    ApiError::Transport(e.to_string())
}

async fn check_status(operation: &'static str, response: Response) -> ApiResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!("Failed to {}. Response[{}]: {}", operation, status, body);
    Err(ApiError::Status {
        operation,
        status: status.as_u16(),
        body,
    })
}

fn gzip(content: &[u8]) -> ApiResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content)?;
    Ok(encoder.finish()?)
}

/// Renders a payload for logging with screenshots, views and logs elided.
pub fn shortened_json(payload: &Value) -> String {
    fn strip(value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, inner) in map.iter_mut() {
                    if STRIPPED_KEYS.contains(&key.as_str()) {
                        *inner = Value::String("stripped".to_string());
                    } else {
                        strip(inner);
                    }
                }
            }
            Value::Array(items) => items.iter_mut().for_each(strip),
            _ => {}
        }
    }

    let mut copy = payload.clone();
    strip(&mut copy);
    copy.to_string()
}
