//! Exercises `TaukApi` against an in-process axum server.

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use flate2::read::GzDecoder;
use serde_json::{Value, json};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tauk_api::{ApiConfig, TaukApi};
use tauk_proto::{ApiError, AttachmentKind, ReportingApi, RunMetadata};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct RecordedRequest {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl RecordedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

#[derive(Default)]
struct ServerState {
    requests: Vec<RecordedRequest>,
    /// Number of upcoming requests answered with 503.
    unavailable: u32,
    /// Status returned for every request when set.
    forced_status: Option<StatusCode>,
    omit_run_id: bool,
}

type Shared = Arc<Mutex<ServerState>>;

async fn handle(
    State(state): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let mut state = state.lock().unwrap();
    state.requests.push(RecordedRequest {
        method,
        path: path.clone(),
        headers,
        body: body.to_vec(),
    });

    if state.unavailable > 0 {
        state.unavailable -= 1;
        return (StatusCode::SERVICE_UNAVAILABLE, "try again").into_response();
    }
    if let Some(status) = state.forced_status {
        return (status, "rejected").into_response();
    }

    if path.ends_with("/initialize") {
        if state.omit_run_id {
            return axum::Json(json!({})).into_response();
        }
        return axum::Json(json!({
            "run_id": "8a6e0804-2bd0-4672-b79d-d97027f9071a",
            "latest_tauk_client_version": "9.9.9"
        }))
        .into_response();
    }
    if path.ends_with("/report/upload") {
        return axum::Json(json!({
            "result": {"tests/login.rs": {"login_works": "ext-42"}}
        }))
        .into_response();
    }
    StatusCode::OK.into_response()
}

async fn spawn_server(state: Shared) -> String {
    let app = Router::new().fallback(handle).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/api/v1/", addr)
}

fn metadata() -> RunMetadata {
    RunMetadata {
        language: "rust".to_string(),
        tauk_client_version: "0.9.0".to_string(),
        start_timestamp: 1_700_000_000_000,
        timezone: "Europe/Berlin".to_string(),
        dst: false,
        multi_process_run: true,
        host_os_name: "Linux".to_string(),
        host_os_version: "6.1".to_string(),
    }
}

async fn client(state: &Shared) -> TaukApi {
    let url = spawn_server(state.clone()).await;
    let config = ApiConfig::new("secret-token", "proj-1")
        .with_api_url(url)
        .with_retries(3, Duration::from_millis(10));
    TaukApi::new(config).unwrap()
}

#[tokio::test]
async fn test_initialize_run_posts_metadata_and_stores_run_id() {
    let state = Shared::default();
    let api = client(&state).await;

    let run = api
        .initialize_run(&metadata(), Some("8a6e0804-2bd0-4672-b79d-d97027f9071a"))
        .await
        .unwrap();

    assert_eq!(run.run_id, "8a6e0804-2bd0-4672-b79d-d97027f9071a");
    assert_eq!(run.latest_client_version.as_deref(), Some("9.9.9"));
    assert_eq!(api.run_id().as_deref(), Some(run.run_id.as_str()));

    let requests = state.lock().unwrap().requests.clone();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.path, "/api/v1/execution/proj-1/initialize");
    assert_eq!(request.header("authorization"), Some("Bearer secret-token"));

    let body = request.json();
    assert_eq!(body["language"], "rust");
    assert_eq!(body["timezone"], "Europe/Berlin");
    assert_eq!(body["multi_process_run"], true);
    assert_eq!(body["run_id"], "8a6e0804-2bd0-4672-b79d-d97027f9071a");
}

#[tokio::test]
async fn test_initialize_run_without_hint_omits_run_id() {
    let state = Shared::default();
    let api = client(&state).await;

    api.initialize_run(&metadata(), None).await.unwrap();

    let body = state.lock().unwrap().requests[0].json();
    assert!(body.get("run_id").is_none());
}

#[tokio::test]
async fn test_initialize_run_requires_run_id_in_response() {
    let state = Shared::default();
    state.lock().unwrap().omit_run_id = true;
    let api = client(&state).await;

    let err = api.initialize_run(&metadata(), None).await.unwrap_err();
    assert!(matches!(err, ApiError::MissingField(ref field) if field == "run_id"));
    assert!(api.run_id().is_none());
}

#[tokio::test]
async fn test_upload_test_result_returns_external_ids() {
    let state = Shared::default();
    let api = client(&state).await;
    api.initialize_run(&metadata(), None).await.unwrap();

    let payload = json!({"test_suites": [{"filename": "tests/login.rs", "test_cases": []}]});
    let result = api.upload_test_result(&payload).await.unwrap();

    assert_eq!(result["tests/login.rs"]["login_works"], "ext-42");
    let requests = state.lock().unwrap().requests.clone();
    assert_eq!(
        requests[1].path,
        "/api/v1/execution/proj-1/8a6e0804-2bd0-4672-b79d-d97027f9071a/report/upload"
    );
    assert_eq!(requests[1].json(), payload);
}

#[tokio::test]
async fn test_upload_attachment_sends_kind_header_and_content() {
    let state = Shared::default();
    let api = client(&state).await;
    api.initialize_run(&metadata(), None).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("console_logs.json");
    std::fs::write(&file, b"[{\"level\":\"info\"}]").unwrap();

    api.upload_attachment(&file, AttachmentKind::ConsoleLogs, "ext-42")
        .await
        .unwrap();

    let requests = state.lock().unwrap().requests.clone();
    let request = &requests[1];
    assert!(request.path.ends_with("/attachment/upload/ext-42"));
    assert_eq!(request.header("tauk-attachment-type"), Some("console_logs"));
    assert_eq!(request.body, b"[{\"level\":\"info\"}]");
}

#[tokio::test]
async fn test_upload_attachment_rejects_blank_test_id() {
    let state = Shared::default();
    let api = client(&state).await;
    api.initialize_run(&metadata(), None).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("video.mp4");
    std::fs::write(&file, b"mp4").unwrap();

    let err = api
        .upload_attachment(&file, AttachmentKind::Video, "  ")
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidTestId(_)));
    assert_eq!(state.lock().unwrap().requests.len(), 1);
}

#[tokio::test]
async fn test_finish_execution_gzips_error_log() {
    let state = Shared::default();
    let api = client(&state).await;
    api.initialize_run(&metadata(), None).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("tauk-errors.jsonl");
    let content = "{\"level\":\"ERROR\",\"message\":\"upload failed\"}\n";
    std::fs::write(&log, content).unwrap();

    api.finish_execution(Some(&log)).await.unwrap();

    let requests = state.lock().unwrap().requests.clone();
    let request = &requests[1];
    assert!(request.path.contains("/finish/"));
    assert_eq!(request.header("content-encoding"), Some("gzip"));

    let mut decoded = String::new();
    GzDecoder::new(request.body.as_slice())
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded, content);
}

#[tokio::test]
async fn test_finish_execution_without_log_sends_empty_body() {
    let state = Shared::default();
    let api = client(&state).await;
    api.initialize_run(&metadata(), None).await.unwrap();

    api.finish_execution(None).await.unwrap();

    let requests = state.lock().unwrap().requests.clone();
    assert!(requests[1].body.is_empty());
    assert!(requests[1].header("content-encoding").is_none());
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let state = Shared::default();
    let api = client(&state).await;
    state.lock().unwrap().unavailable = 2;

    let run = api.initialize_run(&metadata(), None).await.unwrap();

    assert_eq!(run.run_id, "8a6e0804-2bd0-4672-b79d-d97027f9071a");
    assert_eq!(state.lock().unwrap().requests.len(), 3);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let state = Shared::default();
    let api = client(&state).await;
    state.lock().unwrap().unavailable = 10;

    let err = api.initialize_run(&metadata(), None).await.unwrap_err();

    assert!(matches!(err, ApiError::Status { status: 503, .. }));
    // One attempt plus three retries.
    assert_eq!(state.lock().unwrap().requests.len(), 4);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let state = Shared::default();
    let api = client(&state).await;
    state.lock().unwrap().forced_status = Some(StatusCode::UNAUTHORIZED);

    let err = api.initialize_run(&metadata(), None).await.unwrap_err();

    match err {
        ApiError::Status { status, body, .. } => {
            assert_eq!(status, 401);
            assert_eq!(body, "rejected");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(state.lock().unwrap().requests.len(), 1);
}

#[tokio::test]
async fn test_set_credentials_applies_to_later_requests() {
    let state = Shared::default();
    let api = client(&state).await;
    api.set_credentials("shared-token", "shared-project");

    api.initialize_run(&metadata(), None).await.unwrap();

    let requests = state.lock().unwrap().requests.clone();
    assert_eq!(requests[0].path, "/api/v1/execution/shared-project/initialize");
    assert_eq!(requests[0].header("authorization"), Some("Bearer shared-token"));
}
