//! The companion client against an in-process axum server.

use super::{Companion, CompanionConfig};
use crate::test_case::TestCaseRecord;
use crate::testing::MockDriver;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use std::fs;
use std::sync::{Arc, Mutex};
use tauk_proto::AttachmentKind;
use tempfile::TempDir;
use tokio::net::TcpListener;

const DEBUGGER: &str = "localhost:9222";

#[derive(Default)]
struct ServerState {
    requests: Vec<(Method, String, Vec<u8>)>,
    fail_connect: bool,
}

type Shared = Arc<Mutex<ServerState>>;

async fn handle(State(state): State<Shared>, method: Method, uri: Uri, body: Bytes) -> Response {
    let path = uri.path().to_string();
    let mut state = state.lock().unwrap();
    state
        .requests
        .push((method.clone(), path.clone(), body.to_vec()));

    if path == "/version" {
        return axum::Json(json!({"version": "1.4.0"})).into_response();
    }
    if path.ends_with("/connect") {
        if state.fail_connect {
            return (StatusCode::INTERNAL_SERVER_ERROR, "no page").into_response();
        }
        return axum::Json(json!({"desc": {"id": "page-1", "type": "page"}})).into_response();
    }
    if path.starts_with("/cdp/browser/") {
        return StatusCode::OK.into_response();
    }
    StatusCode::NOT_FOUND.into_response()
}

struct MockCompanion {
    state: Shared,
    port: u16,
}

impl MockCompanion {
    async fn start() -> Self {
        let state: Shared = Arc::default();
        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { state, port }
    }

    fn requests(&self) -> Vec<(Method, String, Vec<u8>)> {
        self.state.lock().unwrap().requests.clone()
    }

    fn paths(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|(method, path, _)| format!("{} {}", method, path))
            .collect()
    }
}

#[tokio::test]
async fn test_version() {
    let server = MockCompanion::start().await;
    let tmp = TempDir::new().unwrap();
    let companion = Companion::attach(server.port, CompanionConfig::default(), tmp.path()).unwrap();

    assert_eq!(companion.version().await.unwrap(), "1.4.0");
}

#[tokio::test]
async fn test_register_driver_connects_page() {
    let server = MockCompanion::start().await;
    let tmp = TempDir::new().unwrap();
    let config = CompanionConfig::default().capture_console_logs(true, "warning");
    let companion = Companion::attach(server.port, config, tmp.path()).unwrap();
    let mut record = TestCaseRecord::new("tests/cart.rs", "add_to_cart");

    record
        .register_driver(Arc::new(MockDriver::selenium()), Some(&companion))
        .await;

    assert_eq!(record.browser_debugger_address(), Some(DEBUGGER));
    assert_eq!(record.browser_debugger_page_id(), Some("page-1"));
    assert_eq!(
        server.paths(),
        vec![
            format!("POST /cdp/browser/new/{}", DEBUGGER),
            format!("POST /cdp/browser/page/{}/connect", DEBUGGER),
        ]
    );

    let (_, _, body) = &server.requests()[1];
    let posted: Value = serde_json::from_slice(body).unwrap();
    assert_eq!(posted["runtime"]["consoleLogs"]["level"], "warning");
    assert_eq!(posted["runtime"]["exceptionLogs"]["enabled"], true);
    assert_eq!(posted["network"], json!({}));
}

#[tokio::test]
async fn test_failed_connect_leaves_page_unset() {
    let server = MockCompanion::start().await;
    server.state.lock().unwrap().fail_connect = true;
    let tmp = TempDir::new().unwrap();
    let companion = Companion::attach(server.port, CompanionConfig::default(), tmp.path()).unwrap();
    let mut record = TestCaseRecord::new("tests/cart.rs", "add_to_cart");

    record
        .register_driver(Arc::new(MockDriver::selenium()), Some(&companion))
        .await;

    assert!(record.driver().is_some());
    assert_eq!(record.browser_debugger_page_id(), None);
}

#[tokio::test]
async fn test_disabled_capture_never_contacts_companion() {
    let server = MockCompanion::start().await;
    let tmp = TempDir::new().unwrap();
    let config = CompanionConfig::default()
        .capture_console_logs(false, "error")
        .capture_browser_logs(false, "error")
        .capture_uncaught_exceptions(false);
    let companion = Companion::attach(server.port, config, tmp.path()).unwrap();
    let mut record = TestCaseRecord::new("tests/cart.rs", "add_to_cart");

    record
        .register_driver(Arc::new(MockDriver::selenium()), Some(&companion))
        .await;

    assert!(server.requests().is_empty());
    assert_eq!(record.browser_debugger_page_id(), None);
}

#[tokio::test]
async fn test_close_out_returns_captured_files() {
    let server = MockCompanion::start().await;
    let tmp = TempDir::new().unwrap();
    let companion = Companion::attach(server.port, CompanionConfig::default(), tmp.path()).unwrap();
    let page_dir = companion.execution_dir().join("page-1");
    fs::create_dir_all(&page_dir).unwrap();
    fs::write(page_dir.join("browser_logs.json"), "[]").unwrap();
    fs::write(page_dir.join("console_logs.json"), "[]").unwrap();

    let files = companion.close_out(DEBUGGER, Some("page-1")).await;

    let kinds: Vec<AttachmentKind> = files.iter().map(|(_, kind)| *kind).collect();
    assert_eq!(
        kinds,
        vec![AttachmentKind::BrowserLogs, AttachmentKind::ConsoleLogs]
    );
    assert_eq!(
        server.paths(),
        vec![
            format!("POST /cdp/browser/targets/{}/close", DEBUGGER),
            format!("DELETE /cdp/browser/new/{}", DEBUGGER),
        ]
    );
}

#[tokio::test]
async fn test_close_out_without_page_only_unregisters() {
    let server = MockCompanion::start().await;
    let tmp = TempDir::new().unwrap();
    let companion = Companion::attach(server.port, CompanionConfig::default(), tmp.path()).unwrap();

    let files = companion.close_out(DEBUGGER, None).await;

    assert!(files.is_empty());
    assert_eq!(
        server.paths(),
        vec![format!("DELETE /cdp/browser/new/{}", DEBUGGER)]
    );
}

#[tokio::test]
async fn test_stopped_companion_still_yields_files() {
    let server = MockCompanion::start().await;
    let tmp = TempDir::new().unwrap();
    let companion = Companion::attach(server.port, CompanionConfig::default(), tmp.path()).unwrap();
    let page_dir = companion.execution_dir().join("page-7");
    fs::create_dir_all(&page_dir).unwrap();
    fs::write(page_dir.join("exception_logs.json"), "[]").unwrap();

    companion.kill();
    let files = companion.close_out(DEBUGGER, Some("page-7")).await;

    assert_eq!(files.len(), 1);
    assert_eq!(files[0].1, AttachmentKind::ExceptionLogs);
    assert!(server.requests().is_empty());
}
