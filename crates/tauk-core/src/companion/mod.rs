//! Client for the companion subprocess that records browser debug-protocol
//! traffic (console, exceptions, browser logs) for each test.
//!
//! The companion is launched once per execution context and controlled over
//! a small local HTTP API. It writes its captures under
//! `<execution dir>/companion/<page id>/`.
//!
//! Picking a port and starting the companion on it happens under
//! `$TAUK_HOME/companion-port.lock`, so concurrent launches on one machine
//! never settle on the same free port.

mod config;
#[cfg(test)]
mod http_tests;

pub use config::{
    CompanionConfig, FilteredCapture, LeveledCapture, LogCapture, NetworkCapture, RuntimeCapture,
};

use crate::error::{Result, TaukError};
use crate::exec_lock::{EXEC_LOCK_TIMEOUT, ExecLock};
use reqwest::Client;
use serde::Deserialize;
use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tauk_proto::AttachmentKind;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Ports tried when launching the companion.
pub const PORT_RANGE: Range<u16> = 8285..8295;

/// Name of the companion's directory inside the execution directory.
pub const COMPANION_DIR: &str = "companion";

/// Lock file under the Tauk home directory held while a port is claimed.
pub const PORT_LOCK_FILE: &str = "companion-port.lock";

const READY_TIMEOUT: Duration = Duration::from_secs(6);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    desc: PageDescription,
}

#[derive(Debug, Deserialize)]
struct PageDescription {
    id: String,
}

/// Handle to a running companion.
#[derive(Debug)]
pub struct Companion {
    port: u16,
    config: CompanionConfig,
    execution_dir: PathBuf,
    client: Client,
    child: Mutex<Option<Child>>,
    /// Set for companions this process did not spawn.
    attached: AtomicBool,
}

impl Companion {
    /// Spawns the companion and waits until it answers `/version`.
    ///
    /// `lock_dir` holds the port lock and is shared by every Tauk process on
    /// the machine, normally the Tauk home directory.
    pub async fn launch(
        executable: &Path,
        api_token: &str,
        exec_dir: &Path,
        lock_dir: &Path,
        config: CompanionConfig,
    ) -> Result<Self> {
        Self::launch_within(
            executable,
            api_token,
            exec_dir,
            lock_dir,
            config,
            READY_TIMEOUT,
        )
        .await
    }

    async fn launch_within(
        executable: &Path,
        api_token: &str,
        exec_dir: &Path,
        lock_dir: &Path,
        config: CompanionConfig,
        ready_timeout: Duration,
    ) -> Result<Self> {
        let execution_dir = exec_dir.join(COMPANION_DIR);
        fs::create_dir_all(&execution_dir)?;

        // Held until the companion listens, or has failed to
        let _port_lock =
            ExecLock::acquire(lock_dir.join(PORT_LOCK_FILE), EXEC_LOCK_TIMEOUT).await?;
        let port = find_free_port(PORT_RANGE).await?;

        let child = Command::new(executable)
            .arg("-apiToken")
            .arg(api_token)
            .arg("-executionDir")
            .arg(&execution_dir)
            .arg("-port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TaukError::CompanionLaunch(format!(
                    "could not start {}: {}",
                    executable.display(),
                    e
                ))
            })?;

        let companion = Self {
            port,
            config,
            execution_dir,
            client: http_client()?,
            child: Mutex::new(Some(child)),
            attached: AtomicBool::new(false),
        };

        match companion.wait_until_ready(ready_timeout).await {
            Ok(version) => {
                info!("Companion {} listening on port {}", version, port);
                Ok(companion)
            }
            Err(e) => {
                companion.kill();
                Err(e)
            }
        }
    }

    /// Connects to a companion already listening on `port`.
    #[cfg(test)]
    pub(crate) fn attach(port: u16, config: CompanionConfig, exec_dir: &Path) -> Result<Self> {
        Ok(Self {
            port,
            config,
            execution_dir: exec_dir.join(COMPANION_DIR),
            client: http_client()?,
            child: Mutex::new(None),
            attached: AtomicBool::new(true),
        })
    }

    async fn wait_until_ready(&self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.exit_status() {
                return Err(TaukError::CompanionLaunch(format!(
                    "companion exited before becoming ready ({})",
                    status
                )));
            }

            match self.version().await {
                Ok(version) => return Ok(version),
                Err(e) => debug!("Companion not ready yet: {}", e),
            }

            if Instant::now() >= deadline {
                return Err(TaukError::CompanionLaunch(format!(
                    "companion did not respond on port {} within {:?}",
                    self.port, timeout
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    fn exit_status(&self) -> Option<std::process::ExitStatus> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        child.as_mut().and_then(|c| c.try_wait().ok().flatten())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &CompanionConfig {
        &self.config
    }

    /// Directory the companion writes its captures to.
    pub fn execution_dir(&self) -> &Path {
        &self.execution_dir
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}/{}", self.port, path)
    }

    pub fn is_running(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.as_mut() {
            Some(c) => matches!(c.try_wait(), Ok(None)),
            None => self.attached.load(Ordering::SeqCst),
        }
    }

    /// Stops the companion. Safe to call more than once.
    pub fn kill(&self) {
        self.attached.store(false, Ordering::SeqCst);
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            match child.start_kill() {
                Ok(()) => debug!("Companion on port {} stopped", self.port),
                Err(e) => warn!("Failed to stop companion on port {}: {}", self.port, e),
            }
        }
    }

    pub async fn version(&self) -> Result<String> {
        let response = self
            .client
            .get(self.url("version"))
            .send()
            .await
            .map_err(companion_error)?;
        let response = check_status("version", response)?;
        let body: VersionResponse = response.json().await.map_err(companion_error)?;
        Ok(body.version)
    }

    /// Starts tracking the browser exposing `debugger_address`.
    pub async fn register_browser(&self, debugger_address: &str) -> Result<()> {
        let path = format!("cdp/browser/new/{}", debugger_address);
        let response = self
            .client
            .post(self.url(&path))
            .send()
            .await
            .map_err(companion_error)?;
        check_status("register browser", response)?;
        Ok(())
    }

    pub async fn unregister_browser(&self, debugger_address: &str) -> Result<()> {
        let path = format!("cdp/browser/new/{}", debugger_address);
        let response = self
            .client
            .delete(self.url(&path))
            .send()
            .await
            .map_err(companion_error)?;
        check_status("unregister browser", response)?;
        Ok(())
    }

    /// Attaches to the browser's current page and returns its page id.
    pub async fn connect_page(&self, debugger_address: &str) -> Result<String> {
        let path = format!("cdp/browser/page/{}/connect", debugger_address);
        let response = self
            .client
            .post(self.url(&path))
            .json(&self.config)
            .send()
            .await
            .map_err(companion_error)?;
        let response = check_status("connect page", response)?;
        let body: ConnectResponse = response.json().await.map_err(companion_error)?;
        Ok(body.desc.id)
    }

    pub async fn close_page(&self, debugger_address: &str) -> Result<()> {
        let path = format!("cdp/browser/targets/{}/close", debugger_address);
        let response = self
            .client
            .post(self.url(&path))
            .send()
            .await
            .map_err(companion_error)?;
        check_status("close page", response)?;
        Ok(())
    }

    /// Files captured for `page_id`, with their attachment kinds.
    pub fn attachments(&self, page_id: &str) -> io::Result<Vec<(PathBuf, AttachmentKind)>> {
        let dir = self.execution_dir.join(page_id);
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let kind =
                    AttachmentKind::resolve_companion_log(&entry.file_name().to_string_lossy());
                files.push((entry.path(), kind));
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    /// Ends capture for a finished test and returns the files to upload.
    ///
    /// Failures are logged; whatever was captured is still returned.
    pub async fn close_out(
        &self,
        debugger_address: &str,
        page_id: Option<&str>,
    ) -> Vec<(PathBuf, AttachmentKind)> {
        if self.is_running() {
            if page_id.is_some()
                && let Err(e) = self.close_page(debugger_address).await
            {
                debug!("Could not close companion page for {}: {}", debugger_address, e);
            }
            if let Err(e) = self.unregister_browser(debugger_address).await {
                warn!("Could not unregister browser {}: {}", debugger_address, e);
            }
        }

        let Some(page_id) = page_id else {
            warn!(
                "Companion never connected to a page for {}, no browser logs to upload",
                debugger_address
            );
            return Vec::new();
        };

        match self.attachments(page_id) {
            Ok(files) => files,
            Err(e) => {
                warn!("No companion captures for page {}: {}", page_id, e);
                Vec::new()
            }
        }
    }
}

fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(companion_error)
}

fn companion_error(e: reqwest::Error) -> TaukError {
    TaukError::Companion(e.to_string())
}

fn check_status(operation: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TaukError::Companion(format!(
            "{} returned status {}",
            operation, status
        )))
    }
}

/// First port in `range` nothing is listening on.
pub async fn find_free_port(range: Range<u16>) -> Result<u16> {
    for port in range.clone() {
        if tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_err()
        {
            return Ok(port);
        }
    }
    Err(TaukError::NoFreePort {
        start: range.start,
        end: range.end,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_find_free_port_skips_listening_ports() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let busy = listener.local_addr().unwrap().port();

        let port = find_free_port(busy..busy.saturating_add(1)).await;
        assert!(matches!(port, Err(TaukError::NoFreePort { .. })));

        drop(listener);
        assert_eq!(find_free_port(busy..busy.saturating_add(1)).await.unwrap(), busy);
    }

    #[test]
    fn test_attachments_resolve_kinds() {
        let tmp = TempDir::new().unwrap();
        let companion = Companion::attach(8285, CompanionConfig::default(), tmp.path()).unwrap();
        let page_dir = companion.execution_dir().join("page-1");
        fs::create_dir_all(&page_dir).unwrap();
        fs::write(page_dir.join("console_logs.json"), "[]").unwrap();
        fs::write(page_dir.join("exception_logs.json"), "[]").unwrap();

        let files = companion.attachments("page-1").unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].1, AttachmentKind::ConsoleLogs);
        assert_eq!(files[1].1, AttachmentKind::ExceptionLogs);
        assert!(companion.attachments("missing").is_err());
    }

    #[test]
    fn test_attached_companion_stops_running_after_kill() {
        let tmp = TempDir::new().unwrap();
        let companion = Companion::attach(8285, CompanionConfig::default(), tmp.path()).unwrap();

        assert!(companion.is_running());
        companion.kill();
        assert!(!companion.is_running());
    }

    /// Writes an executable shell script standing in for the companion. It
    /// records its arguments in `args` next to itself, then runs `body`.
    fn fake_companion(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("tauk-companion");
        let script = format!(
            "#!/bin/sh\necho \"$@\" > \"{}\"\n{}\n",
            dir.join("args").display(),
            body
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn wait_for_args(dir: &Path) -> String {
        loop {
            if let Ok(args) = fs::read_to_string(dir.join("args"))
                && args.ends_with('\n')
            {
                return args;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_launch_fails_for_missing_executable() {
        let tmp = TempDir::new().unwrap();
        let result = Companion::launch(
            Path::new("/nonexistent/tauk-companion"),
            "token",
            tmp.path(),
            tmp.path(),
            CompanionConfig::default(),
        )
        .await;

        assert!(matches!(
            result,
            Err(TaukError::CompanionLaunch(_) | TaukError::NoFreePort { .. })
        ));
    }

    #[tokio::test]
    async fn test_launch_fails_when_companion_exits_early() {
        let tmp = TempDir::new().unwrap();
        let executable = fake_companion(tmp.path(), "exit 3");

        let result = Companion::launch(
            &executable,
            "token",
            tmp.path(),
            tmp.path(),
            CompanionConfig::default(),
        )
        .await;

        match result {
            Err(TaukError::CompanionLaunch(message)) => {
                assert!(message.contains("exited before becoming ready"), "{message}");
            }
            other => panic!("expected CompanionLaunch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_launch_times_out_when_companion_never_listens() {
        let tmp = TempDir::new().unwrap();
        let executable = fake_companion(tmp.path(), "exec sleep 30");

        let result = Companion::launch_within(
            &executable,
            "token",
            tmp.path(),
            tmp.path(),
            CompanionConfig::default(),
            Duration::from_millis(600),
        )
        .await;

        match result {
            Err(TaukError::CompanionLaunch(message)) => {
                assert!(message.contains("did not respond"), "{message}");
            }
            other => panic!("expected CompanionLaunch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_launch_passes_arguments_and_waits_until_ready() {
        use axum::Router;
        use axum::routing::get;

        let tmp = TempDir::new().unwrap();
        let executable = fake_companion(tmp.path(), "exec sleep 30");

        let launch = Companion::launch_within(
            &executable,
            "token-1",
            tmp.path(),
            tmp.path(),
            CompanionConfig::default(),
            Duration::from_secs(5),
        );
        // Answers /version on the port the companion was told to use
        let serve = async {
            let args = wait_for_args(tmp.path()).await;
            let port: u16 = args.split_whitespace().last().unwrap().parse().unwrap();
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
                .await
                .unwrap();
            let app = Router::new().route(
                "/version",
                get(|| async { axum::Json(serde_json::json!({"version": "2.0.1"})) }),
            );
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            args
        };

        let (companion, args) = tokio::join!(launch, serve);
        let companion = companion.unwrap();

        let expected = format!(
            "-apiToken token-1 -executionDir {} -port {}",
            tmp.path().join(COMPANION_DIR).display(),
            companion.port()
        );
        assert_eq!(args.trim_end(), expected);
        assert!(PORT_RANGE.contains(&companion.port()));
        assert!(companion.is_running());
        companion.kill();
        assert!(!companion.is_running());
    }

    #[tokio::test]
    async fn test_launch_waits_for_port_lock() {
        let tmp = TempDir::new().unwrap();
        let executable = fake_companion(tmp.path(), "exit 0");
        let held = ExecLock::try_acquire(tmp.path().join(PORT_LOCK_FILE)).unwrap();

        let launch = tokio::spawn({
            let dir = tmp.path().to_path_buf();
            async move {
                Companion::launch(&executable, "token", &dir, &dir, CompanionConfig::default())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!tmp.path().join("args").exists());

        drop(held);
        let result = launch.await.unwrap();

        assert!(matches!(result, Err(TaukError::CompanionLaunch(_))));
        assert!(tmp.path().join("args").exists());
    }
}
