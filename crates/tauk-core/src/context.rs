//! Per-process execution state: the execution directory, the run id agreed
//! with the reporting service, the test registry and the companion.
//!
//! In multi-process mode the run id is negotiated through the run file under
//! the execution lock:
//!
//! 1. No run file, or one that is corrupt: initialize a fresh run and write it.
//! 2. A run file with a malformed run id: same as above.
//! 3. A well-formed run id: re-initialize with it as a hint. The service
//!    either confirms it or hands out a new id, which replaces the file.
//!
//! The process always continues with the id returned by the service.
//!
//! Each process registers as a member of the run while it holds the lock.
//! On teardown the last member removes the run file and the directory, so a
//! process finishing early never pulls the run out from under its siblings.

use crate::companion::{COMPANION_DIR, Companion};
use crate::config::{ENV_EXEC_DIR, ENV_MULTI_PROCESS, TaukConfig};
use crate::error::{Result, TaukError};
use crate::exec_lock::{EXEC_LOCK_TIMEOUT, ExecLock};
use crate::execution_dir::{DirRole, ExecutionDir, parent_pid};
use crate::logging::ErrorLogSink;
use crate::run_file::{
    RUN_FILE, RUN_LOCK_FILE, RunFileState, SharedRunFile, join_run, leave_run,
};
use crate::test_data::{TestData, TestHandle};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tauk_proto::{ApiError, ReportingApi, RunMetadata};
use tracing::{debug, error, info, warn};

pub struct ExecutionContext {
    config: TaukConfig,
    api: Arc<dyn ReportingApi>,
    exec_dir: ExecutionDir,
    run_id: String,
    /// Member name in a multi-process run.
    member: Option<String>,
    test_data: TestData,
    companion: Option<Companion>,
    error_log: ErrorLogSink,
}

impl ExecutionContext {
    /// Prepares the execution directory, establishes the run id and starts
    /// the companion if one is configured.
    ///
    /// Errors here are fatal for the process: without a run id nothing can
    /// be reported.
    pub async fn setup(
        config: TaukConfig,
        api: Arc<dyn ReportingApi>,
        error_log: ErrorLogSink,
    ) -> Result<Self> {
        config.validate()?;
        let cwd = env::current_dir()?;
        let test_data = TestData::new(config.client_version.clone());
        let metadata = test_data.run_metadata(config.multi_process);

        let (exec_dir, run_id, member) = if config.multi_process {
            let exec_dir = ExecutionDir::multi(
                &config.home_dir,
                &cwd,
                config.exec_dir.as_deref(),
                parent_pid(),
                std::process::id(),
            )?;
            let (run_id, member) = negotiate_shared_run(
                api.as_ref(),
                &metadata,
                &exec_dir.path,
                std::process::id(),
            )
            .await?;
            (exec_dir, run_id, Some(member))
        } else {
            let exec_dir = ExecutionDir::single(&config.home_dir, &cwd, parent_pid())?;
            let run_id = api.initialize_run(&metadata, None).await?.run_id;
            (exec_dir, run_id, None)
        };
        info!(
            "Tauk run {} using execution directory {}",
            run_id,
            exec_dir.path.display()
        );

        match error_log.open(&exec_dir.path) {
            Ok(path) => debug!("Error log at {}", path.display()),
            Err(e) => warn!("Could not open error log in {}: {}", exec_dir.path.display(), e),
        }

        let companion = match &config.companion {
            Some(companion_config) => {
                let (api_token, _) = api.credentials();
                Some(
                    Companion::launch(
                        &config.companion_executable,
                        &api_token,
                        &exec_dir.path,
                        &config.home_dir,
                        companion_config.clone(),
                    )
                    .await?,
                )
            }
            None => None,
        };

        Ok(Self {
            config,
            api,
            exec_dir,
            run_id,
            member,
            test_data,
            companion,
            error_log,
        })
    }

    pub fn config(&self) -> &TaukConfig {
        &self.config
    }

    pub fn api(&self) -> &Arc<dyn ReportingApi> {
        &self.api
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn exec_dir(&self) -> &Path {
        &self.exec_dir.path
    }

    pub fn dir_role(&self) -> DirRole {
        self.exec_dir.role
    }

    pub fn test_data(&self) -> &TestData {
        &self.test_data
    }

    pub fn companion(&self) -> Option<&Companion> {
        self.companion.as_ref()
    }

    pub fn run_file_path(&self) -> PathBuf {
        self.exec_dir.path.join(RUN_FILE)
    }

    /// Environment for test processes spawned by this one so that they join
    /// this run. Empty in single-process mode.
    pub fn child_env(&self) -> Vec<(String, String)> {
        if !self.config.multi_process {
            return Vec::new();
        }
        vec![
            (
                ENV_EXEC_DIR.to_string(),
                self.exec_dir.path.to_string_lossy().into_owned(),
            ),
            (ENV_MULTI_PROCESS.to_string(), "true".to_string()),
        ]
    }

    /// Uploads the result of `handle` and stores the id the service assigned.
    pub async fn upload_test(&self, handle: &TestHandle) -> Result<String> {
        let document = self
            .test_data
            .json_for_test(&handle.filename, &handle.method_name)
            .await
            .ok_or_else(|| TaukError::TestCaseNotFound {
                filename: handle.filename.clone(),
                name: handle.method_name.clone(),
            })?;
        debug!("Uploading {}", tauk_api::shortened_json(&document));

        let result = self.api.upload_test_result(&document).await?;
        let id = result
            .get(&handle.filename)
            .and_then(|tests| tests.get(&handle.method_name))
            .cloned()
            .ok_or_else(|| {
                ApiError::MissingField(format!(
                    "result.{}.{}",
                    handle.filename, handle.method_name
                ))
            })?;

        if let Some(record) = self
            .test_data
            .get_test_case(&handle.filename, &handle.method_name)
        {
            record.lock().await.set_id(id.clone());
        }
        Ok(id)
    }

    /// Stops the companion, finishes the run and removes coordination files.
    ///
    /// Every step runs even when an earlier one fails. Failures are logged.
    pub async fn teardown(&self) {
        if let Some(companion) = &self.companion {
            companion.kill();
        }

        let error_log = self.error_log.close();
        let shipped = error_log
            .as_deref()
            .filter(|path| fs::metadata(path).is_ok_and(|m| m.len() > 0));
        if let Err(e) = self.api.finish_execution(shipped).await {
            error!(error = %e, "Failed to finish run {}", self.run_id);
        }

        if self.config.cleanup_exec_context {
            self.remove_files(error_log.as_deref()).await;
        }
    }

    async fn remove_files(&self, error_log: Option<&Path>) {
        let dir = &self.exec_dir.path;
        if let Some(path) = error_log {
            remove_file(path);
        }

        if self.exec_dir.role == DirRole::Single {
            match fs::remove_dir_all(dir) {
                Ok(()) => debug!("Removed execution directory {}", dir.display()),
                Err(e) => warn!("Could not remove {}: {}", dir.display(), e),
            }
            return;
        }

        self.exec_dir.release();
        if !self.leave_shared_run().await {
            return;
        }
        let companion_dir = dir.join(COMPANION_DIR);
        if let Err(e) = fs::remove_dir_all(&companion_dir)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("Could not remove {}: {}", companion_dir.display(), e);
        }
        remove_file(&dir.join(RUN_LOCK_FILE));
        match fs::remove_dir(dir) {
            Ok(()) => debug!("Removed execution directory {}", dir.display()),
            Err(e) => debug!("Keeping execution directory {}: {}", dir.display(), e),
        }
    }

    /// Leaves the shared run. Returns true when this was its last member,
    /// in which case the run file is gone.
    async fn leave_shared_run(&self) -> bool {
        let Some(member) = &self.member else {
            return false;
        };
        let dir = &self.exec_dir.path;
        let _guard = match ExecLock::acquire(dir.join(RUN_LOCK_FILE), EXEC_LOCK_TIMEOUT).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Could not leave run in {}: {}", dir.display(), e);
                return false;
            }
        };
        match leave_run(dir, member) {
            Ok(0) => {
                remove_file(&dir.join(RUN_FILE));
                true
            }
            Ok(remaining) => {
                debug!("{} other process(es) still use {}", remaining, dir.display());
                false
            }
            Err(e) => {
                warn!("Could not leave run in {}: {}", dir.display(), e);
                false
            }
        }
    }
}

fn remove_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", path.display(), e),
    }
}

/// Agrees on the run id with the other processes of the run and joins it.
///
/// Returns the run id and this process's member name.
async fn negotiate_shared_run(
    api: &dyn ReportingApi,
    metadata: &RunMetadata,
    exec_dir: &Path,
    pid: u32,
) -> Result<(String, String)> {
    let _guard = ExecLock::acquire(exec_dir.join(RUN_LOCK_FILE), EXEC_LOCK_TIMEOUT).await?;
    let run_id = agree_on_run_id(api, metadata, exec_dir).await?;
    let member = join_run(exec_dir, pid)?;
    Ok((run_id, member))
}

async fn agree_on_run_id(
    api: &dyn ReportingApi,
    metadata: &RunMetadata,
    exec_dir: &Path,
) -> Result<String> {
    let run_file = exec_dir.join(RUN_FILE);

    match SharedRunFile::read(&run_file)? {
        RunFileState::Valid(shared) => {
            if !shared.api_token.is_empty() && !shared.project_id.is_empty() {
                api.set_credentials(&shared.api_token, &shared.project_id);
            }
            if shared.has_valid_run_id() {
                let init = api.initialize_run(metadata, Some(&shared.run_id)).await?;
                if init.run_id != shared.run_id {
                    info!(
                        "Run {} is no longer live, continuing as {}",
                        shared.run_id, init.run_id
                    );
                    SharedRunFile {
                        run_id: init.run_id.clone(),
                        ..shared
                    }
                    .write(&run_file)?;
                }
                return Ok(init.run_id);
            }
            warn!(
                "Run id '{}' in {} is malformed, starting a new run",
                shared.run_id,
                run_file.display()
            );
        }
        RunFileState::Corrupt(reason) => {
            warn!("Ignoring corrupt run file {}: {}", run_file.display(), reason);
        }
        RunFileState::Missing => debug!("No run file yet at {}", run_file.display()),
    }

    let (api_token, project_id) = api.credentials();
    if api_token.is_empty() || project_id.is_empty() {
        return Err(TaukError::Config(
            "an API token and project id are required to start a run".to_string(),
        ));
    }
    let init = api.initialize_run(metadata, None).await?;
    SharedRunFile::new(init.run_id.clone(), api_token, project_id).write(&run_file)?;
    Ok(init.run_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InitializeCall, MockReportingApi};
    use crate::run_file::MEMBERS_DIR;
    use std::time::Duration;
    use tempfile::TempDir;

    const LIVE_RUN: &str = "1d6a0c4e-8f0b-4c53-9d2e-5b1f6f3f7a10";
    const NEW_RUN: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
    const OTHER_RUN: &str = "0b4e5c2a-93d1-4f6e-8a7b-2d9c1e3f5a68";
    const PID: u32 = 4242;

    fn metadata() -> RunMetadata {
        TestData::new("0.9.0").run_metadata(true)
    }

    #[tokio::test]
    async fn test_first_process_writes_run_file() {
        let tmp = TempDir::new().unwrap();
        let api = MockReportingApi::new("token", "project").with_run_ids(&[NEW_RUN]);

        let (run_id, _) = negotiate_shared_run(&api, &metadata(), tmp.path(), PID)
            .await
            .unwrap();

        assert_eq!(run_id, NEW_RUN);
        assert_eq!(
            SharedRunFile::read(&tmp.path().join(RUN_FILE)).unwrap(),
            RunFileState::Valid(SharedRunFile::new(NEW_RUN, "token", "project"))
        );
        assert_eq!(api.initializations()[0].hint, None);
    }

    #[tokio::test]
    async fn test_live_run_is_confirmed_and_file_unchanged() {
        let tmp = TempDir::new().unwrap();
        let run_file = tmp.path().join(RUN_FILE);
        SharedRunFile::new(LIVE_RUN, "shared-token", "shared-project")
            .write(&run_file)
            .unwrap();
        let before = fs::read_to_string(&run_file).unwrap();
        let api = MockReportingApi::new("", "");

        let (run_id, _) = negotiate_shared_run(&api, &metadata(), tmp.path(), PID)
            .await
            .unwrap();

        assert_eq!(run_id, LIVE_RUN);
        assert_eq!(fs::read_to_string(&run_file).unwrap(), before);
        let calls = api.initializations();
        assert_eq!(calls[0].hint.as_deref(), Some(LIVE_RUN));
        assert_eq!(
            calls[0].credentials,
            ("shared-token".to_string(), "shared-project".to_string())
        );
    }

    #[tokio::test]
    async fn test_stale_run_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let run_file = tmp.path().join(RUN_FILE);
        SharedRunFile::new(LIVE_RUN, "token", "project")
            .write(&run_file)
            .unwrap();
        let api = MockReportingApi::new("token", "project")
            .with_run_ids(&[NEW_RUN])
            .rejecting_hints();

        let (run_id, _) = negotiate_shared_run(&api, &metadata(), tmp.path(), PID)
            .await
            .unwrap();

        assert_eq!(run_id, NEW_RUN);
        let RunFileState::Valid(stored) = SharedRunFile::read(&run_file).unwrap() else {
            panic!("run file should be valid");
        };
        assert_eq!(stored.run_id, NEW_RUN);
    }

    #[tokio::test]
    async fn test_malformed_run_id_is_never_trusted() {
        let tmp = TempDir::new().unwrap();
        let run_file = tmp.path().join(RUN_FILE);
        SharedRunFile::new("not-a-uuid", "token", "project")
            .write(&run_file)
            .unwrap();
        let api = MockReportingApi::new("token", "project").with_run_ids(&[NEW_RUN]);

        let (run_id, _) = negotiate_shared_run(&api, &metadata(), tmp.path(), PID)
            .await
            .unwrap();

        assert_eq!(run_id, NEW_RUN);
        let calls = api.initializations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].hint, None);
    }

    #[tokio::test]
    async fn test_corrupt_file_without_credentials_is_a_config_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(RUN_FILE), "garbage").unwrap();
        let api = MockReportingApi::new("", "");

        let err = negotiate_shared_run(&api, &metadata(), tmp.path(), PID)
            .await
            .unwrap_err();

        assert!(matches!(err, TaukError::Config(_)));
        assert!(api.initializations().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_failure_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let api = MockReportingApi::new("token", "project").failing_initialize();

        let err = negotiate_shared_run(&api, &metadata(), tmp.path(), PID)
            .await
            .unwrap_err();

        assert!(matches!(err, TaukError::Api(_)));
        assert!(!tmp.path().join(RUN_FILE).exists());
    }

    #[tokio::test]
    async fn test_concurrent_processes_start_one_run() {
        let tmp = TempDir::new().unwrap();
        let delay = Duration::from_millis(150);
        let first = MockReportingApi::new("token", "project")
            .with_run_ids(&[NEW_RUN])
            .with_initialize_delay(delay);
        let second = MockReportingApi::new("token", "project")
            .with_run_ids(&[OTHER_RUN])
            .with_initialize_delay(delay);

        let meta_a = metadata();
        let meta_b = metadata();
        let (a, b) = tokio::join!(
            negotiate_shared_run(&first, &meta_a, tmp.path(), 501),
            negotiate_shared_run(&second, &meta_b, tmp.path(), 502),
        );
        let (a, _) = a.unwrap();
        let (b, _) = b.unwrap();

        assert_eq!(a, b);
        let calls: Vec<InitializeCall> = first
            .initializations()
            .into_iter()
            .chain(second.initializations())
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls.iter().filter(|c| c.hint.is_none()).count(), 1);
        let RunFileState::Valid(stored) = SharedRunFile::read(&tmp.path().join(RUN_FILE)).unwrap()
        else {
            panic!("run file should be valid");
        };
        assert_eq!(stored.run_id, a);
    }

    #[tokio::test]
    async fn test_each_process_joins_as_member() {
        let tmp = TempDir::new().unwrap();
        let api = MockReportingApi::new("token", "project").with_run_ids(&[NEW_RUN]);

        let (_, first) = negotiate_shared_run(&api, &metadata(), tmp.path(), PID)
            .await
            .unwrap();
        let (_, second) = negotiate_shared_run(&api, &metadata(), tmp.path(), PID)
            .await
            .unwrap();

        assert_ne!(first, second);
        assert!(first.starts_with("4242-"));
        assert!(tmp.path().join(MEMBERS_DIR).join(&first).exists());
        assert!(tmp.path().join(MEMBERS_DIR).join(&second).exists());
    }

    #[tokio::test]
    async fn test_failed_negotiation_does_not_join() {
        let tmp = TempDir::new().unwrap();
        let api = MockReportingApi::new("token", "project").failing_initialize();

        assert!(
            negotiate_shared_run(&api, &metadata(), tmp.path(), PID)
                .await
                .is_err()
        );
        assert!(!tmp.path().join(MEMBERS_DIR).exists());
    }
}
