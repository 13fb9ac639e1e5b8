//! Entry point for test-framework integrations.
//!
//! A [`ReportingClient`] owns the [`ExecutionContext`] of the process and
//! drives each test through start, outcome, upload and eviction. Tests are
//! either wrapped with [`ReportingClient::observe`] or reported through the
//! listener methods (`start_test` .. `stop_test`).

use crate::attribution::{self, ExceptionInfo, SourceListing};
use crate::config::TaukConfig;
use crate::context::ExecutionContext;
use crate::error::{Result, TaukError};
use crate::logging::{self, ErrorLogSink};
use crate::test_case::{Attachment, DriverScope, TestCaseRecord};
use crate::test_data::{SharedRecord, TestHandle};
use futures::FutureExt;
use std::fmt;
use std::fs;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tauk_api::{ApiConfig, TaukApi};
use tauk_proto::{AttachmentKind, AutomationDriver, ReportingApi};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

static GLOBAL: OnceCell<Arc<ReportingClient>> = OnceCell::const_new();

/// Identity and options of a test about to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestDescriptor {
    /// Source file of the test, as given by `file!()`.
    pub filename: String,
    pub method_name: String,
    pub custom_name: Option<String>,
    pub class_name: Option<String>,
    pub suite_name: Option<String>,
    pub excluded: bool,
}

impl TestDescriptor {
    pub fn new(filename: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            method_name: method_name.into(),
            ..Self::default()
        }
    }

    pub fn with_custom_name(mut self, name: impl Into<String>) -> Self {
        self.custom_name = Some(name.into());
        self
    }

    pub fn with_class_name(mut self, name: impl Into<String>) -> Self {
        self.class_name = Some(name.into());
        self
    }

    pub fn with_suite_name(mut self, name: impl Into<String>) -> Self {
        self.suite_name = Some(name.into());
        self
    }

    pub fn excluded(mut self) -> Self {
        self.excluded = true;
        self
    }

    pub fn handle(&self) -> TestHandle {
        TestHandle::new(&self.filename, &self.method_name)
    }
}

/// Builds a [`TestDescriptor`] for a test in the calling file.
///
/// ```no_run
/// let descriptor = tauk_core::test_descriptor!("login_works", "Login with a valid password");
/// ```
#[macro_export]
macro_rules! test_descriptor {
    ($method:expr) => {
        $crate::TestDescriptor::new(file!(), $method)
    };
    ($method:expr, $custom_name:expr) => {
        $crate::TestDescriptor::new(file!(), $method).with_custom_name($custom_name)
    };
}

/// Reports tests of this process to Tauk.
pub struct ReportingClient {
    context: ExecutionContext,
    shutdown: OnceCell<()>,
}

impl ReportingClient {
    /// Sets up the execution context with an explicit reporting service.
    pub async fn new(config: TaukConfig, api: Arc<dyn ReportingApi>) -> Result<Self> {
        Self::with_error_log(config, api, logging::error_log_sink().clone()).await
    }

    /// Like [`ReportingClient::new`], writing ERROR events to `error_log`.
    pub async fn with_error_log(
        config: TaukConfig,
        api: Arc<dyn ReportingApi>,
        error_log: ErrorLogSink,
    ) -> Result<Self> {
        attribution::install_panic_hook();
        let context = ExecutionContext::setup(config, api, error_log).await?;
        Ok(Self {
            context,
            shutdown: OnceCell::new(),
        })
    }

    /// Installs logging and talks to the service at `config.api_url`.
    pub async fn from_config(config: TaukConfig) -> Result<Self> {
        logging::init(&config);
        let api_config = ApiConfig::new(&config.api_token, &config.project_id)
            .with_api_url(&config.api_url)
            .with_client_version(&config.client_version);
        let api = TaukApi::new(api_config)?;
        Self::new(config, Arc::new(api)).await
    }

    /// The process-wide client, created from `config` on first use.
    ///
    /// Later calls return the existing client and ignore `config`.
    pub async fn get_or_init(config: TaukConfig) -> Result<Arc<Self>> {
        GLOBAL
            .get_or_try_init(move || async move {
                Self::from_config(config).await.map(Arc::new)
            })
            .await
            .cloned()
    }

    /// The process-wide client, if it has been created.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn run_id(&self) -> &str {
        self.context.run_id()
    }

    /// Runs `body` as an observed test.
    ///
    /// The outer result carries errors of the reporting itself, such as a
    /// duplicate registration. The inner result is the body's own outcome,
    /// returned unchanged after it has been reported. A panic in the body is
    /// reported as a failure and then resumed.
    ///
    /// Failures are attributed to a line of the test function from the
    /// error's backtrace. For `anyhow::Error` that backtrace only exists when
    /// `RUST_BACKTRACE=1` or `RUST_LIB_BACKTRACE=1` is set; without it the
    /// failure is reported with its message and no line number. Panics are
    /// attributed from the panic location either way.
    pub async fn observe<F, Fut, T, E>(
        &self,
        descriptor: TestDescriptor,
        body: F,
    ) -> Result<std::result::Result<T, E>>
    where
        F: FnOnce(TestHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display + fmt::Debug + 'static,
    {
        let handle = self.start_test(descriptor)?;
        let outcome = AssertUnwindSafe(handle.clone().scope(body(handle.clone())))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(value)) => {
                log_failure(self.test_succeeded(&handle).await);
                Ok(value)
            }
            Ok(Err(e)) => {
                let exception = ExceptionInfo::from_error(&e);
                log_failure(self.test_failed(&handle, &exception, None).await);
                Err(e)
            }
            Err(payload) => {
                let exception = ExceptionInfo::from_panic(payload.as_ref());
                log_failure(self.test_failed(&handle, &exception, None).await);
                self.stop_test(&handle).await;
                std::panic::resume_unwind(payload);
            }
        };

        self.stop_test(&handle).await;
        Ok(result)
    }

    /// Registers a test and stamps its start time.
    pub fn start_test(&self, descriptor: TestDescriptor) -> Result<TestHandle> {
        let handle = descriptor.handle();
        let mut record = TestCaseRecord::new(&descriptor.filename, &descriptor.method_name);
        if let Some(name) = &descriptor.custom_name {
            record.set_custom_name(name);
        }
        if let Some(name) = &descriptor.class_name {
            record.set_class_name(name);
        }
        if descriptor.excluded {
            record.exclude();
        }
        record.start();

        let test_data = self.context.test_data();
        test_data.add_test_case(record)?;
        test_data.set_suite_info(
            &descriptor.filename,
            descriptor.suite_name,
            descriptor.class_name,
        );
        debug!("Started {}::{}", handle.filename, handle.method_name);
        Ok(handle)
    }

    pub async fn test_succeeded(&self, handle: &TestHandle) -> Result<()> {
        let record = self.record(handle)?;
        let mut record = record.lock().await;
        record.record_success().await
    }

    /// Records a failure. Without `listing` the test function is looked up
    /// in its source file.
    pub async fn test_failed(
        &self,
        handle: &TestHandle,
        exception: &ExceptionInfo,
        listing: Option<&SourceListing>,
    ) -> Result<()> {
        let record = self.record(handle)?;
        let mut record = record.lock().await;
        record.record_failure(exception, listing).await
    }

    pub async fn test_skipped(&self, handle: &TestHandle) -> Result<()> {
        self.record(handle)?.lock().await.exclude();
        Ok(())
    }

    /// Finishes a test: captures logs, uploads the result and attachments,
    /// then drops the record.
    ///
    /// Each step runs even if an earlier one failed. A record whose upload
    /// failed stays in memory but no longer blocks the method name.
    pub async fn stop_test(&self, handle: &TestHandle) {
        let Some(record) = self
            .context
            .test_data()
            .get_test_case(&handle.filename, &handle.method_name)
        else {
            warn!(
                "No active test {} in {} to stop",
                handle.method_name, handle.filename
            );
            return;
        };

        {
            let mut record = record.lock().await;
            record.finish();
            record.capture_logs().await;
        }

        let test_id = match self.context.upload_test(handle).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(error = %e, "Failed to upload result of {}", handle.method_name);
                None
            }
        };

        self.upload_attachments(&record, test_id.as_deref()).await;

        let test_data = self.context.test_data();
        if test_id.is_some() {
            test_data.remove_test_case(&handle.filename, &handle.method_name);
        } else {
            test_data.mark_finished(&handle.filename, &handle.method_name);
        }
    }

    async fn upload_attachments(&self, record: &SharedRecord, test_id: Option<&str>) {
        let (address, page_id, mut attachments) = {
            let mut record = record.lock().await;
            (
                record.browser_debugger_address().map(str::to_string),
                record.browser_debugger_page_id().map(str::to_string),
                record.take_attachments(),
            )
        };

        if let (Some(companion), Some(address)) = (self.context.companion(), address)
            && companion.config().is_cdp_capture_enabled()
        {
            let captured = companion.close_out(&address, page_id.as_deref()).await;
            attachments.extend(
                captured
                    .into_iter()
                    .map(|(path, kind)| Attachment { path, kind }),
            );
        }

        let Some(test_id) = test_id else {
            if !attachments.is_empty() {
                warn!(
                    "Skipping {} attachments because the test result was not uploaded",
                    attachments.len()
                );
            }
            return;
        };

        let api = self.context.api();
        for attachment in attachments {
            match api
                .upload_attachment(&attachment.path, attachment.kind, test_id)
                .await
            {
                Ok(()) if attachment.kind.is_companion_attachment() => {
                    if let Err(e) = fs::remove_file(&attachment.path) {
                        debug!("Could not remove {}: {}", attachment.path.display(), e);
                    }
                }
                Ok(()) => {}
                Err(e) => error!(
                    error = %e,
                    "Failed to upload {} attachment {}",
                    attachment.kind,
                    attachment.path.display()
                ),
            }
        }
    }

    /// Record of `handle`, or of the test scoped on the current task.
    fn resolve(&self, handle: Option<&TestHandle>) -> Result<SharedRecord> {
        let handle = handle
            .cloned()
            .or_else(TestHandle::current)
            .ok_or(TaukError::NoActiveTest)?;
        self.record(&handle)
    }

    fn record(&self, handle: &TestHandle) -> Result<SharedRecord> {
        self.context
            .test_data()
            .get_test_case(&handle.filename, &handle.method_name)
            .ok_or_else(|| TaukError::TestCaseNotFound {
                filename: handle.filename.clone(),
                name: handle.method_name.clone(),
            })
    }

    /// Binds `driver` to a running test.
    ///
    /// Quit the driver through the returned scope so the final screen is
    /// captured first.
    pub async fn register_driver(
        &self,
        driver: Arc<dyn AutomationDriver>,
        handle: Option<&TestHandle>,
    ) -> Result<DriverScope> {
        let record = self.resolve(handle)?;
        record
            .lock()
            .await
            .register_driver(Arc::clone(&driver), self.context.companion())
            .await;
        Ok(DriverScope::new(record, driver))
    }

    pub async fn add_user_data(
        &self,
        name: &str,
        value: &str,
        handle: Option<&TestHandle>,
    ) -> Result<()> {
        self.resolve(handle)?
            .lock()
            .await
            .add_user_data(name, value)
    }

    pub async fn add_attachment(
        &self,
        path: impl AsRef<Path>,
        kind: AttachmentKind,
        handle: Option<&TestHandle>,
    ) -> Result<()> {
        self.resolve(handle)?
            .lock()
            .await
            .add_attachment(path, kind)
    }

    pub async fn add_tag(&self, name: &str, value: &str, handle: Option<&TestHandle>) -> Result<()> {
        self.resolve(handle)?.lock().await.add_tag(name, value);
        Ok(())
    }

    /// Finishes the run and cleans up. Only the first call has an effect.
    pub async fn shutdown(&self) {
        self.shutdown
            .get_or_init(|| async { self.context.teardown().await })
            .await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.initialized()
    }

    /// Guard that shuts the client down when dropped.
    pub fn shutdown_guard(self: &Arc<Self>) -> ShutdownGuard {
        ShutdownGuard {
            client: Arc::clone(self),
        }
    }
}

fn log_failure(result: Result<()>) {
    if let Err(e) = result {
        warn!("Could not record test outcome: {}", e);
    }
}

/// Runs [`ReportingClient::shutdown`] on drop if nobody awaited it.
///
/// In async code prefer awaiting `shutdown()` directly. Dropping the guard
/// blocks the dropping thread until teardown is done: on a multi-threaded
/// runtime through `block_in_place`, elsewhere on a helper thread with its
/// own runtime.
pub struct ShutdownGuard {
    client: Arc<ReportingClient>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if self.client.is_shut_down() {
            return;
        }
        let client = Arc::clone(&self.client);
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(client.shutdown()));
            }
            _ => shutdown_on_helper_thread(client),
        }
    }
}

fn shutdown_on_helper_thread(client: Arc<ReportingClient>) {
    let joined = std::thread::spawn(move || {
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime.block_on(client.shutdown()),
            Err(e) => error!("Could not start runtime for teardown: {}", e),
        }
    })
    .join();
    if joined.is_err() {
        error!("Teardown thread panicked");
    }
}
