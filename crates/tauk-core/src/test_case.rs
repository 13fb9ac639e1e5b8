//! The result of one test invocation, from start to upload.

use crate::attribution::{self, CodeLine, ErrorDetail, ExceptionInfo, SourceListing};
use crate::capture::{self, AppiumLogEntry};
use crate::companion::Companion;
use crate::error::{Result, TaukError};
use crate::platform;
use crate::test_data::SharedRecord;
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tauk_proto::{
    AttachmentKind, AutomationDriver, AutomationType, Capabilities, PlatformName, TestStatus,
};
use tracing::{debug, error, warn};

/// Largest file accepted by [`TestCaseRecord::add_attachment`].
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_USER_DATA_NAME_CHARS: usize = 100;
pub const MAX_USER_DATA_VALUE_CHARS: usize = 1000;

/// A file queued for upload with the test result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub path: PathBuf,
    pub kind: AttachmentKind,
}

/// State of one test invocation.
pub struct TestCaseRecord {
    id: Option<String>,
    filename: String,
    method_name: String,
    custom_name: Option<String>,
    class_name: Option<String>,
    status: TestStatus,
    excluded: bool,
    start_timestamp: Option<i64>,
    end_timestamp: Option<i64>,
    timezone: Option<String>,

    automation_type: Option<AutomationType>,
    platform_name: Option<PlatformName>,
    platform_version: Option<String>,
    browser_name: Option<String>,
    browser_version: Option<String>,
    capabilities: Option<Capabilities>,
    webdriver_client_version: Option<String>,
    browser_driver_version: Option<String>,
    appium_server_version: Option<String>,
    browser_debugger_address: Option<String>,
    browser_debugger_page_id: Option<String>,

    error: Option<ErrorDetail>,
    code_context: Vec<CodeLine>,
    screenshot: Option<String>,
    view: Option<String>,
    log: Vec<AppiumLogEntry>,

    attachments: Vec<Attachment>,
    tags: Map<String, Value>,
    user_data: Map<String, Value>,
    driver: Option<Arc<dyn AutomationDriver>>,
}

impl TestCaseRecord {
    pub fn new(filename: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            id: None,
            filename: filename.into(),
            method_name: method_name.into(),
            custom_name: None,
            class_name: None,
            status: TestStatus::Pending,
            excluded: false,
            start_timestamp: None,
            end_timestamp: None,
            timezone: None,
            automation_type: None,
            platform_name: None,
            platform_version: None,
            browser_name: None,
            browser_version: None,
            capabilities: None,
            webdriver_client_version: None,
            browser_driver_version: None,
            appium_server_version: None,
            browser_debugger_address: None,
            browser_debugger_page_id: None,
            error: None,
            code_context: Vec::new(),
            screenshot: None,
            view: None,
            log: Vec::new(),
            attachments: Vec::new(),
            tags: Map::new(),
            user_data: Map::new(),
            driver: None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn custom_name(&self) -> Option<&str> {
        self.custom_name.as_deref()
    }

    pub fn set_custom_name(&mut self, name: impl Into<String>) {
        self.custom_name = Some(name.into());
    }

    pub fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    pub fn set_class_name(&mut self, name: impl Into<String>) {
        self.class_name = Some(name.into());
    }

    /// Reported status. An excluded test reports `Excluded` whatever its outcome.
    pub fn status(&self) -> TestStatus {
        if self.excluded {
            TestStatus::Excluded
        } else {
            self.status
        }
    }

    pub fn is_excluded(&self) -> bool {
        self.excluded
    }

    pub fn start_timestamp(&self) -> Option<i64> {
        self.start_timestamp
    }

    pub fn end_timestamp(&self) -> Option<i64> {
        self.end_timestamp
    }

    pub fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    pub fn automation_type(&self) -> Option<AutomationType> {
        self.automation_type
    }

    pub fn platform_name(&self) -> Option<PlatformName> {
        self.platform_name
    }

    pub fn browser_name(&self) -> Option<&str> {
        self.browser_name.as_deref()
    }

    pub fn browser_debugger_address(&self) -> Option<&str> {
        self.browser_debugger_address.as_deref()
    }

    pub fn browser_debugger_page_id(&self) -> Option<&str> {
        self.browser_debugger_page_id.as_deref()
    }

    pub fn error(&self) -> Option<&ErrorDetail> {
        self.error.as_ref()
    }

    pub fn code_context(&self) -> &[CodeLine] {
        &self.code_context
    }

    pub fn screenshot(&self) -> Option<&str> {
        self.screenshot.as_deref()
    }

    pub(crate) fn set_screenshot(&mut self, screenshot: String) {
        self.screenshot = Some(screenshot);
    }

    pub fn view(&self) -> Option<&str> {
        self.view.as_deref()
    }

    pub(crate) fn set_view(&mut self, view: String) {
        self.view = Some(view);
    }

    pub fn log(&self) -> &[AppiumLogEntry] {
        &self.log
    }

    pub(crate) fn set_log(&mut self, log: Vec<AppiumLogEntry>) {
        self.log = log;
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Removes and returns the queued attachments.
    pub fn take_attachments(&mut self) -> Vec<Attachment> {
        std::mem::take(&mut self.attachments)
    }

    pub fn tags(&self) -> &Map<String, Value> {
        &self.tags
    }

    pub fn user_data(&self) -> &Map<String, Value> {
        &self.user_data
    }

    pub fn driver(&self) -> Option<Arc<dyn AutomationDriver>> {
        self.driver.clone()
    }

    /// Stamps the start time and the local time zone at that instant.
    pub fn start(&mut self) {
        self.start_timestamp = Some(platform::now_millis());
        self.timezone = Some(platform::local_timezone());
    }

    /// Stamps the end time, never earlier than the start.
    pub fn finish(&mut self) {
        let now = platform::now_millis();
        self.end_timestamp = Some(self.start_timestamp.map_or(now, |start| now.max(start)));
    }

    fn transition(&mut self, to: TestStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(TaukError::InvalidStatusTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Marks the test passed and captures the final screen.
    pub async fn record_success(&mut self) -> Result<()> {
        self.transition(TestStatus::Passed)?;
        self.capture_screen().await;
        Ok(())
    }

    /// Marks the test failed, captures the final screen and attributes the
    /// failure to a line of the test file.
    ///
    /// Without `listing`, the test function is looked up in its source file.
    pub async fn record_failure(
        &mut self,
        exception: &ExceptionInfo,
        listing: Option<&SourceListing>,
    ) -> Result<()> {
        self.transition(TestStatus::Failed)?;
        self.capture_screen().await;

        let (detail, line_number) = attribution::attribute(&self.filename, exception);
        if line_number.is_none() {
            debug!(
                "No frame of {} found in failure of {}",
                self.filename, self.method_name
            );
        }
        self.error = Some(detail);

        let found;
        let listing = match listing {
            Some(listing) => Some(listing),
            None => {
                found = self.find_test_function();
                found.as_ref()
            }
        };
        match listing {
            Some(listing) => self.code_context = attribution::code_context(listing, line_number),
            None => warn!(
                "Could not locate source of {} in {}",
                self.method_name, self.filename
            ),
        }
        Ok(())
    }

    fn find_test_function(&self) -> Option<SourceListing> {
        let path = attribution::resolve_source_path(&self.filename)?;
        let text = fs::read_to_string(path).ok()?;
        SourceListing::find_function(&text, &self.method_name)
    }

    /// Excludes the test from its suite's results. Allowed in any state.
    pub fn exclude(&mut self) {
        self.excluded = true;
    }

    /// Binds `driver` to this test and records what it reports about itself.
    ///
    /// With a running companion configured for debug-protocol capture, the
    /// browser is registered with it and its page connected.
    pub async fn register_driver(
        &mut self,
        driver: Arc<dyn AutomationDriver>,
        companion: Option<&Companion>,
    ) {
        let description = capture::describe_driver(driver.as_ref()).await;
        self.automation_type = description.automation_type;
        self.capabilities = description.capabilities;
        self.platform_name = description.platform_name;
        self.platform_version = description.platform_version;
        self.browser_name = description.browser_name;
        self.browser_version = description.browser_version;
        self.webdriver_client_version = description.webdriver_client_version;
        self.browser_driver_version = description.browser_driver_version;
        self.appium_server_version = description.appium_server_version;
        self.browser_debugger_address = description.browser_debugger_address;
        self.driver = Some(driver);

        let Some(companion) = companion.filter(|c| c.is_running()) else {
            return;
        };
        if !companion.config().is_cdp_capture_enabled() {
            return;
        }
        let Some(address) = self.browser_debugger_address.clone() else {
            debug!(
                "Driver for {} exposes no debugger address, skipping companion",
                self.method_name
            );
            return;
        };

        if let Err(e) = companion.register_browser(&address).await {
            error!(error = %e, "Could not register browser {} with the companion", address);
            return;
        }
        match companion.connect_page(&address).await {
            Ok(page_id) => self.browser_debugger_page_id = Some(page_id),
            Err(e) => error!(error = %e, "Could not connect companion to page at {}", address),
        }
    }

    /// Queues a file for upload.
    pub fn add_attachment(&mut self, path: impl AsRef<Path>, kind: AttachmentKind) -> Result<()> {
        let path = path.as_ref();
        let metadata = match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(TaukError::AttachmentNotFound(path.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TaukError::AttachmentNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.len() > MAX_ATTACHMENT_BYTES {
            return Err(TaukError::SizeExceeded {
                what: "attachment",
                limit: MAX_ATTACHMENT_BYTES,
                actual: metadata.len(),
            });
        }

        self.attachments.push(Attachment {
            path: path.to_path_buf(),
            kind,
        });
        Ok(())
    }

    pub fn add_user_data(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let name = name.into();
        let value = value.into();
        check_chars("user data name", &name, MAX_USER_DATA_NAME_CHARS)?;
        check_chars("user data value", &value, MAX_USER_DATA_VALUE_CHARS)?;
        self.user_data.insert(name, Value::String(value));
        Ok(())
    }

    pub fn add_tag(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(name.into(), Value::String(value.into()));
    }

    async fn capture_screen(&mut self) {
        if let Some(driver) = self.driver.clone() {
            capture::capture_screenshot(self, driver.as_ref()).await;
            capture::capture_view(self, driver.as_ref()).await;
        }
    }

    /// Captures the screenshot and view if the driver is still bound.
    pub async fn capture_artifacts(&mut self) {
        self.capture_screen().await;
    }

    /// Captures the Appium server log if an Appium driver is bound.
    pub async fn capture_logs(&mut self) {
        if let Some(driver) = self.driver.clone() {
            capture::capture_logs(self, driver.as_ref()).await;
        }
    }

    /// Wire form of the record. Unset and empty fields are left out.
    pub fn to_payload(&self) -> Value {
        let mut map = Map::new();
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value.filter(|v| !is_empty(v)) {
                map.insert(key.to_string(), value);
            }
        };
        let string = |value: &Option<String>| value.clone().map(Value::String);

        let status = self.status();
        put("id", string(&self.id));
        put("custom_name", string(&self.custom_name));
        put("method_name", Some(Value::String(self.method_name.clone())));
        put(
            "status",
            (status != TestStatus::Pending).then(|| Value::String(status.to_string())),
        );
        put("automation_type", to_value(self.automation_type));
        put("platform_name", to_value(self.platform_name));
        put("platform_version", string(&self.platform_version));
        put("browser_name", string(&self.browser_name));
        put("browser_version", string(&self.browser_version));
        put("start_timestamp", self.start_timestamp.map(Value::from));
        put("end_timestamp", self.end_timestamp.map(Value::from));
        put("timezone", string(&self.timezone));
        put("error", to_value(self.error.as_ref()));
        put("screenshot", string(&self.screenshot));
        put("view", string(&self.view));
        put("code_context", to_value(&self.code_context));
        put("webdriver_client_version", string(&self.webdriver_client_version));
        put("browser_driver_version", string(&self.browser_driver_version));
        put("appium_server_version", string(&self.appium_server_version));
        put("capabilities", self.capabilities.clone().map(Value::Object));
        put("tags", Some(Value::Object(self.tags.clone())));
        put("user_data", Some(Value::Object(self.user_data.clone())));
        put("log", to_value(&self.log));
        Value::Object(map)
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Option<Value> {
    serde_json::to_value(value).ok()
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn check_chars(what: &'static str, text: &str, limit: usize) -> Result<()> {
    let actual = text.chars().count();
    if actual > limit {
        return Err(TaukError::SizeExceeded {
            what,
            limit: limit as u64,
            actual: actual as u64,
        });
    }
    Ok(())
}

impl fmt::Debug for TestCaseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCaseRecord")
            .field("id", &self.id)
            .field("filename", &self.filename)
            .field("method_name", &self.method_name)
            .field("status", &self.status())
            .field("start_timestamp", &self.start_timestamp)
            .field("end_timestamp", &self.end_timestamp)
            .field("automation_type", &self.automation_type)
            .field("has_driver", &self.driver.is_some())
            .finish_non_exhaustive()
    }
}

/// A driver bound to a recorded test.
///
/// Ending the session through [`DriverScope::quit`] captures the final
/// screenshot and view before the driver goes away.
pub struct DriverScope {
    record: SharedRecord,
    driver: Arc<dyn AutomationDriver>,
}

impl DriverScope {
    pub(crate) fn new(record: SharedRecord, driver: Arc<dyn AutomationDriver>) -> Self {
        Self { record, driver }
    }

    pub fn driver(&self) -> &Arc<dyn AutomationDriver> {
        &self.driver
    }

    /// Captures the screen into the record, then quits the driver.
    pub async fn quit(self) -> std::result::Result<(), tauk_proto::DriverError> {
        {
            let mut record = self.record.lock().await;
            capture::capture_screenshot(&mut record, self.driver.as_ref()).await;
            capture::capture_view(&mut record, self.driver.as_ref()).await;
        }
        self.driver.quit().await
    }
}

impl fmt::Debug for DriverScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverScope")
            .field("automation_type", &self.driver.automation_type())
            .finish_non_exhaustive()
    }
}
