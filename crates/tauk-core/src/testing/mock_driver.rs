//! Mock automation driver with scripted responses and call tracking.

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tauk_proto::{AutomationDriver, AutomationType, Capabilities, DriverError, LogEntry};

/// Driver double that answers from fixed data and records every command.
#[derive(Debug, Clone)]
pub struct MockDriver {
    automation_type: AutomationType,
    state: Arc<Mutex<DriverState>>,
}

#[derive(Debug)]
struct DriverState {
    capabilities: Capabilities,
    server_version: Option<String>,
    screenshot: Option<String>,
    page_source: Option<String>,
    contexts: Vec<String>,
    current_context: Option<String>,
    logs: Vec<LogEntry>,
    commands: Vec<String>,
    quit: bool,
}

impl MockDriver {
    pub fn new(automation_type: AutomationType, capabilities: Capabilities) -> Self {
        Self {
            automation_type,
            state: Arc::new(Mutex::new(DriverState {
                capabilities,
                server_version: None,
                screenshot: Some("iVBORw0KGgo=".to_string()),
                page_source: Some("<html><body>ok</body></html>".to_string()),
                contexts: Vec::new(),
                current_context: None,
                logs: Vec::new(),
                commands: Vec::new(),
                quit: false,
            })),
        }
    }

    /// Chrome on Linux with chromedriver and a debugger address.
    pub fn selenium() -> Self {
        Self::new(
            AutomationType::Selenium,
            capabilities(json!({
                "browserName": "chrome",
                "browserVersion": "120.0.6099.109",
                "platformName": "linux",
                "chrome": {"chromedriverVersion": "120.0.6099.109"},
                "goog:chromeOptions": {"debuggerAddress": "localhost:9222"}
            })),
        )
    }

    /// A native Android app session.
    pub fn appium() -> Self {
        let driver = Self::new(
            AutomationType::Appium,
            capabilities(json!({
                "platformName": "Android",
                "platformVersion": "14",
                "automationName": "UiAutomator2"
            })),
        );
        driver.state().server_version = Some("2.5.1".to_string());
        driver
    }

    /// Exposes `contexts`, starting in `current`.
    pub fn with_contexts(self, contexts: &[&str], current: &str) -> Self {
        {
            let mut state = self.state();
            state.contexts = contexts.iter().map(|c| (*c).to_string()).collect();
            state.current_context = Some(current.to_string());
        }
        self
    }

    pub fn with_logs(self, logs: Vec<LogEntry>) -> Self {
        self.state().logs = logs;
        self
    }

    pub fn failing_screenshot(self) -> Self {
        self.state().screenshot = None;
        self
    }

    pub fn failing_page_source(self) -> Self {
        self.state().page_source = None;
        self
    }

    fn state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, command: &str) {
        self.state().commands.push(command.to_string());
    }

    /// Every command issued, in order; context switches include the target.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    fn count(&self, command: &str) -> usize {
        self.state().commands.iter().filter(|c| *c == command).count()
    }

    pub fn screenshot_calls(&self) -> usize {
        self.count("screenshot")
    }

    pub fn page_source_calls(&self) -> usize {
        self.count("page_source")
    }

    pub fn log_calls(&self) -> usize {
        self.count("logs")
    }

    pub fn quit_called(&self) -> bool {
        self.state().quit
    }

    pub fn current_context_name(&self) -> Option<String> {
        self.state().current_context.clone()
    }
}

fn capabilities(value: serde_json::Value) -> Capabilities {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Capabilities::new(),
    }
}

#[async_trait]
impl AutomationDriver for MockDriver {
    fn automation_type(&self) -> AutomationType {
        self.automation_type
    }

    fn client_version(&self) -> Option<String> {
        Some("4.16.0".to_string())
    }

    async fn capabilities(&self) -> Result<Capabilities, DriverError> {
        self.record("capabilities");
        Ok(self.state().capabilities.clone())
    }

    async fn server_version(&self) -> Result<Option<String>, DriverError> {
        Ok(self.state().server_version.clone())
    }

    async fn screenshot_base64(&self) -> Result<String, DriverError> {
        self.record("screenshot");
        self.state()
            .screenshot
            .clone()
            .ok_or_else(|| DriverError::command("screenshot", "no screen available"))
    }

    async fn page_source(&self) -> Result<String, DriverError> {
        self.record("page_source");
        let state = self.state();
        let source = state
            .page_source
            .clone()
            .ok_or_else(|| DriverError::command("page_source", "no page available"))?;
        Ok(match &state.current_context {
            Some(context) => format!("<!-- {} -->{}", context, source),
            None => source,
        })
    }

    async fn contexts(&self) -> Result<Vec<String>, DriverError> {
        Ok(self.state().contexts.clone())
    }

    async fn current_context(&self) -> Result<Option<String>, DriverError> {
        Ok(self.state().current_context.clone())
    }

    async fn switch_context(&self, name: &str) -> Result<(), DriverError> {
        let mut state = self.state();
        if !state.contexts.iter().any(|c| c == name) {
            return Err(DriverError::command("switch_context", format!("no context {}", name)));
        }
        state.commands.push(format!("switch_context:{}", name));
        state.current_context = Some(name.to_string());
        Ok(())
    }

    async fn logs(&self, _buffer: &str) -> Result<Vec<LogEntry>, DriverError> {
        self.record("logs");
        Ok(self.state().logs.clone())
    }

    async fn quit(&self) -> Result<(), DriverError> {
        let mut state = self.state();
        if state.quit {
            return Err(DriverError::SessionClosed);
        }
        state.commands.push("quit".to_string());
        state.quit = true;
        Ok(())
    }
}
