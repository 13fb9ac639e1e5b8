//! The automation driver capability consumed by artifact capture.
//!
//! Concrete adapters (a WebDriver client, an Appium session, an Espresso
//! bridge) implement [`AutomationDriver`] and report their own
//! [`AutomationType`]. Nothing in Tauk inspects a driver's concrete type.

use crate::error::DriverError;
use crate::types::AutomationType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Name of the native application context exposed by hybrid-app drivers.
pub const NATIVE_CONTEXT: &str = "NATIVE_APP";

/// Session capabilities as reported by the driver.
pub type Capabilities = serde_json::Map<String, serde_json::Value>;

/// Typed lookups on [`Capabilities`].
pub trait CapabilitiesExt {
    /// String value of a top-level capability.
    fn str(&self, key: &str) -> Option<&str>;

    /// String value nested one level down, e.g. `goog:chromeOptions.debuggerAddress`.
    fn nested_str(&self, outer: &str, inner: &str) -> Option<&str>;
}

impl CapabilitiesExt for Capabilities {
    fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(serde_json::Value::as_str)
    }

    fn nested_str(&self, outer: &str, inner: &str) -> Option<&str> {
        self.get(outer)
            .and_then(|v| v.get(inner))
            .and_then(serde_json::Value::as_str)
    }
}

/// One entry of a driver-side log buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub level: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(timestamp: i64, level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level: level.into(),
            message: message.into(),
        }
    }
}

/// A browser or mobile automation session.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// The framework behind this session.
    fn automation_type(&self) -> AutomationType;

    /// Version of the client library driving the session, if known.
    fn client_version(&self) -> Option<String> {
        None
    }

    async fn capabilities(&self) -> Result<Capabilities, DriverError>;

    /// Version of the automation server (e.g. Appium) behind the session.
    async fn server_version(&self) -> Result<Option<String>, DriverError> {
        Ok(None)
    }

    /// Screenshot of the current screen, base64 encoded PNG.
    async fn screenshot_base64(&self) -> Result<String, DriverError>;

    /// Page source (browsers) or view hierarchy (native apps).
    async fn page_source(&self) -> Result<String, DriverError>;

    /// Execution contexts available to the session.
    ///
    /// Drivers without context support return an empty list.
    async fn contexts(&self) -> Result<Vec<String>, DriverError> {
        Ok(Vec::new())
    }

    async fn current_context(&self) -> Result<Option<String>, DriverError> {
        Ok(None)
    }

    async fn switch_context(&self, _name: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("switch_context"))
    }

    /// Entries of the named log buffer, oldest first.
    async fn logs(&self, buffer: &str) -> Result<Vec<LogEntry>, DriverError>;

    /// Ends the session.
    async fn quit(&self) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capability_lookups() {
        let caps: Capabilities = serde_json::from_value(json!({
            "browserName": "chrome",
            "goog:chromeOptions": {"debuggerAddress": "localhost:9222"},
            "acceptInsecureCerts": false
        }))
        .unwrap();

        assert_eq!(caps.str("browserName"), Some("chrome"));
        assert_eq!(caps.str("acceptInsecureCerts"), None);
        assert_eq!(
            caps.nested_str("goog:chromeOptions", "debuggerAddress"),
            Some("localhost:9222")
        );
        assert_eq!(caps.nested_str("moz:firefoxOptions", "debuggerAddress"), None);
    }
}
