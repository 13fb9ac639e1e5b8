//! Best-effort capture of driver artifacts into a [`TestCaseRecord`].
//!
//! Every function here logs driver failures and returns normally; losing
//! one artifact must not cost the rest of the report. Each capture is a
//! no-op once its field is populated.

use crate::test_case::TestCaseRecord;
use serde::{Deserialize, Serialize};
use tauk_proto::{
    AutomationDriver, AutomationType, Capabilities, CapabilitiesExt, LogEntry, NATIVE_CONTEXT,
    PlatformName,
};
use tracing::{debug, error, warn};

/// Log buffer holding the Appium server log.
pub const APPIUM_LOG_BUFFER: &str = "server";

/// Entries kept from the end of the server log.
const LOG_TAIL: usize = 50;
/// Most recent entries skipped; they describe the log request itself.
const LOG_SKIP_RECENT: usize = 5;

/// One parsed line of the Appium server log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppiumLogEntry {
    pub timestamp: i64,
    pub level: String,
    /// Bracketed event type such as `HTTP` or `W3C`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub message: String,
}

/// Driver facts recorded when a driver is bound to a test.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverDescription {
    pub automation_type: Option<AutomationType>,
    pub capabilities: Option<Capabilities>,
    pub platform_name: Option<PlatformName>,
    pub platform_version: Option<String>,
    pub browser_name: Option<String>,
    pub browser_version: Option<String>,
    pub webdriver_client_version: Option<String>,
    pub browser_driver_version: Option<String>,
    pub appium_server_version: Option<String>,
    pub browser_debugger_address: Option<String>,
}

/// Reads capabilities and versions from the driver.
pub async fn describe_driver(driver: &dyn AutomationDriver) -> DriverDescription {
    let automation_type = driver.automation_type();
    let mut description = DriverDescription {
        automation_type: Some(automation_type),
        webdriver_client_version: driver.client_version(),
        ..DriverDescription::default()
    };

    let capabilities = match driver.capabilities().await {
        Ok(capabilities) => capabilities,
        Err(e) => {
            error!(error = %e, "An issue occurred while reading driver capabilities");
            return description;
        }
    };

    let platform = if automation_type == AutomationType::Appium {
        capabilities
            .str("platform")
            .or_else(|| capabilities.str("platformName"))
    } else {
        capabilities.str("platformName")
    };
    description.platform_name = Some(PlatformName::resolve(platform.unwrap_or_default()));
    description.platform_version = non_empty(capabilities.str("platformVersion"));
    description.browser_name = non_empty(capabilities.str("browserName"));
    description.browser_version = non_empty(capabilities.str("browserVersion"));
    description.browser_driver_version = browser_driver_version(&capabilities);
    description.browser_debugger_address = browser_debugger_address(&capabilities);

    if automation_type == AutomationType::Appium {
        match driver.server_version().await {
            Ok(version) => description.appium_server_version = version,
            Err(e) => debug!(error = %e, "Could not read Appium server version"),
        }
    }

    description.capabilities = Some(capabilities);
    description
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// Version of chromedriver, geckodriver or msedgedriver for the session.
pub fn browser_driver_version(capabilities: &Capabilities) -> Option<String> {
    match capabilities.str("browserName")? {
        "chrome" => capabilities.nested_str("chrome", "chromedriverVersion"),
        "firefox" => capabilities.str("moz:geckodriverVersion"),
        "msedge" => capabilities.nested_str("msedge", "msedgedriverVersion"),
        _ => None,
    }
    .map(str::to_string)
}

/// Address of the browser's debug-protocol endpoint, if exposed.
pub fn browser_debugger_address(capabilities: &Capabilities) -> Option<String> {
    match capabilities.str("browserName")? {
        "chrome" => capabilities.nested_str("goog:chromeOptions", "debuggerAddress"),
        "firefox" => capabilities.str("moz:debuggerAddress"),
        "msedge" => capabilities.nested_str("ms:edgeOptions", "debuggerAddress"),
        _ => None,
    }
    .map(str::to_string)
}

pub async fn capture_screenshot(record: &mut TestCaseRecord, driver: &dyn AutomationDriver) {
    if record.screenshot().is_some() {
        return;
    }
    match driver.screenshot_base64().await {
        Ok(screenshot) => record.set_screenshot(screenshot),
        Err(e) => error!(error = %e, "An issue occurred while trying to take a screenshot"),
    }
}

/// Captures the page source or view hierarchy.
///
/// Hybrid apps sitting in a web context are switched to the native context
/// first and always switched back afterwards, even when capture fails.
pub async fn capture_view(record: &mut TestCaseRecord, driver: &dyn AutomationDriver) {
    if record.view().is_some() {
        return;
    }

    let original_context = switch_to_native(driver).await;
    let result = driver.page_source().await;

    if let Some(context) = original_context
        && let Err(e) = driver.switch_context(&context).await
    {
        error!(error = %e, "Failed to switch back to context {}", context);
    }

    match result {
        Ok(view) => record.set_view(view),
        Err(e) => error!(error = %e, "An issue occurred while capturing view hierarchy"),
    }
}

/// Switches to the native context, returning the context to restore.
async fn switch_to_native(driver: &dyn AutomationDriver) -> Option<String> {
    let contexts = match driver.contexts().await {
        Ok(contexts) => contexts,
        Err(e) => {
            debug!(error = %e, "Could not list driver contexts");
            return None;
        }
    };
    if contexts.len() < 2 || !contexts.iter().any(|c| c == NATIVE_CONTEXT) {
        return None;
    }

    let current = match driver.current_context().await {
        Ok(Some(current)) if current != NATIVE_CONTEXT => current,
        Ok(_) => return None,
        Err(e) => {
            debug!(error = %e, "Could not read current driver context");
            return None;
        }
    };

    match driver.switch_context(NATIVE_CONTEXT).await {
        Ok(()) => Some(current),
        Err(e) => {
            warn!(error = %e, "Could not switch to {} to capture the view", NATIVE_CONTEXT);
            None
        }
    }
}

/// Captures the tail of the Appium server log. Other drivers are skipped.
pub async fn capture_logs(record: &mut TestCaseRecord, driver: &dyn AutomationDriver) {
    if record.automation_type() != Some(AutomationType::Appium) || !record.log().is_empty() {
        return;
    }
    match driver.logs(APPIUM_LOG_BUFFER).await {
        Ok(entries) => record.set_log(log_tail(&entries).iter().map(parse_log_entry).collect()),
        Err(e) => error!(error = %e, "An issue occurred while requesting the Appium server logs"),
    }
}

/// The last 50 entries before the 5 most recent ones.
pub fn log_tail(entries: &[LogEntry]) -> &[LogEntry] {
    let end = entries.len().saturating_sub(LOG_SKIP_RECENT);
    let start = entries.len().saturating_sub(LOG_TAIL + LOG_SKIP_RECENT);
    &entries[start..end]
}

/// Splits `"[HTTP] --> GET /status"` into its event type and message.
pub fn parse_log_entry(entry: &LogEntry) -> AppiumLogEntry {
    let plain = strip_ansi_escapes::strip_str(&entry.message);
    let parts: Vec<&str> = plain.splitn(3, ['[', ']']).collect();

    let (event_type, message) = match parts.as_slice() {
        [_, event_type, message] => ((*event_type).to_string(), message.trim().to_string()),
        _ => (String::new(), plain.trim().to_string()),
    };

    AppiumLogEntry {
        timestamp: entry.timestamp,
        level: entry.level.clone(),
        event_type,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn caps(value: serde_json::Value) -> Capabilities {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_log_entry_strips_ansi_and_splits_type() {
        let entry = LogEntry::new(
            1_700_000_000_000,
            "INFO",
            "\u{1b}[35m[HTTP]\u{1b}[39m --> GET /wd/hub/status",
        );

        let parsed = parse_log_entry(&entry);

        assert_eq!(parsed.event_type, "HTTP");
        assert_eq!(parsed.message, "--> GET /wd/hub/status");
        assert_eq!(parsed.level, "INFO");
        assert_eq!(parsed.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_parse_log_entry_without_brackets() {
        let entry = LogEntry::new(1, "WARN", "  plain message  ");
        let parsed = parse_log_entry(&entry);

        assert_eq!(parsed.event_type, "");
        assert_eq!(parsed.message, "plain message");
    }

    #[test]
    fn test_log_tail_bounds() {
        let entries: Vec<LogEntry> = (0..100)
            .map(|i| LogEntry::new(i, "INFO", format!("[X] {}", i)))
            .collect();

        let tail = log_tail(&entries);
        assert_eq!(tail.len(), 50);
        assert_eq!(tail.first().unwrap().timestamp, 45);
        assert_eq!(tail.last().unwrap().timestamp, 94);

        assert_eq!(log_tail(&entries[..20]).len(), 15);
        assert!(log_tail(&entries[..3]).is_empty());
    }

    #[test]
    fn test_browser_driver_version_per_browser() {
        let chrome = caps(json!({
            "browserName": "chrome",
            "chrome": {"chromedriverVersion": "120.0.6099.109"}
        }));
        let firefox = caps(json!({"browserName": "firefox", "moz:geckodriverVersion": "0.34.0"}));
        let safari = caps(json!({"browserName": "safari"}));

        assert_eq!(
            browser_driver_version(&chrome).as_deref(),
            Some("120.0.6099.109")
        );
        assert_eq!(browser_driver_version(&firefox).as_deref(), Some("0.34.0"));
        assert_eq!(browser_driver_version(&safari), None);
    }

    #[test]
    fn test_browser_debugger_address_per_browser() {
        let edge = caps(json!({
            "browserName": "msedge",
            "ms:edgeOptions": {"debuggerAddress": "localhost:9333"}
        }));
        let firefox = caps(json!({"browserName": "firefox", "moz:debuggerAddress": "127.0.0.1:9444"}));

        assert_eq!(
            browser_debugger_address(&edge).as_deref(),
            Some("localhost:9333")
        );
        assert_eq!(
            browser_debugger_address(&firefox).as_deref(),
            Some("127.0.0.1:9444")
        );
        assert_eq!(browser_debugger_address(&caps(json!({}))), None);
    }
}
