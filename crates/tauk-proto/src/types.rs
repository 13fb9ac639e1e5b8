//! Enumerations shared between the in-memory records and the wire format.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a single test invocation.
///
/// `Pending` only exists in memory; it is never sent to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    #[default]
    Pending,
    Passed,
    Failed,
    Excluded,
}

impl TestStatus {
    /// Returns true once the status can no longer change.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Excluded => "excluded",
        };
        f.write_str(s)
    }
}

/// The automation framework driving the device or browser.
///
/// Supplied explicitly by the driver adapter rather than inferred from
/// the driver's runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutomationType {
    Selenium,
    Appium,
    Espresso,
    #[serde(rename = "XCTest")]
    XcTest,
}

/// Platform reported by the driver capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformName {
    Android,
    #[serde(rename = "iOS")]
    Ios,
    Windows,
    Linux,
    #[serde(rename = "macOS")]
    Macos,
    Unknown,
}

impl PlatformName {
    /// Resolves a capability value such as `"ANDROID"` or `"mac os x"`.
    pub fn resolve(value: &str) -> Self {
        let lowered = value.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "android" => Self::Android,
            "ios" | "iphone" | "ipad" | "tvos" => Self::Ios,
            "windows" | "win" | "win10" | "win11" => Self::Windows,
            "linux" => Self::Linux,
            "mac" | "macos" | "mac os x" | "os x" | "darwin" => Self::Macos,
            _ if lowered.starts_with("windows") => Self::Windows,
            _ if lowered.starts_with("mac") => Self::Macos,
            _ => Self::Unknown,
        }
    }
}

/// Discriminator sent alongside uploaded attachment content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    AppiumLog,
    ConsoleLogs,
    ExceptionLogs,
    BrowserLogs,
    NetworkLogs,
    Screenshot,
    Video,
    Log,
}

impl AttachmentKind {
    /// Value of the `Tauk-Attachment-Type` header.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AppiumLog => "appium_log",
            Self::ConsoleLogs => "console_logs",
            Self::ExceptionLogs => "exception_logs",
            Self::BrowserLogs => "browser_logs",
            Self::NetworkLogs => "network_logs",
            Self::Screenshot => "screenshot",
            Self::Video => "video",
            Self::Log => "log",
        }
    }

    /// Maps a file written by the companion to its attachment kind.
    ///
    /// The companion names its files after the CDP domain they came from,
    /// e.g. `console_logs.json` or `exception_logs-2.json`.
    pub fn resolve_companion_log(file_name: &str) -> Self {
        let stem = file_name
            .rsplit_once('.')
            .map_or(file_name, |(stem, _)| stem)
            .to_ascii_lowercase();
        if stem.starts_with("console") {
            Self::ConsoleLogs
        } else if stem.starts_with("exception") {
            Self::ExceptionLogs
        } else if stem.starts_with("browser") {
            Self::BrowserLogs
        } else if stem.starts_with("network") {
            Self::NetworkLogs
        } else {
            Self::Log
        }
    }

    /// Attachments produced by the companion are removed after upload.
    pub fn is_companion_attachment(self) -> bool {
        matches!(
            self,
            Self::ConsoleLogs | Self::ExceptionLogs | Self::BrowserLogs | Self::NetworkLogs
        )
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TestStatus::Excluded).unwrap(),
            "\"excluded\""
        );
        assert!(!TestStatus::Pending.is_terminal());
        assert!(TestStatus::Failed.is_terminal());
    }

    #[test]
    fn test_platform_resolution() {
        assert_eq!(PlatformName::resolve("ANDROID"), PlatformName::Android);
        assert_eq!(PlatformName::resolve("iOS"), PlatformName::Ios);
        assert_eq!(PlatformName::resolve("mac os x"), PlatformName::Macos);
        assert_eq!(PlatformName::resolve("Windows 11"), PlatformName::Windows);
        assert_eq!(PlatformName::resolve(""), PlatformName::Unknown);
    }

    #[test]
    fn test_automation_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&AutomationType::XcTest).unwrap(),
            "\"XCTest\""
        );
        assert_eq!(
            serde_json::to_string(&AutomationType::Appium).unwrap(),
            "\"Appium\""
        );
    }

    #[test]
    fn test_companion_log_resolution() {
        assert_eq!(
            AttachmentKind::resolve_companion_log("console_logs.json"),
            AttachmentKind::ConsoleLogs
        );
        assert_eq!(
            AttachmentKind::resolve_companion_log("exception_logs-2.json"),
            AttachmentKind::ExceptionLogs
        );
        assert_eq!(
            AttachmentKind::resolve_companion_log("something.txt"),
            AttachmentKind::Log
        );
        assert!(AttachmentKind::BrowserLogs.is_companion_attachment());
        assert!(!AttachmentKind::Screenshot.is_companion_attachment());
    }
}
