use serde::{Deserialize, Serialize};

/// Browser debug-protocol capture settings posted to the companion when a
/// page is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionConfig {
    pub runtime: RuntimeCapture,
    pub log: LogCapture,
    pub network: NetworkCapture,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCapture {
    pub console_logs: LeveledCapture,
    pub exception_logs: FilteredCapture,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogCapture {
    pub browser_logs: LeveledCapture,
}

/// Network capture is not configurable yet; the companion expects `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCapture {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeveledCapture {
    pub enabled: bool,
    pub level: String,
    pub filters: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredCapture {
    pub enabled: bool,
    pub filters: String,
}

impl Default for LeveledCapture {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "error".to_string(),
            filters: String::new(),
        }
    }
}

impl Default for FilteredCapture {
    fn default() -> Self {
        Self {
            enabled: true,
            filters: String::new(),
        }
    }
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeCapture {
                console_logs: LeveledCapture::default(),
                exception_logs: FilteredCapture::default(),
            },
            log: LogCapture {
                browser_logs: LeveledCapture::default(),
            },
            network: NetworkCapture::default(),
        }
    }
}

impl CompanionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Console messages at or above `level` (e.g. `"error"`, `"warning"`).
    pub fn capture_console_logs(mut self, enabled: bool, level: impl Into<String>) -> Self {
        self.runtime.console_logs.enabled = enabled;
        self.runtime.console_logs.level = level.into();
        self
    }

    pub fn capture_browser_logs(mut self, enabled: bool, level: impl Into<String>) -> Self {
        self.log.browser_logs.enabled = enabled;
        self.log.browser_logs.level = level.into();
        self
    }

    pub fn capture_uncaught_exceptions(mut self, enabled: bool) -> Self {
        self.runtime.exception_logs.enabled = enabled;
        self
    }

    /// Whether any debug-protocol capture is switched on.
    pub fn is_cdp_capture_enabled(&self) -> bool {
        self.runtime.console_logs.enabled
            || self.runtime.exception_logs.enabled
            || self.log.browser_logs.enabled
    }
}
