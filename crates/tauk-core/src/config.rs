//! SDK configuration.
//!
//! Values come either from explicit construction or from `TAUK_*`
//! environment variables (with an optional `.env` file).

use crate::companion::CompanionConfig;
use crate::error::{Result, TaukError};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const ENV_API_TOKEN: &str = "TAUK_API_TOKEN";
pub const ENV_PROJECT_ID: &str = "TAUK_PROJECT_ID";
pub const ENV_MULTI_PROCESS: &str = "TAUK_MULTI_PROCESS";
pub const ENV_API_URL: &str = "TAUK_API_URL";
pub const ENV_HOME: &str = "TAUK_HOME";
pub const ENV_EXEC_DIR: &str = "TAUK_EXEC_DIR";
pub const ENV_COMPANION_EXECUTABLE: &str = "TAUK_COMPANION_EXECUTABLE";
pub const ENV_LOG_LEVEL: &str = "TAUK_LOG_LEVEL";

const DEFAULT_COMPANION_EXECUTABLE: &str = "tauk-companion";

/// Verbosity accepted by `TAUK_LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// `tracing` filter directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = TaukError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(TaukError::InvalidConfig {
                field: ENV_LOG_LEVEL,
                reason: format!("unknown log level '{}'", other),
            }),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct TaukConfig {
    pub api_token: String,
    pub project_id: String,
    /// Share one run between several processes through the run file.
    pub multi_process: bool,
    pub api_url: String,
    /// Root for execution directories and SDK logs.
    pub home_dir: PathBuf,
    /// Execution directory inherited from a parent process.
    pub exec_dir: Option<PathBuf>,
    pub companion_executable: PathBuf,
    pub log_level: LogLevel,
    /// Delete the execution directory on teardown.
    pub cleanup_exec_context: bool,
    pub companion: Option<CompanionConfig>,
    pub client_version: String,
}

impl TaukConfig {
    /// Create a new configuration with explicit credentials
    pub fn new(api_token: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            api_token: api_token.into(),
            project_id: project_id.into(),
            multi_process: false,
            api_url: tauk_api::DEFAULT_API_URL.to_string(),
            home_dir: default_home_dir(),
            exec_dir: None,
            companion_executable: PathBuf::from(DEFAULT_COMPANION_EXECUTABLE),
            log_level: LogLevel::default(),
            cleanup_exec_context: true,
            companion: None,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Try to load .env file if it exists (ignore if it doesn't)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let multi_process = match get(ENV_MULTI_PROCESS) {
            Some(value) => parse_bool(ENV_MULTI_PROCESS, &value)?,
            None => false,
        };

        let mut config = Self::new(
            get(ENV_API_TOKEN).unwrap_or_default(),
            get(ENV_PROJECT_ID).unwrap_or_default(),
        );
        config.multi_process = multi_process;

        if let Some(url) = get(ENV_API_URL) {
            config = config.with_api_url(url);
        }
        if let Some(home) = get(ENV_HOME) {
            config.home_dir = PathBuf::from(home);
        }
        config.exec_dir = get(ENV_EXEC_DIR).map(PathBuf::from);
        if let Some(executable) = get(ENV_COMPANION_EXECUTABLE) {
            config.companion_executable = PathBuf::from(executable);
        }
        if let Some(level) = get(ENV_LOG_LEVEL) {
            config.log_level = level.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_multi_process(mut self, multi_process: bool) -> Self {
        self.multi_process = multi_process;
        self
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_home_dir(mut self, home_dir: impl Into<PathBuf>) -> Self {
        self.home_dir = home_dir.into();
        self
    }

    pub fn with_exec_dir(mut self, exec_dir: impl Into<PathBuf>) -> Self {
        self.exec_dir = Some(exec_dir.into());
        self
    }

    pub fn with_companion(mut self, companion: CompanionConfig) -> Self {
        self.companion = Some(companion);
        self
    }

    pub fn with_companion_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.companion_executable = executable.into();
        self
    }

    pub fn with_cleanup(mut self, cleanup_exec_context: bool) -> Self {
        self.cleanup_exec_context = cleanup_exec_context;
        self
    }

    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = log_level;
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_token.trim().is_empty() && !self.project_id.trim().is_empty()
    }

    /// Single-process runs need credentials up front; a multi-process
    /// child may pick them up from the shared run file instead.
    pub fn validate(&self) -> Result<()> {
        if !self.multi_process && !self.has_credentials() {
            return Err(TaukError::Config(format!(
                "{} and {} must be set",
                ENV_API_TOKEN, ENV_PROJECT_ID
            )));
        }
        if self.api_url.is_empty() {
            return Err(TaukError::InvalidConfig {
                field: "api_url",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(env::temp_dir)
        .join(".tauk")
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(TaukError::InvalidConfig {
            field,
            reason: format!("expected true or false, got '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_reads_credentials_and_defaults() {
        let config = TaukConfig::from_lookup(lookup(&[
            (ENV_API_TOKEN, "token"),
            (ENV_PROJECT_ID, "project"),
        ]))
        .unwrap();

        assert_eq!(config.api_token, "token");
        assert_eq!(config.project_id, "project");
        assert!(!config.multi_process);
        assert_eq!(config.api_url, tauk_api::DEFAULT_API_URL);
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.cleanup_exec_context);
        assert!(config.home_dir.ends_with(".tauk"));
    }

    #[test]
    fn test_single_process_requires_credentials() {
        let err = TaukConfig::from_lookup(lookup(&[(ENV_API_TOKEN, "token")])).unwrap_err();
        assert!(matches!(err, TaukError::Config(_)));
    }

    #[test]
    fn test_multi_process_allows_missing_credentials() {
        let config = TaukConfig::from_lookup(lookup(&[(ENV_MULTI_PROCESS, "TRUE")])).unwrap();
        assert!(config.multi_process);
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_invalid_multi_process_flag_is_rejected() {
        let err = TaukConfig::from_lookup(lookup(&[
            (ENV_API_TOKEN, "token"),
            (ENV_PROJECT_ID, "project"),
            (ENV_MULTI_PROCESS, "sometimes"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            TaukError::InvalidConfig {
                field: ENV_MULTI_PROCESS,
                ..
            }
        ));
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = TaukConfig::from_lookup(lookup(&[
            (ENV_API_TOKEN, "token"),
            (ENV_PROJECT_ID, "project"),
            (ENV_API_URL, "http://localhost:9000/api/v1/"),
            (ENV_HOME, "/var/tmp/tauk"),
            (ENV_EXEC_DIR, "/var/tmp/tauk/exec/abc/42"),
            (ENV_COMPANION_EXECUTABLE, "/opt/tauk/companion"),
            (ENV_LOG_LEVEL, "warning"),
        ]))
        .unwrap();

        assert_eq!(config.api_url, "http://localhost:9000/api/v1");
        assert_eq!(config.home_dir, PathBuf::from("/var/tmp/tauk"));
        assert_eq!(
            config.exec_dir,
            Some(PathBuf::from("/var/tmp/tauk/exec/abc/42"))
        );
        assert_eq!(
            config.companion_executable,
            PathBuf::from("/opt/tauk/companion")
        );
        assert_eq!(config.log_level, LogLevel::Warning);
    }

    #[test]
    fn test_log_level_directives() {
        assert_eq!("CRITICAL".parse::<LogLevel>().unwrap().directive(), "error");
        assert_eq!("WARNING".parse::<LogLevel>().unwrap().directive(), "warn");
        assert_eq!("debug".parse::<LogLevel>().unwrap().directive(), "debug");
        assert!("verbose".parse::<LogLevel>().is_err());
    }
}
