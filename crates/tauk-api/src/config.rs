use std::time::Duration;

/// Production endpoint of the reporting service.
pub const DEFAULT_API_URL: &str = "https://www.tauk.com/api/v1";

/// Connection settings for [`TaukApi`](crate::TaukApi).
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_url: String,
    pub api_token: String,
    pub project_id: String,
    /// Version reported to the service; `develop` disables upgrade hints.
    pub client_version: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl ApiConfig {
    /// Create a new configuration with explicit credentials and default timeouts
    pub fn new(api_token: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_token: api_token.into(),
            project_id: project_id.into(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(6),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_client_version(mut self, client_version: impl Into<String>) -> Self {
        self.client_version = client_version.into();
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }
}
