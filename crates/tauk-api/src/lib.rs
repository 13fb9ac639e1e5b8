//! HTTP client for the Tauk reporting service.
//!
//! [`TaukApi`] implements [`tauk_proto::ReportingApi`] over `reqwest`. Every
//! call carries the bearer token, applies connect/read timeouts and retries
//! transient failures a bounded number of times.
//!
//! # Example
//!
//! ```no_run
//! use tauk_api::{ApiConfig, TaukApi};
//! use tauk_proto::{ReportingApi, RunMetadata};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let api = TaukApi::new(ApiConfig::new("token", "project"))?;
//!
//!     let metadata = RunMetadata {
//!         language: "rust".to_string(),
//!         tauk_client_version: "0.9.0".to_string(),
//!         start_timestamp: 1_700_000_000_000,
//!         timezone: "UTC".to_string(),
//!         dst: false,
//!         multi_process_run: false,
//!         host_os_name: "Linux".to_string(),
//!         host_os_version: "6.1".to_string(),
//!     };
//!     let run = api.initialize_run(&metadata, None).await?;
//!     println!("Run: {}", run.run_id);
//!
//!     api.finish_execution(None).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
mod types;

pub use api::{TaukApi, shortened_json};
pub use config::{ApiConfig, DEFAULT_API_URL};
