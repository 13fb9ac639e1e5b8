//! Diagnostic logging for the SDK itself.
//!
//! Events go to stderr and to a rotated file under `$TAUK_HOME/logs`. ERROR
//! events are additionally appended to the execution's error log, which is
//! shipped to the reporting service when the run finishes.

mod error_log;
mod log_rotation;

pub use error_log::{
    ERROR_LOG_PREFIX, ErrorLogEntry, ErrorLogLayer, ErrorLogSink, error_log_file_name,
};
pub use log_rotation::{create_log_file, rotate_logs};

use crate::config::TaukConfig;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Process-wide error log sink shared by the layer and the execution context.
static ERROR_LOG: OnceLock<ErrorLogSink> = OnceLock::new();

/// Path of the log file created by the first successful [`init`].
static LOG_FILE: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Returns the sink the installed [`ErrorLogLayer`] writes to.
pub fn error_log_sink() -> &'static ErrorLogSink {
    ERROR_LOG.get_or_init(ErrorLogSink::new)
}

/// Filter directive for the SDK crates at `level`, other crates at `warn`.
pub fn filter_directive(config: &TaukConfig) -> String {
    let level = config.log_level.directive();
    format!("warn,tauk_core={level},tauk_api={level}")
}

/// Installs the global subscriber.
///
/// Safe to call more than once; only the first call has an effect. Returns
/// the SDK log file when one could be created.
pub fn init(config: &TaukConfig) -> Option<PathBuf> {
    LOG_FILE
        .get_or_init(|| {
            let filter = EnvFilter::new(filter_directive(config));
            let logs_dir = config.home_dir.join("logs");

            let (file_layer, log_path, file_error) = match create_log_file(&logs_dir) {
                Ok((file, path)) => (
                    Some(
                        tracing_subscriber::fmt::layer()
                            .with_writer(Mutex::new(file))
                            .with_ansi(false),
                    ),
                    Some(path),
                    None,
                ),
                Err(e) => (None, None, Some(e)),
            };

            let installed = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(file_layer)
                .with(ErrorLogLayer::new(error_log_sink().clone()))
                .try_init()
                .is_ok();

            if installed {
                tracing::debug!("SDK logging initialized at {}", config.log_level);
            }
            if let Some(e) = file_error {
                tracing::warn!("Could not create log file in {}: {}", logs_dir.display(), e);
            }
            log_path
        })
        .clone()
}
