use crate::test_data::TestHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{Level, Subscriber};
use tracing_subscriber::Layer;

/// Prefix of per-process error log files inside an execution directory.
pub const ERROR_LOG_PREFIX: &str = "tauk-errors";

/// File name of this process's error log.
pub fn error_log_file_name() -> String {
    format!("{}-{}.jsonl", ERROR_LOG_PREFIX, std::process::id())
}

/// One line of the error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suite: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
}

#[derive(Debug)]
struct SinkState {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

/// Destination of the error log.
///
/// Starts closed; the execution context opens it once its directory exists
/// and closes it during teardown before shipping the file.
#[derive(Debug, Clone, Default)]
pub struct ErrorLogSink {
    state: Arc<Mutex<Option<SinkState>>>,
}

impl ErrorLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts appending to this process's error log in `dir`.
    pub fn open(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(error_log_file_name());
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = Some(SinkState {
            path: path.clone(),
            writer: BufWriter::new(file),
            written: 0,
        });
        Ok(path)
    }

    /// Flushes and detaches the file, returning its path if it was open.
    pub fn close(&self) -> Option<PathBuf> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.take().map(|mut sink| {
            let _ = sink.writer.flush();
            sink.path
        })
    }

    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of entries written since the sink was opened.
    pub fn written(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |sink| sink.written)
    }

    fn write(&self, entry: &ErrorLogEntry) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sink) = state.as_mut() else {
            return;
        };
        if let Ok(json) = serde_json::to_string(entry) {
            let _ = writeln!(sink.writer, "{}", json);
            let _ = sink.writer.flush();
            sink.written += 1;
        }
    }
}

/// Layer that appends ERROR events to the execution's error log.
///
/// Each line is tagged with the suite and test running in the current task.
pub struct ErrorLogLayer {
    sink: ErrorLogSink,
}

impl ErrorLogLayer {
    pub fn new(sink: ErrorLogSink) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for ErrorLogLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let metadata = event.metadata();
        if *metadata.level() != Level::ERROR || !self.sink.is_open() {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let current = TestHandle::current();
        let entry = ErrorLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor.message,
            fields: serde_json::to_value(&visitor.fields).unwrap_or(serde_json::Value::Null),
            suite: current.as_ref().map(|h| h.filename.clone()),
            test: current.map(|h| h.method_name),
        };

        self.sink.write(&entry);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: HashMap<String, serde_json::Value>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value).trim_matches('"').to_string();
        } else {
            self.fields.insert(
                field.name().to_string(),
                serde_json::Value::String(format!("{:?}", value)),
            );
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(
                field.name().to_string(),
                serde_json::Value::String(value.to_string()),
            );
        }
    }
}
