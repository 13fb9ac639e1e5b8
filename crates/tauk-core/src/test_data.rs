//! In-memory registry of the test cases recorded by this process.

use crate::error::{Result, TaukError};
use crate::platform;
use crate::test_case::TestCaseRecord;
use serde_json::{Map, Value, json};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tauk_proto::RunMetadata;
use tokio::task::futures::TaskLocalFuture;

/// A record shared between the registry and the code driving the test.
pub type SharedRecord = Arc<tokio::sync::Mutex<TestCaseRecord>>;

tokio::task_local! {
    static CURRENT_TEST: TestHandle;
}

/// Identifies one observed test: its suite file and method name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestHandle {
    pub filename: String,
    pub method_name: String,
}

impl TestHandle {
    pub fn new(filename: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            method_name: method_name.into(),
        }
    }

    /// The test scoped on the current task, if any.
    pub fn current() -> Option<Self> {
        CURRENT_TEST.try_with(Clone::clone).ok()
    }

    /// Runs `future` with this handle as the current test.
    pub fn scope<F: Future>(self, future: F) -> TaskLocalFuture<TestHandle, F> {
        CURRENT_TEST.scope(self, future)
    }
}

#[derive(Debug)]
struct TestEntry {
    method_name: String,
    custom_name: Option<String>,
    /// Cleared once the record has been finished; inactive entries are kept
    /// only when their upload failed.
    active: bool,
    record: SharedRecord,
}

impl TestEntry {
    fn matches(&self, name: &str) -> bool {
        self.method_name == name || self.custom_name.as_deref() == Some(name)
    }
}

/// All test cases of one source file.
#[derive(Debug)]
pub struct TestSuite {
    pub filename: String,
    pub name: Option<String>,
    pub class_name: Option<String>,
    entries: Vec<TestEntry>,
}

impl TestSuite {
    fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            name: None,
            class_name: None,
            entries: Vec::new(),
        }
    }

    fn active(&self, name: &str) -> Option<&TestEntry> {
        self.entries.iter().find(|e| e.active && e.matches(name))
    }

    /// Number of records held, finished ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upload envelope for this suite holding `test_cases`.
    fn document(&self, test_cases: Vec<Value>) -> Value {
        let mut suite = Map::new();
        suite.insert("filename".into(), Value::String(self.filename.clone()));
        if let Some(name) = self.name.as_ref().filter(|n| !n.is_empty()) {
            suite.insert("name".into(), Value::String(name.clone()));
        }
        if let Some(class_name) = self.class_name.as_ref().filter(|n| !n.is_empty()) {
            suite.insert("class_name".into(), Value::String(class_name.clone()));
        }
        suite.insert("test_cases".into(), Value::Array(test_cases));
        json!({ "test_suites": [Value::Object(suite)] })
    }
}

/// Root of everything recorded by this process for the current run.
#[derive(Debug)]
pub struct TestData {
    pub client_version: String,
    pub language: String,
    pub start_timestamp: i64,
    pub timezone: String,
    pub dst: bool,
    suites: Mutex<Vec<TestSuite>>,
}

impl TestData {
    pub fn new(client_version: impl Into<String>) -> Self {
        Self {
            client_version: client_version.into(),
            language: "rust".to_string(),
            start_timestamp: platform::now_millis(),
            timezone: platform::local_timezone(),
            dst: platform::is_dst(),
            suites: Mutex::new(Vec::new()),
        }
    }

    /// Metadata sent when the run is initialized.
    pub fn run_metadata(&self, multi_process_run: bool) -> RunMetadata {
        RunMetadata {
            language: self.language.clone(),
            tauk_client_version: self.client_version.clone(),
            start_timestamp: self.start_timestamp,
            timezone: self.timezone.clone(),
            dst: self.dst,
            multi_process_run,
            host_os_name: platform::host_os_name(),
            host_os_version: platform::host_os_version(),
        }
    }

    fn suites(&self) -> std::sync::MutexGuard<'_, Vec<TestSuite>> {
        self.suites.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `record` in the suite named by its filename.
    ///
    /// Fails if the suite already holds an active record for the same method.
    pub fn add_test_case(&self, record: TestCaseRecord) -> Result<SharedRecord> {
        let filename = record.filename().to_string();
        let method_name = record.method_name().to_string();
        let custom_name = record.custom_name().map(str::to_string);

        let mut suites = self.suites();
        let index = match suites.iter().position(|s| s.filename == filename) {
            Some(index) => index,
            None => {
                suites.push(TestSuite::new(&filename));
                suites.len() - 1
            }
        };
        let suite = &mut suites[index];

        if suite
            .entries
            .iter()
            .any(|e| e.active && e.method_name == method_name)
        {
            return Err(TaukError::DuplicateTestCase {
                filename,
                method_name,
            });
        }

        let shared = Arc::new(tokio::sync::Mutex::new(record));
        suite.entries.push(TestEntry {
            method_name,
            custom_name,
            active: true,
            record: Arc::clone(&shared),
        });
        Ok(shared)
    }

    /// Active record matching `name` as method or custom name.
    pub fn get_test_case(&self, filename: &str, name: &str) -> Option<SharedRecord> {
        self.suites()
            .iter()
            .find(|s| s.filename == filename)
            .and_then(|s| s.active(name))
            .map(|e| Arc::clone(&e.record))
    }

    /// Removes the active record matching `name`. Empty suites are dropped.
    pub fn remove_test_case(&self, filename: &str, name: &str) -> Option<SharedRecord> {
        let mut suites = self.suites();
        let suite_index = suites.iter().position(|s| s.filename == filename)?;
        let suite = &mut suites[suite_index];
        let index = suite
            .entries
            .iter()
            .position(|e| e.active && e.matches(name))?;
        let entry = suite.entries.remove(index);
        if suite.entries.is_empty() {
            suites.remove(suite_index);
        }
        Some(entry.record)
    }

    /// Keeps the record but frees its method name for a later run of the test.
    pub fn mark_finished(&self, filename: &str, name: &str) -> bool {
        let mut suites = self.suites();
        let Some(entry) = suites
            .iter_mut()
            .find(|s| s.filename == filename)
            .and_then(|s| s.entries.iter_mut().find(|e| e.active && e.matches(name)))
        else {
            return false;
        };
        entry.active = false;
        true
    }

    /// Sets the display and class names reported for a suite.
    pub fn set_suite_info(&self, filename: &str, name: Option<String>, class_name: Option<String>) {
        let mut suites = self.suites();
        if let Some(suite) = suites.iter_mut().find(|s| s.filename == filename) {
            if name.is_some() {
                suite.name = name;
            }
            if class_name.is_some() {
                suite.class_name = class_name;
            }
        }
    }

    /// Number of records currently held across all suites.
    pub fn test_case_count(&self) -> usize {
        self.suites().iter().map(TestSuite::len).sum()
    }

    /// Upload document `{"test_suites": [...]}` holding only the given test.
    pub async fn json_for_test(&self, filename: &str, name: &str) -> Option<Value> {
        let record = self.get_test_case(filename, name)?;
        let payload = record.lock().await.to_payload();

        let suites = self.suites();
        let suite = suites.iter().find(|s| s.filename == filename)?;
        Some(suite.document(vec![payload]))
    }
}
