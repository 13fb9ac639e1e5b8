//! Attributes a test failure to a line of the test's own source file.
//!
//! An [`ExceptionInfo`] carries the failure's type, message and stack frames.
//! [`attribute`] picks the outermost frame that belongs to the test file and
//! [`code_context`] cuts a window of source lines around it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{LazyLock, Once};

/// Lines shown before the failing line.
pub const CONTEXT_LINES_BEFORE: usize = 9;
/// Lines shown after the failing line.
pub const CONTEXT_LINES_AFTER: usize = 10;

/// Error type reported for panics.
pub const PANIC_ERROR_TYPE: &str = "Panic";

/// One frame of a captured stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub file: String,
    pub line: Option<u32>,
    pub function: Option<String>,
    /// Source text of the line, if the frame carries it.
    pub code: Option<String>,
}

impl StackFrame {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line: Some(line),
            function: None,
            code: None,
        }
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// A failure raised by a test, ready for attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub error_type: String,
    pub message: String,
    /// Outermost frame first.
    pub frames: Vec<StackFrame>,
}

impl ExceptionInfo {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            frames: Vec::new(),
        }
    }

    pub fn with_frame(mut self, frame: StackFrame) -> Self {
        self.frames.push(frame);
        self
    }

    pub fn with_frames(mut self, frames: Vec<StackFrame>) -> Self {
        self.frames = frames;
        self
    }

    /// Describes an error returned by a test body.
    ///
    /// An `anyhow::Error` contributes the frames of its captured backtrace;
    /// other errors have none. anyhow only captures one when
    /// `RUST_BACKTRACE` or `RUST_LIB_BACKTRACE` is enabled, so without those
    /// the result carries no frames and no line can be attributed.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: fmt::Display + fmt::Debug + 'static,
    {
        let any: &dyn Any = error;
        if let Some(err) = any.downcast_ref::<anyhow::Error>() {
            let frames =
                frames_below_catch_point(parse_backtrace(&err.backtrace().to_string()));
            return Self::new(short_type_name(std::any::type_name::<E>()), err.to_string())
                .with_frames(frames);
        }

        Self::new(
            short_type_name(std::any::type_name::<E>()),
            error.to_string(),
        )
    }

    /// Describes a panic caught from a test body.
    ///
    /// Uses the location and backtrace recorded by [`install_panic_hook`]
    /// on this thread when available.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = panic_message(payload);
        let mut info = Self::new(PANIC_ERROR_TYPE, message);

        if let Some(capture) = take_panic_capture() {
            info.frames = frames_below_catch_point(parse_backtrace(&capture.backtrace));
            if let Some((file, line)) = capture.location {
                let known = info
                    .frames
                    .iter()
                    .any(|f| f.line == Some(line) && paths_match(&f.file, &file));
                if !known {
                    info.frames.push(StackFrame::new(file, line));
                }
            }
        }
        info
    }
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

/// Where a failure happened, as sent to the reporting service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub error_type: String,
    #[serde(rename = "error_msg")]
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoked_func: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_executed: Option<String>,
}

/// One line of the code context window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLine {
    pub line_number: u32,
    pub line_code: String,
}

/// Finds the frame in `source_file` and describes the failure from it.
///
/// Returns the detail together with the failing line. When no frame
/// belongs to the test file the location fields stay empty.
pub fn attribute(source_file: &str, exception: &ExceptionInfo) -> (ErrorDetail, Option<u32>) {
    let frame = exception
        .frames
        .iter()
        .find(|frame| paths_match(&frame.file, source_file));

    let line_number = frame.and_then(|f| f.line);
    let code_executed = frame.and_then(|f| {
        f.code
            .clone()
            .or_else(|| line_number.and_then(|line| read_source_line(source_file, line)))
    });

    let detail = ErrorDetail {
        error_type: exception.error_type.clone(),
        error_message: exception.message.clone(),
        line_number,
        invoked_func: frame.and_then(|f| f.function.as_deref().map(simple_function_name)),
        code_executed,
    };
    (detail, line_number)
}

/// Source lines of a test, numbered from `first_line`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceListing {
    pub first_line: u32,
    pub lines: Vec<String>,
}

impl SourceListing {
    pub fn from_text(text: &str) -> Self {
        Self {
            first_line: 1,
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::from_text(&fs::read_to_string(path)?))
    }

    /// The function whose signature starts at `start_line`, up to its
    /// closing brace.
    pub fn function_at(text: &str, start_line: u32) -> Option<Self> {
        let lines: Vec<&str> = text.lines().collect();
        let start = (start_line as usize).checked_sub(1)?;
        if start >= lines.len() {
            return None;
        }

        let mut depth: i32 = 0;
        let mut opened = false;
        let mut end = lines.len() - 1;
        'scan: for (index, line) in lines.iter().enumerate().skip(start) {
            for c in code_part(line).chars() {
                match c {
                    '{' => {
                        depth += 1;
                        opened = true;
                    }
                    '}' => depth -= 1,
                    _ => {}
                }
                if opened && depth <= 0 {
                    end = index;
                    break 'scan;
                }
            }
        }

        Some(Self {
            first_line: start_line,
            lines: lines[start..=end].iter().map(|l| (*l).to_string()).collect(),
        })
    }

    /// Locates `fn name` in `text` and returns its body.
    pub fn find_function(text: &str, name: &str) -> Option<Self> {
        let pattern = Regex::new(&format!(r"\bfn\s+{}\b", regex::escape(name))).ok()?;
        let index = text.lines().position(|line| pattern.is_match(line))?;
        Self::function_at(text, index as u32 + 1)
    }

    pub fn last_line(&self) -> u32 {
        self.first_line + self.lines.len().saturating_sub(1) as u32
    }

    pub fn line(&self, number: u32) -> Option<&str> {
        let index = number.checked_sub(self.first_line)? as usize;
        self.lines.get(index).map(String::as_str)
    }
}

/// Window of the listing around `target`: 9 lines before through 10 after.
///
/// Without a target the whole listing is returned. A target outside the
/// listing yields nothing.
pub fn code_context(listing: &SourceListing, target: Option<u32>) -> Vec<CodeLine> {
    let numbered = listing
        .lines
        .iter()
        .enumerate()
        .map(|(i, text)| CodeLine {
            line_number: listing.first_line + i as u32,
            line_code: text.trim().to_string(),
        });

    let Some(target) = target.filter(|t| *t > 0) else {
        return numbered.collect();
    };
    let Some(index) = target
        .checked_sub(listing.first_line)
        .map(|i| i as usize)
        .filter(|i| *i < listing.lines.len())
    else {
        return Vec::new();
    };

    let start = index.saturating_sub(CONTEXT_LINES_BEFORE);
    let end = (index + CONTEXT_LINES_AFTER + 1).min(listing.lines.len());
    numbered.skip(start).take(end - start).collect()
}

static FRAME_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+:\s+(.+?)\s*$").expect("frame header regex"));
static FRAME_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at\s+(.+?):(\d+)(?::\d+)?\s*$").expect("frame location regex")
});

/// Parses the text form of `std::backtrace::Backtrace`.
///
/// Frames without a source location are dropped. The result is ordered
/// outermost first, the reverse of the printed order.
pub fn parse_backtrace(text: &str) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    let mut function: Option<String> = None;

    for line in text.lines() {
        if let Some(caps) = FRAME_LOCATION.captures(line) {
            if let Ok(number) = caps[2].parse::<u32>() {
                frames.push(StackFrame {
                    file: caps[1].to_string(),
                    line: Some(number),
                    function: function.clone(),
                    code: None,
                });
            }
        } else if let Some(caps) = FRAME_HEADER.captures(line) {
            function = Some(caps[1].to_string());
        }
    }

    frames.reverse();
    frames
}

/// Drops the frames outside the innermost `catch_unwind`, i.e. the test
/// harness that called into the observed body.
///
/// Frames are expected outermost first. Without a catch point all frames
/// are kept.
pub fn frames_below_catch_point(mut frames: Vec<StackFrame>) -> Vec<StackFrame> {
    let catch_point = frames.iter().rposition(|frame| {
        frame
            .function
            .as_deref()
            .is_some_and(|f| f.contains("catch_unwind") || f.contains("CatchUnwind"))
    });
    if let Some(index) = catch_point {
        frames.drain(..=index);
    }
    frames
}

/// Compares a frame path with a test file path.
///
/// `./` prefixes are ignored and a relative path matches any absolute path
/// that ends with the same components.
pub fn paths_match(frame_file: &str, source_file: &str) -> bool {
    if frame_file.is_empty() || source_file.is_empty() {
        return false;
    }
    let frame = normalize(frame_file);
    let source = normalize(source_file);
    frame == source || frame.ends_with(&source) || source.ends_with(&frame)
}

fn normalize(path: &str) -> PathBuf {
    Path::new(path)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Finds a source file by walking up from the current directory.
///
/// Paths from `file!()` are relative to the workspace root while tests run
/// from the crate directory.
pub fn resolve_source_path(file: &str) -> Option<PathBuf> {
    let path = Path::new(file);
    if path.is_absolute() {
        return path.exists().then(|| path.to_path_buf());
    }

    let cwd = std::env::current_dir().ok()?;
    cwd.ancestors()
        .map(|dir| dir.join(path))
        .find(|candidate| candidate.is_file())
}

fn read_source_line(source_file: &str, line: u32) -> Option<String> {
    let path = resolve_source_path(source_file)?;
    let text = fs::read_to_string(path).ok()?;
    text.lines()
        .nth((line as usize).checked_sub(1)?)
        .map(|l| l.trim().to_string())
}

/// `crate::module::test_fn::{{closure}}::h0123` becomes `test_fn`.
fn simple_function_name(function: &str) -> String {
    let mut segments: Vec<&str> = function.split("::").collect();
    while let Some(last) = segments.last() {
        let is_hash = last.len() == 17
            && last.starts_with('h')
            && last[1..].chars().all(|c| c.is_ascii_hexdigit());
        if *last == "{{closure}}" || is_hash {
            segments.pop();
        } else {
            break;
        }
    }
    segments.last().map_or_else(|| function.to_string(), |s| (*s).to_string())
}

fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Drops string literals and `//` comments so braces in them are not counted.
fn code_part(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '/' if chars.peek() == Some(&'/') => break,
            _ => out.push(c),
        }
    }
    out
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

struct PanicCapture {
    location: Option<(String, u32)>,
    backtrace: String,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicCapture>> = const { RefCell::new(None) };
}

fn take_panic_capture() -> Option<PanicCapture> {
    LAST_PANIC.with(|slot| slot.borrow_mut().take())
}

/// Records the location and a backtrace of panics raised inside observed
/// tests, then defers to the previous hook.
///
/// Installed once per process; later calls do nothing.
pub fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if crate::test_data::TestHandle::current().is_some() {
                let capture = PanicCapture {
                    location: info
                        .location()
                        .map(|l| (l.file().to_string(), l.line())),
                    backtrace: std::backtrace::Backtrace::force_capture().to_string(),
                };
                LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(capture));
            }
            previous(info);
        }));
    });
}
