//! Per-process SDK log files, `tauk-<local timestamp>-<pid>.log`.
//!
//! Several test processes may log into the same directory at once. Pruning
//! only ever removes files whose writer has exited.

use crate::platform::is_process_alive;
use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

pub(crate) const MAX_LOG_FILES: usize = 5;

const LOG_PREFIX: &str = "tauk-";
const LOG_SUFFIX: &str = ".log";

#[derive(Debug)]
struct SdkLog {
    path: PathBuf,
    /// `<timestamp>-<pid>`, ordered by creation time.
    stem: String,
    pid: Option<u32>,
}

impl SdkLog {
    fn from_path(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_prefix(LOG_PREFIX)?.strip_suffix(LOG_SUFFIX)?;
        let pid = stem
            .rsplit_once('-')
            .and_then(|(_, pid)| pid.parse::<u32>().ok());
        let stem = stem.to_string();
        Some(Self { path, stem, pid })
    }

    fn writer_alive(&self) -> bool {
        self.pid.is_some_and(is_process_alive)
    }
}

/// Makes room for one more log in `logs_dir`, leaving at most `max_files`
/// once it is created.
///
/// The oldest logs of exited processes go first. Logs still being written
/// are kept even when that leaves the directory over the limit.
pub fn rotate_logs(logs_dir: &Path, max_files: usize) -> io::Result<()> {
    let entries = match fs::read_dir(logs_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let logs: Vec<SdkLog> = entries
        .filter_map(|entry| SdkLog::from_path(entry.ok()?.path()))
        .collect();
    let excess = (logs.len() + 1).saturating_sub(max_files);
    if excess == 0 {
        return Ok(());
    }

    let mut finished: Vec<SdkLog> = logs
        .into_iter()
        .filter(|log| !log.writer_alive())
        .collect();
    finished.sort_by(|a, b| a.stem.cmp(&b.stem));
    for log in finished.into_iter().take(excess) {
        match fs::remove_file(&log.path) {
            Ok(()) => debug!("Pruned old log {}", log.path.display()),
            Err(e) => debug!("Could not prune {}: {}", log.path.display(), e),
        }
    }
    Ok(())
}

/// Opens this process's log file in `logs_dir`, pruning old logs first.
pub fn create_log_file(logs_dir: &Path) -> io::Result<(fs::File, PathBuf)> {
    fs::create_dir_all(logs_dir)?;
    rotate_logs(logs_dir, MAX_LOG_FILES)?;

    let name = format!(
        "{}{}-{}{}",
        LOG_PREFIX,
        Local::now().format("%Y-%m-%dT%H-%M-%S"),
        std::process::id(),
        LOG_SUFFIX
    );
    let path = logs_dir.join(name);
    let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((file, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A pid no process can have.
    const EXITED: u32 = i32::MAX.unsigned_abs();

    fn log_of(dir: &Path, day: u32, pid: u32) -> String {
        let name = format!("tauk-2025-01-{:02}T12-00-00-{}.log", day, pid);
        fs::write(dir.join(&name), "line\n").unwrap();
        name
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_oldest_finished_logs_are_pruned() {
        let tmp = TempDir::new().unwrap();
        for day in 1..=7 {
            log_of(tmp.path(), day, EXITED);
        }

        rotate_logs(tmp.path(), 5).unwrap();

        let remaining = names(tmp.path());
        assert_eq!(remaining.len(), 4);
        assert!(remaining[0].starts_with("tauk-2025-01-04"));
    }

    #[test]
    fn test_log_of_running_process_survives_rotation() {
        let tmp = TempDir::new().unwrap();
        // Oldest file, but its writer is this test process
        let live = log_of(tmp.path(), 1, std::process::id());
        for day in 2..=6 {
            log_of(tmp.path(), day, EXITED);
        }

        rotate_logs(tmp.path(), 5).unwrap();

        let remaining = names(tmp.path());
        assert!(remaining.contains(&live));
        assert_eq!(remaining.len(), 4);
        assert!(!remaining.iter().any(|n| n.starts_with("tauk-2025-01-02")));
    }

    #[test]
    fn test_only_live_logs_are_never_pruned() {
        let tmp = TempDir::new().unwrap();
        for day in 1..=6 {
            log_of(tmp.path(), day, std::process::id());
        }

        rotate_logs(tmp.path(), 5).unwrap();

        assert_eq!(names(tmp.path()).len(), 6);
    }

    #[test]
    fn test_other_files_are_left_alone() {
        let tmp = TempDir::new().unwrap();
        for day in 1..=6 {
            log_of(tmp.path(), day, EXITED);
        }
        fs::write(tmp.path().join("other.log"), "keep").unwrap();
        fs::write(tmp.path().join("tauk-errors-12.jsonl"), "keep").unwrap();

        rotate_logs(tmp.path(), 5).unwrap();

        let remaining = names(tmp.path());
        assert_eq!(remaining.len(), 6);
        assert!(remaining.contains(&"other.log".to_string()));
        assert!(remaining.contains(&"tauk-errors-12.jsonl".to_string()));
    }

    #[test]
    fn test_missing_directory_is_fine() {
        let tmp = TempDir::new().unwrap();
        rotate_logs(&tmp.path().join("missing"), 5).unwrap();
    }

    #[test]
    fn test_created_log_carries_pid() {
        let tmp = TempDir::new().unwrap();
        let logs_dir = tmp.path().join("logs");
        fs::create_dir_all(&logs_dir).unwrap();
        for day in 1..=5 {
            log_of(&logs_dir, day, EXITED);
        }

        let (_, path) = create_log_file(&logs_dir).unwrap();

        let log = SdkLog::from_path(path).unwrap();
        assert_eq!(log.pid, Some(std::process::id()));
        assert_eq!(names(&logs_dir).len(), MAX_LOG_FILES);
    }
}
