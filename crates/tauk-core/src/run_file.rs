//! The run file shared by the processes of a multi-process run.
//!
//! ```text
//! 1d6a0c4e-8f0b-4c53-9d2e-5b1f6f3f7a10,api-token,project-id
//! tauk-exec v1 sha256=<hex digest of line 1>
//! ```
//!
//! Files written by older clients have no second line and are read as v1.
//! Only touch this file while holding the execution lock.
//!
//! Each process of the run also keeps a marker under `members/`. The last
//! one to leave removes the run file.

use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;

/// Name of the run file inside the execution directory.
pub const RUN_FILE: &str = "exec.run";

/// Name of the lock file guarding [`RUN_FILE`].
pub const RUN_LOCK_FILE: &str = "exec.run.lock";

/// Format version written to the trailer line.
pub const RUN_FILE_VERSION: &str = "v1";

/// Directory inside the execution directory with one marker per process.
pub const MEMBERS_DIR: &str = "members";

const TRAILER_TAG: &str = "tauk-exec";

/// Run identity and credentials shared between processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedRunFile {
    pub run_id: String,
    pub api_token: String,
    pub project_id: String,
}

/// What was found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunFileState {
    Missing,
    Valid(SharedRunFile),
    /// Unreadable, from an unknown format version, or failing its checksum.
    Corrupt(String),
}

impl SharedRunFile {
    pub fn new(
        run_id: impl Into<String>,
        api_token: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            api_token: api_token.into(),
            project_id: project_id.into(),
        }
    }

    /// Whether the stored run id is a well-formed UUID.
    pub fn has_valid_run_id(&self) -> bool {
        uuid::Uuid::parse_str(&self.run_id).is_ok()
    }

    fn record_line(&self) -> String {
        format!("{},{},{}", self.run_id, self.api_token, self.project_id)
    }

    pub fn encode(&self) -> String {
        let line = self.record_line();
        format!(
            "{}\n{} {} sha256={}\n",
            line,
            TRAILER_TAG,
            RUN_FILE_VERSION,
            checksum(&line)
        )
    }

    /// Parses file contents. The error names what is wrong with them.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut lines = text.lines();
        let line = lines.next().map(str::trim).unwrap_or_default();

        if let Some(trailer) = lines.next().map(str::trim).filter(|t| !t.is_empty()) {
            verify_trailer(trailer, line)?;
        }

        let parts: Vec<&str> = line.splitn(3, ',').map(str::trim).collect();
        match parts.as_slice() {
            [run_id, api_token, project_id] => Ok(Self::new(*run_id, *api_token, *project_id)),
            _ => Err(format!("expected 3 fields, found {}", parts.len())),
        }
    }

    pub fn read(path: &Path) -> io::Result<RunFileState> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(match Self::parse(&text) {
                Ok(file) => RunFileState::Valid(file),
                Err(reason) => RunFileState::Corrupt(reason),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RunFileState::Missing),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Ok(RunFileState::Corrupt("not valid UTF-8".to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Replaces the file at `path` atomically.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let tmp = path.with_extension("run.tmp");
        fs::write(&tmp, self.encode())?;
        fs::rename(&tmp, path)
    }
}

/// Records a process of the run and returns its member name.
///
/// The name is `<pid>-<token>` so that several contexts in one process stay
/// distinct.
pub fn join_run(exec_dir: &Path, pid: u32) -> io::Result<String> {
    let members = exec_dir.join(MEMBERS_DIR);
    fs::create_dir_all(&members)?;
    let member = format!("{}-{}", pid, uuid::Uuid::new_v4().simple());
    fs::write(members.join(&member), b"")?;
    Ok(member)
}

/// Removes `member` from the run and returns how many members remain.
///
/// Markers left by processes that died without leaving are dropped too.
pub fn leave_run(exec_dir: &Path, member: &str) -> io::Result<usize> {
    let members = exec_dir.join(MEMBERS_DIR);
    let entries = match fs::read_dir(&members) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut remaining = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let alive = name != member
            && name
                .split_once('-')
                .and_then(|(pid, _)| pid.parse::<u32>().ok())
                .is_some_and(crate::platform::is_process_alive);
        if alive {
            remaining += 1;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    if remaining == 0 {
        fs::remove_dir(&members)?;
    }
    Ok(remaining)
}

fn checksum(line: &str) -> String {
    hex::encode(Sha256::digest(line.as_bytes()))
}

fn verify_trailer(trailer: &str, line: &str) -> Result<(), String> {
    let mut fields = trailer.split_whitespace();
    if fields.next() != Some(TRAILER_TAG) {
        return Err(format!("unrecognized trailer '{}'", trailer));
    }
    match fields.next() {
        Some(RUN_FILE_VERSION) => {}
        Some(other) => return Err(format!("unsupported format version {}", other)),
        None => return Err("missing format version".to_string()),
    }
    let digest = fields
        .next()
        .and_then(|f| f.strip_prefix("sha256="))
        .ok_or_else(|| "missing checksum".to_string())?;
    if !digest.eq_ignore_ascii_case(&checksum(line)) {
        return Err("checksum mismatch".to_string());
    }
    Ok(())
}
