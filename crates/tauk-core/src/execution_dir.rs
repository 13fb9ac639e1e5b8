//! Locates the execution directory of this process.
//!
//! Directories live under `$TAUK_HOME/exec/<project hash>/<ppid>`, where the
//! project hash is taken from the working directory so that different
//! projects never share coordination files. Sibling processes started by the
//! same launcher therefore meet in one directory.
//!
//! In multi-process mode every process also leaves a marker at
//! `<project root>/pids/<pid>` naming its directory, so that test processes
//! it spawns join its run instead of starting their own.

use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory under the project root holding the per-process markers.
pub const PID_MARKERS_DIR: &str = "pids";

/// How this process came to use its execution directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirRole {
    /// Single-process run; the directory is private to this process.
    Single,
    /// First process of a multi-process run.
    Created,
    /// Joined a directory a sibling or the parent process created.
    Joined,
    /// Directory given explicitly through `TAUK_EXEC_DIR`.
    Override,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionDir {
    pub path: PathBuf,
    pub role: DirRole,
    marker: Option<PathBuf>,
}

impl ExecutionDir {
    /// Single-process directory keyed by the parent process.
    ///
    /// Leftovers from an earlier run that did not shut down cleanly are
    /// deleted.
    pub fn single(home: &Path, cwd: &Path, ppid: u32) -> io::Result<Self> {
        let path = project_root(home, cwd).join(ppid.to_string());
        if path.exists() {
            info!("Removing stale execution directory {}", path.display());
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            role: DirRole::Single,
            marker: None,
        })
    }

    /// Multi-process directory.
    ///
    /// An explicit override wins. Next comes the directory of the parent
    /// process when the parent is itself part of a run. Otherwise all
    /// children of the same parent share `<project root>/<ppid>`; the first
    /// to get there creates it.
    pub fn multi(
        home: &Path,
        cwd: &Path,
        override_dir: Option<&Path>,
        ppid: u32,
        pid: u32,
    ) -> io::Result<Self> {
        let root = project_root(home, cwd);
        let (path, role) = if let Some(dir) = override_dir {
            fs::create_dir_all(dir)?;
            debug!("Using execution directory override {}", dir.display());
            (dir.to_path_buf(), DirRole::Override)
        } else if let Some(dir) = registered_dir(&root, ppid) {
            debug!("Joining execution directory {} of parent {}", dir.display(), ppid);
            (dir, DirRole::Joined)
        } else {
            fs::create_dir_all(&root)?;
            let group = root.join(ppid.to_string());
            match fs::create_dir(&group) {
                Ok(()) => {
                    debug!("Created execution directory {}", group.display());
                    (group, DirRole::Created)
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Joining execution directory {}", group.display());
                    (group, DirRole::Joined)
                }
                Err(e) => return Err(e),
            }
        };

        let marker = root.join(PID_MARKERS_DIR).join(pid.to_string());
        fs::create_dir_all(root.join(PID_MARKERS_DIR))?;
        fs::write(&marker, path.to_string_lossy().as_bytes())?;

        Ok(Self {
            path,
            role,
            marker: Some(marker),
        })
    }

    /// Removes the marker pointing child processes at this directory.
    pub fn release(&self) {
        let Some(marker) = &self.marker else {
            return;
        };
        match fs::remove_file(marker) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", marker.display(), e),
        }
    }
}

/// Directory recorded by process `pid`, if it still exists.
fn registered_dir(root: &Path, pid: u32) -> Option<PathBuf> {
    let marker = root.join(PID_MARKERS_DIR).join(pid.to_string());
    let contents = fs::read_to_string(marker).ok()?;
    let dir = PathBuf::from(contents.trim());
    dir.is_dir().then_some(dir)
}

/// `$TAUK_HOME/exec/<project hash>`.
pub fn project_root(home: &Path, cwd: &Path) -> PathBuf {
    home.join("exec").join(project_hash(cwd))
}

/// First 32 hex digits of the SHA-256 of the working directory path.
pub fn project_hash(cwd: &Path) -> String {
    let digest = Sha256::digest(cwd.to_string_lossy().as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(32);
    hash
}

/// Parent process id, or this process's id where it is not available.
pub fn parent_pid() -> u32 {
    #[cfg(unix)]
    {
        nix::unistd::getppid().as_raw().unsigned_abs()
    }
    #[cfg(not(unix))]
    {
        std::process::id()
    }
}
