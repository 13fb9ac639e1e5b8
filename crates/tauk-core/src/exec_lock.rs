//! Cross-process lock guarding the shared run file.
//!
//! Uses `flock()` on `exec.run.lock` inside the execution directory so that
//! only one process at a time reads, validates and rewrites the run file.
//! The kernel releases the lock when the holder exits, even on a crash.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tauk_core::exec_lock::{ExecLock, EXEC_LOCK_TIMEOUT};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let guard = ExecLock::acquire("/tmp/tauk/exec/abc/42/exec.run.lock", EXEC_LOCK_TIMEOUT).await?;
//! // read-modify-write exec.run while the guard is alive
//! drop(guard);
//! # Ok(())
//! # }
//! ```

use crate::error::TaukError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

/// How long a process waits for the run file before giving up.
pub const EXEC_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Metadata stored in the lock file, readable by other processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    /// Process ID of the lock holder.
    pub pid: u32,

    /// When the lock was acquired.
    pub started: DateTime<Utc>,
}

/// A guard that holds the execution lock. The lock is released when this is dropped.
#[derive(Debug)]
pub struct LockGuard {
    #[cfg(unix)]
    _flock: nix::fcntl::Flock<File>,

    #[cfg(not(unix))]
    _file: File,

    lock_path: PathBuf,
}

impl LockGuard {
    /// Returns the path to the lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        tracing::debug!("Releasing execution lock at {}", self.lock_path.display());
    }
}

/// Errors that can occur during lock operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock is already held by another process.
    #[error("Lock already held by PID {}", .0.pid)]
    AlreadyLocked(LockMetadata),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse lock metadata: {0}")]
    ParseError(String),

    #[error("File locking not supported on this platform")]
    UnsupportedPlatform,
}

/// Advisory lock on the execution directory's run file.
pub struct ExecLock;

impl ExecLock {
    /// Try to acquire the lock without waiting.
    ///
    /// Returns `LockError::AlreadyLocked` with the holder's metadata when
    /// another process owns it.
    pub fn try_acquire(lock_path: impl AsRef<Path>) -> Result<LockGuard, LockError> {
        let lock_path = lock_path.as_ref().to_path_buf();

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        #[cfg(unix)]
        {
            use nix::fcntl::{Flock, FlockArg};

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => {
                    Self::write_metadata(&flock)?;
                    tracing::debug!("Acquired execution lock at {}", lock_path.display());
                    Ok(LockGuard {
                        _flock: flock,
                        lock_path,
                    })
                }
                Err((file, errno)) => {
                    use nix::errno::Errno;
                    // EWOULDBLOCK and EAGAIN are the same on some platforms (macOS)
                    if errno == Errno::EWOULDBLOCK || errno == Errno::EAGAIN {
                        let metadata = Self::read_metadata(&file)?;
                        Err(LockError::AlreadyLocked(metadata))
                    } else {
                        Err(LockError::Io(io::Error::new(
                            io::ErrorKind::Other,
                            format!("flock failed: {}", errno),
                        )))
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = file;
            Err(LockError::UnsupportedPlatform)
        }
    }

    /// Acquire the lock, polling until `timeout` elapses.
    ///
    /// Running out of time is fatal for the caller: without the lock it
    /// cannot know which run it belongs to.
    pub async fn acquire(
        lock_path: impl AsRef<Path>,
        timeout: Duration,
    ) -> Result<LockGuard, TaukError> {
        let lock_path = lock_path.as_ref();
        let deadline = Instant::now() + timeout;
        let mut reported_holder = false;

        loop {
            match Self::try_acquire(lock_path) {
                Ok(guard) => return Ok(guard),
                Err(LockError::AlreadyLocked(holder)) => {
                    if !reported_holder {
                        tracing::debug!(
                            "Execution lock {} held by PID {} since {}, waiting",
                            lock_path.display(),
                            holder.pid,
                            holder.started
                        );
                        reported_holder = true;
                    }
                }
                // Holder has the lock but has not written its metadata yet.
                Err(LockError::ParseError(_)) => {}
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Err(TaukError::LockTimeout {
                    path: lock_path.to_path_buf(),
                    timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn write_metadata(file: &File) -> Result<(), LockError> {
        let metadata = LockMetadata {
            pid: process::id(),
            started: Utc::now(),
        };

        let mut file_clone = file.try_clone()?;
        file_clone.set_len(0)?;
        file_clone.seek(SeekFrom::Start(0))?;

        let json = serde_json::to_string(&metadata)
            .map_err(|e| LockError::ParseError(e.to_string()))?;

        file_clone.write_all(json.as_bytes())?;
        file_clone.sync_all()?;

        Ok(())
    }

    fn read_metadata(file: &File) -> Result<LockMetadata, LockError> {
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        if contents.trim().is_empty() {
            return Err(LockError::ParseError("lock file is empty".to_string()));
        }
        serde_json::from_str(&contents).map_err(|e| LockError::ParseError(e.to_string()))
    }
}
