//! Advisory locks under `<root>/.locks/`.
//!
//! A backup run holds the lock named after its date directory for the whole
//! run; retention takes the same lock (without waiting) before touching a
//! date directory, and skips the directory if it is busy. Manifest updates
//! are serialised through the `manifest` lock. The lock files live outside the
//! date directories so they never keep an otherwise empty directory alive.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::layout::LOCKS_DIR;

pub const MANIFEST_LOCK: &str = "manifest";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("cannot open lock file {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("cannot lock {path}: {source}")]
    Lock { path: String, source: io::Error },
    #[error("{name} is busy: a backup is writing to it")]
    Busy { name: String },
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Block until the lock is ours.
    pub fn acquire(root: &Path, name: &str) -> Result<Self, LockError> {
        let (file, path) = open_lock_file(root, name)?;
        flock(&file, false).map_err(|source| LockError::Lock {
            path: path.display().to_string(),
            source,
        })?;
        debug!(lock = %path.display(), "lock acquired");
        Ok(Self { _file: file, path })
    }

    /// `Ok(None)` when someone else holds the lock.
    pub fn try_acquire(root: &Path, name: &str) -> Result<Option<Self>, LockError> {
        let (file, path) = open_lock_file(root, name)?;
        match flock(&file, true) {
            Ok(()) => {
                debug!(lock = %path.display(), "lock acquired");
                Ok(Some(Self { _file: file, path }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(LockError::Lock {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn lock_path(root: &Path, name: &str) -> PathBuf {
    root.join(LOCKS_DIR).join(format!("{name}.lock"))
}

fn open_lock_file(root: &Path, name: &str) -> Result<(File, PathBuf), LockError> {
    let path = lock_path(root, name);
    let open_err = |source: io::Error| LockError::Open {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(open_err)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(open_err)?;
    Ok((file, path))
}

#[cfg(unix)]
fn flock(file: &File, nonblocking: bool) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let mut op = libc::LOCK_EX;
    if nonblocking {
        op |= libc::LOCK_NB;
    }
    loop {
        let ret = unsafe { libc::flock(file.as_raw_fd(), op) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _nonblocking: bool) -> io::Result<()> {
    Ok(())
}
