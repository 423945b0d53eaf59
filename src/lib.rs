//! Advisory directory locking with pid files.
//!
//! A directory is claimed by writing the owner's pid into a `.pid` file
//! directly inside it. Ownership is never cached: every operation re-reads
//! the file and asks the process table whether the recorded owner is still
//! alive, so a lock left behind by a crashed process does not block anyone.
//!
//! The lock is advisory. There is no atomic check-and-set between reading
//! the pid file and writing it, and a recycled pid belonging to an
//! unrelated process cannot be told apart from the original owner.

use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use log::error;
use thiserror::Error;

mod probe;

pub use probe::{ProcessTable, SystemProcessTable};

/// Name of the pid file created inside a locked directory.
pub const PID_FILE_NAME: &str = ".pid";

#[derive(Debug, Error)]
pub enum LockError {
    /// The directory is owned by another live process.
    #[error("directory {} is already locked by pid {}{}", .directory.display(), .pid, describe_owner(.description))]
    AlreadyLocked {
        directory: PathBuf,
        pid: u32,
        /// Best-effort command line of the owner. Empty when unknown.
        description: String,
    },
    /// Unlock was called on a directory with no pid file.
    #[error("directory {} is not locked", .0.display())]
    NotLocked(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn describe_owner(description: &str) -> String {
    if description.is_empty() {
        String::new()
    } else {
        format!(" ({description})")
    }
}

/// Represent a held directory lock. When this value is dropped, the
/// directory is unlocked again.
#[derive(Debug)]
#[must_use]
pub struct Lock {
    directory: PathBuf,
    pid_path: PathBuf,
}

/// Lock `directory` by writing the calling process's pid into its pid file.
///
/// Returns the path of the pid file. Locking succeeds when the pid file is
/// absent, holds invalid content, records a process that no longer exists,
/// or already records this process (re-entry, which changes nothing on
/// disk). It fails with [`LockError::AlreadyLocked`] when another live
/// process is on file.
pub fn lock(directory: impl AsRef<Path>) -> Result<PathBuf, LockError> {
    lock_with(directory, &SystemProcessTable)
}

/// Same as [`lock`], consulting `table` for process liveness.
pub fn lock_with(
    directory: impl AsRef<Path>,
    table: &dyn ProcessTable,
) -> Result<PathBuf, LockError> {
    let directory = directory.as_ref();
    let path = pid_path(directory);
    let own_pid = std::process::id();

    let file_pid = read_pid_file(directory)?;

    // Our own pid on file: re-entry, nothing to write. Checked before
    // liveness so a process can always re-enter its own lock.
    if file_pid == Some(own_pid) {
        return Ok(path);
    }

    if let Some(pid) = file_pid {
        if table.exists(pid) {
            return Err(LockError::AlreadyLocked {
                directory: directory.to_path_buf(),
                pid,
                description: table.command_line(pid).unwrap_or_default(),
            });
        }
    }

    write_pid_file(directory, own_pid)?;
    Ok(path)
}

/// Unlock `directory` by removing its pid file.
///
/// The file is removed when it records this process, or a process that no
/// longer exists, or invalid content. Unlocking fails with
/// [`LockError::AlreadyLocked`] when another live process is on file, and
/// with [`LockError::NotLocked`] when there is no pid file at all.
pub fn unlock(directory: impl AsRef<Path>) -> Result<(), LockError> {
    unlock_with(directory, &SystemProcessTable)
}

/// Same as [`unlock`], consulting `table` for process liveness.
pub fn unlock_with(
    directory: impl AsRef<Path>,
    table: &dyn ProcessTable,
) -> Result<(), LockError> {
    let directory = directory.as_ref();
    let own_pid = std::process::id();

    if let Some(pid) = read_pid_file(directory)? {
        if pid != own_pid && table.exists(pid) {
            return Err(LockError::AlreadyLocked {
                directory: directory.to_path_buf(),
                pid,
                description: table.command_line(pid).unwrap_or_default(),
            });
        }
    }

    match fs::remove_file(pid_path(directory)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(LockError::NotLocked(directory.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Return true if the pid file records a process that currently exists,
/// whether or not that process is the caller.
pub fn is_locked(directory: impl AsRef<Path>) -> Result<bool, LockError> {
    is_locked_with(directory, &SystemProcessTable)
}

/// Same as [`is_locked`], consulting `table` for process liveness.
pub fn is_locked_with(
    directory: impl AsRef<Path>,
    table: &dyn ProcessTable,
) -> Result<bool, LockError> {
    let locked = match read_pid_file(directory.as_ref())? {
        Some(pid) => table.exists(pid),
        None => false,
    };
    Ok(locked)
}

/// Return true if the pid file records the calling process's own pid.
pub fn is_locked_by_self(directory: impl AsRef<Path>) -> Result<bool, LockError> {
    Ok(read_pid_file(directory.as_ref())? == Some(std::process::id()))
}

/// Lock `directory`, and unlock it when the returned [`Lock`] is dropped.
pub fn lock_until_dropped(directory: impl AsRef<Path>) -> Result<Lock, LockError> {
    lock_until_dropped_with(directory, &SystemProcessTable)
}

/// Same as [`lock_until_dropped`], consulting `table` during acquisition.
pub fn lock_until_dropped_with(
    directory: impl AsRef<Path>,
    table: &dyn ProcessTable,
) -> Result<Lock, LockError> {
    let pid_path = lock_with(directory.as_ref(), table)?;
    Ok(Lock {
        directory: directory.as_ref().to_path_buf(),
        pid_path,
    })
}

impl Lock {
    /// The locked directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the pid file holding the lock.
    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    /// Re-check on disk that the pid file still records this process.
    pub fn is_locked_by_self(&self) -> Result<bool, LockError> {
        is_locked_by_self(&self.directory)
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Err(e) = unlock(&self.directory) {
            error!(
                "can't unlock directory {} in drop lock: {e}",
                self.directory.display()
            );
        }
    }
}

/// Path of the pid file inside `directory`.
pub fn pid_path(directory: impl AsRef<Path>) -> PathBuf {
    directory.as_ref().join(PID_FILE_NAME)
}

fn read_pid_file(directory: &Path) -> io::Result<Option<u32>> {
    let raw = match fs::read(pid_path(directory)) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(parse_pid(&raw))
}

/// A pid file holds nothing but ascii digits. Anything else reads as absent.
fn parse_pid(raw: &[u8]) -> Option<u32> {
    if raw.is_empty() || !raw.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn write_pid_file(directory: &Path, pid: u32) -> io::Result<()> {
    fs::write(pid_path(directory), pid.to_string())
}
