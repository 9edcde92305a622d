//! Single-instance advisory lock (spec.md §6 "a host-wide mutual
//! exclusion primitive ... prevents two server processes from binding
//! the same port with overlapping state").
//!
//! POSIX side of the lock spec.md describes; the named-system-mutex
//! side is Windows-specific OS glue out of this crate's scope. Backed
//! by `fs2`'s advisory file locking rather than a bare
//! create-and-check-existence file, since the latter leaves a stale
//! lock behind after a crash.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use fs2::FileExt;

/// A held instance lock. Dropping it releases the underlying advisory
/// lock (via `fs2`, which releases on `File` close) and leaves the lock
/// file itself in place for the next `try_acquire` to reuse.
pub struct InstanceLock {
    file: File,
}

impl InstanceLock {
    /// Attempt to acquire the lock at `path`, writing this process's PID
    /// into the file on success. Returns `Ok(None)` if another process
    /// already holds it (spec.md §6 exit code 2).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file can't be created or written.
    pub fn try_acquire(path: &Path) -> anyhow::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        Ok(Some(Self { file }))
    }

    /// Read the PID recorded in the lock file, without acquiring the
    /// lock. Used by `stop`/`restart`/`status` to find the running
    /// process; returns `None` if the file is absent, empty, or
    /// unparseable.
    #[must_use]
    pub fn read_pid(path: &Path) -> Option<u32> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
