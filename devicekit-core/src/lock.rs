//! Advisory inter-process lock for the private credential.
//!
//! On Unix the lock is `flock` on a dedicated lock file; on Windows it is
//! `LockFileEx` on the first byte. Both are cooperative: a process that does
//! not go through this API can still touch the guarded files.
//!
//! Acquisition never blocks indefinitely. It polls a non-blocking attempt at
//! a fixed interval until the timeout elapses.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::DeviceKitError;

/// Lock flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of readers.
    Shared,
    /// A single writer, excluding readers.
    Exclusive,
}

/// A file-backed lock. The lock file is opened lazily on first acquisition
/// and kept open for the life of the value; dropping it releases any lock
/// still held.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
    held: Option<LockMode>,
}

impl FileLock {
    /// Creates a lock bound to `path`. Nothing is opened yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            held: None,
        }
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the mode currently held by this handle, if any.
    #[must_use]
    pub const fn held(&self) -> Option<LockMode> {
        self.held
    }

    /// Returns `true` if this handle holds the lock in any mode.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.held.is_some()
    }

    /// Makes a single non-blocking attempt to take the lock in `mode`.
    ///
    /// Returns `Ok(true)` if this handle now holds the lock (including when
    /// it already held it in the same mode) and `Ok(false)` if another
    /// holder is in the way.
    ///
    /// Modes are never converted in place. A lock held in the other mode is
    /// released before the attempt, so after `Ok(false)` this handle holds
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or the OS lock call
    /// fails for reasons other than contention.
    pub fn try_lock(&mut self, mode: LockMode) -> Result<bool, DeviceKitError> {
        if self.held == Some(mode) {
            return Ok(true);
        }
        self.unlock();
        self.open()?;
        let Some(file) = &self.file else {
            return Err(DeviceKitError::Lock("lock file not open".to_string()));
        };
        let acquired = imp::try_lock(file, mode).map_err(|err| {
            DeviceKitError::Lock(format!("{}: {err}", self.path.display()))
        })?;
        if acquired {
            self.held = Some(mode);
        }
        Ok(acquired)
    }

    /// Waits up to `timeout` for the lock, retrying every `retry_delay`.
    ///
    /// A timeout is not an error: the caller must check the returned flag.
    ///
    /// # Errors
    ///
    /// Returns an error if an attempt fails for reasons other than contention.
    pub fn lock_with_timeout(
        &mut self,
        mode: LockMode,
        timeout: Duration,
        retry_delay: Duration,
    ) -> Result<bool, DeviceKitError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_lock(mode)? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(
                    path = %self.path.display(),
                    ?mode,
                    "timed out waiting for credential lock"
                );
                return Ok(false);
            }
            std::thread::sleep(retry_delay.min(deadline - now));
        }
    }

    /// Releases the lock if this handle holds it.
    pub fn unlock(&mut self) {
        if self.held.take().is_some() {
            if let Some(file) = &self.file {
                if let Err(err) = imp::unlock(file) {
                    tracing::warn!(path = %self.path.display(), "failed to release lock: {err}");
                }
            }
        }
    }

    fn open(&mut self) -> Result<(), DeviceKitError> {
        if self.file.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| DeviceKitError::Lock(err.to_string()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|err| DeviceKitError::Lock(format!("{}: {err}", self.path.display())))?;
        self.file = Some(file);
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

// ── Unix flock ──────────────────────────────────────────────────────

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::os::raw::c_int;
    use std::os::unix::io::AsRawFd;

    use super::LockMode;

    const LOCK_SH: c_int = 1;
    const LOCK_EX: c_int = 2;
    const LOCK_NB: c_int = 4;
    const LOCK_UN: c_int = 8;

    extern "C" {
        fn flock(fd: c_int, operation: c_int) -> c_int;
    }

    pub(super) fn try_lock(file: &File, mode: LockMode) -> std::io::Result<bool> {
        let operation = match mode {
            LockMode::Shared => LOCK_SH,
            LockMode::Exclusive => LOCK_EX,
        };
        let result = unsafe { flock(file.as_raw_fd(), operation | LOCK_NB) };
        if result == 0 {
            Ok(true)
        } else {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }

    pub(super) fn unlock(file: &File) -> std::io::Result<()> {
        let result = unsafe { flock(file.as_raw_fd(), LOCK_UN) };
        if result == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

// ── Windows LockFileEx ──────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::fs::File;
    use std::os::windows::io::AsRawHandle;

    use super::LockMode;

    type HANDLE = *mut std::ffi::c_void;

    #[repr(C)]
    struct OVERLAPPED {
        internal: usize,
        internal_high: usize,
        offset: u32,
        offset_high: u32,
        h_event: HANDLE,
    }

    const LOCKFILE_EXCLUSIVE_LOCK: u32 = 0x2;
    const LOCKFILE_FAIL_IMMEDIATELY: u32 = 0x1;
    const ERROR_LOCK_VIOLATION: i32 = 33;

    extern "system" {
        fn LockFileEx(
            h_file: HANDLE,
            flags: u32,
            reserved: u32,
            bytes_to_lock_low: u32,
            bytes_to_lock_high: u32,
            overlapped: *mut OVERLAPPED,
        ) -> i32;
        fn UnlockFileEx(
            h_file: HANDLE,
            reserved: u32,
            bytes_to_unlock_low: u32,
            bytes_to_unlock_high: u32,
            overlapped: *mut OVERLAPPED,
        ) -> i32;
    }

    pub(super) fn try_lock(file: &File, mode: LockMode) -> std::io::Result<bool> {
        let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
        if mode == LockMode::Exclusive {
            flags |= LOCKFILE_EXCLUSIVE_LOCK;
        }
        let handle = file.as_raw_handle() as HANDLE;
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let result = unsafe { LockFileEx(handle, flags, 0, 1, 0, &mut overlapped) };
        if result != 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION) {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub(super) fn unlock(file: &File) -> std::io::Result<()> {
        let handle = file.as_raw_handle() as HANDLE;
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let result = unsafe { UnlockFileEx(handle, 0, 1, 0, &mut overlapped) };
        if result != 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}
