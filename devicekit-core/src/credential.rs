//! Private device credential and its lock-protected store.
//!
//! The credential file is guarded by the shared [`FileLock`] at
//! [`DevicePaths::lock_file`], never by a lock derived from the credential
//! path itself. Writers must hold the exclusive lock; readers take a shared
//! lock unless their handle already holds one.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults::{LOCK_RETRY_DELAY, LOCK_TIMEOUT, PRIVATE_CONFIG_MODE};
use crate::error::DeviceKitError;
use crate::fs::FileSystem;
use crate::lock::{FileLock, LockMode};
use crate::paths::DevicePaths;

/// Password and server-assigned id of a registered device.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateCredential {
    /// Password generated at registration.
    #[serde(default)]
    pub password: String,
    /// Id assigned by the server.
    #[serde(rename = "device-id", default)]
    pub device_id: u32,
}

impl PrivateCredential {
    /// A credential is usable only when both fields are set.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.password.is_empty() && self.device_id != 0
    }
}

impl fmt::Debug for PrivateCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateCredential")
            .field("password", &"<redacted>")
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Handle on the private credential file plus the host-wide credential lock.
///
/// Not meant to be shared between threads; give each logical operation its
/// own handle.
pub struct CredentialStore {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    lock: FileLock,
    lock_timeout: Duration,
    retry_delay: Duration,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Creates a handle on the credential and lock files named in `paths`.
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>, paths: &DevicePaths) -> Self {
        Self::with_paths(fs, paths.private_config(), paths.lock_file())
    }

    /// Creates a handle on an explicit credential file guarded by `lock_path`.
    #[must_use]
    pub fn with_paths(
        fs: Arc<dyn FileSystem>,
        credential_path: impl Into<PathBuf>,
        lock_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fs,
            path: credential_path.into(),
            lock: FileLock::new(lock_path),
            lock_timeout: LOCK_TIMEOUT,
            retry_delay: LOCK_RETRY_DELAY,
        }
    }

    /// Overrides how long lock acquisition waits and how often it retries.
    #[must_use]
    pub const fn with_lock_timing(mut self, timeout: Duration, retry_delay: Duration) -> Self {
        self.lock_timeout = timeout;
        self.retry_delay = retry_delay;
        self
    }

    /// Returns the credential file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Returns `true` if this handle holds the credential lock.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Waits for the exclusive lock. `Ok(false)` means the wait timed out.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS lock call fails.
    pub fn acquire_exclusive(&mut self) -> Result<bool, DeviceKitError> {
        self.acquire(LockMode::Exclusive)
    }

    /// Waits for a shared lock. `Ok(false)` means the wait timed out.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS lock call fails.
    pub fn acquire_shared(&mut self) -> Result<bool, DeviceKitError> {
        self.acquire(LockMode::Shared)
    }

    /// Releases the lock held by this handle, if any.
    pub fn unlock(&mut self) {
        self.lock.unlock();
    }

    /// Reads the credential.
    ///
    /// Returns `Ok(None)` if the credential file does not exist, which means
    /// the device was never registered. If this handle does not already hold
    /// the lock, a shared lock is taken for the read and released afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceKitError::LockTimeout`] if the shared lock cannot be
    /// taken in time, and an I/O or serialization error if the file cannot
    /// be read or decoded.
    pub fn read(&mut self) -> Result<Option<PrivateCredential>, DeviceKitError> {
        if self.lock.is_locked() {
            return self.read_unlocked();
        }
        if !self.acquire(LockMode::Shared)? {
            return Err(DeviceKitError::LockTimeout {
                path: self.lock_path().to_path_buf(),
            });
        }
        let result = self.read_unlocked();
        self.lock.unlock();
        result
    }

    /// Writes the credential. The caller must hold the exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceKitError::NotLocked`] if this handle does not hold the
    /// exclusive lock, or an I/O error if the write fails.
    pub fn write(&mut self, device_id: u32, password: &str) -> Result<(), DeviceKitError> {
        if self.lock.held() != Some(LockMode::Exclusive) {
            return Err(DeviceKitError::NotLocked {
                path: self.path.clone(),
            });
        }
        let credential = PrivateCredential {
            password: password.to_string(),
            device_id,
        };
        let buf = serde_yaml::to_string(&credential)?;
        self.fs
            .write(&self.path, buf.as_bytes(), PRIVATE_CONFIG_MODE)
            .map_err(|err| DeviceKitError::io(format!("write {}", self.path.display()), err))?;
        tracing::info!(device_id, path = %self.path.display(), "stored device credential");
        Ok(())
    }

    fn acquire(&mut self, mode: LockMode) -> Result<bool, DeviceKitError> {
        self.lock
            .lock_with_timeout(mode, self.lock_timeout, self.retry_delay)
    }

    fn read_unlocked(&self) -> Result<Option<PrivateCredential>, DeviceKitError> {
        let Some(buf) = self
            .fs
            .read(&self.path)
            .map_err(|err| DeviceKitError::io(format!("read {}", self.path.display()), err))?
        else {
            return Ok(None);
        };
        let credential = serde_yaml::from_slice(&buf)?;
        Ok(Some(credential))
    }
}

/// Reads the private credential at the paths in `paths` under a shared lock.
///
/// # Errors
///
/// See [`CredentialStore::read`].
pub fn load_private_credential(
    fs: Arc<dyn FileSystem>,
    paths: &DevicePaths,
) -> Result<Option<PrivateCredential>, DeviceKitError> {
    CredentialStore::new(fs, paths).read()
}
