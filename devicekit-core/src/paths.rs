//! Filesystem locations used by a device.

use std::path::{Path, PathBuf};

use crate::defaults::{
    DEVICE_CONFIG_PATH, HOSTNAME_FILE_PATH, HOSTS_FILE_PATH, LOCK_FILE_PATH,
    PRIVATE_CONFIG_PATH,
};

/// Paths for the device identity, private credential, credential lock and
/// host name files.
///
/// The lock path is independent of the credential path: every credential
/// handle built from the same `DevicePaths` contends on one lock file, so a
/// single lock can guard several related files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePaths {
    device_config: PathBuf,
    private_config: PathBuf,
    lock_file: PathBuf,
    hostname_file: PathBuf,
    hosts_file: PathBuf,
}

impl Default for DevicePaths {
    fn default() -> Self {
        Self {
            device_config: PathBuf::from(DEVICE_CONFIG_PATH),
            private_config: PathBuf::from(PRIVATE_CONFIG_PATH),
            lock_file: PathBuf::from(LOCK_FILE_PATH),
            hostname_file: PathBuf::from(HOSTNAME_FILE_PATH),
            hosts_file: PathBuf::from(HOSTS_FILE_PATH),
        }
    }
}

impl DevicePaths {
    /// Re-roots every default path under `root`, e.g. `/etc/hostname`
    /// becomes `<root>/etc/hostname`.
    #[must_use]
    pub fn rooted(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let defaults = Self::default();
        Self {
            device_config: reroot(root, &defaults.device_config),
            private_config: reroot(root, &defaults.private_config),
            lock_file: reroot(root, &defaults.lock_file),
            hostname_file: reroot(root, &defaults.hostname_file),
            hosts_file: reroot(root, &defaults.hosts_file),
        }
    }

    /// Returns the path to the device identity config.
    #[must_use]
    pub fn device_config(&self) -> &Path {
        &self.device_config
    }

    /// Returns the path to the private credential file.
    #[must_use]
    pub fn private_config(&self) -> &Path {
        &self.private_config
    }

    /// Returns the path to the credential lock file.
    #[must_use]
    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    /// Returns the path to the host name file.
    #[must_use]
    pub fn hostname_file(&self) -> &Path {
        &self.hostname_file
    }

    /// Returns the path to the hosts file.
    #[must_use]
    pub fn hosts_file(&self) -> &Path {
        &self.hosts_file
    }
}

fn reroot(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}
