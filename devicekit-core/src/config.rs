//! Public device identity config and host name side effects.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::defaults::{DEVICE_CONFIG_MODE, HOST_FILE_MODE, LOOPBACK_PREFIX};
use crate::error::DeviceKitError;
use crate::fs::FileSystem;

/// Server URL, group and name of a device, as stored in `device.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Base URL of the API server.
    #[serde(rename = "server-url", default)]
    pub server_url: String,
    /// Group the device belongs to.
    #[serde(default)]
    pub group: String,
    /// Device name, unique within the server.
    #[serde(rename = "device-name", default)]
    pub device_name: String,
}

impl DeviceIdentity {
    /// Builds an identity from its parts. Nothing is validated yet.
    #[must_use]
    pub fn new(
        server_url: impl Into<String>,
        group: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            group: group.into(),
            device_name: device_name.into(),
        }
    }

    /// Loads and validates the identity at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceKitError::NotRegistered`] if the file is absent,
    /// [`DeviceKitError::Validation`] if a required field is empty, and an
    /// I/O or serialization error if it cannot be read or decoded.
    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self, DeviceKitError> {
        let Some(buf) = fs
            .read(path)
            .map_err(|err| DeviceKitError::io(format!("read {}", path.display()), err))?
        else {
            return Err(DeviceKitError::NotRegistered {
                path: path.to_path_buf(),
            });
        };
        let identity: Self = serde_yaml::from_slice(&buf)?;
        identity.validate()?;
        Ok(identity)
    }

    /// Checks the required fields are present.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceKitError::Validation`] naming the first missing field.
    pub fn validate(&self) -> Result<(), DeviceKitError> {
        if self.server_url.is_empty() {
            return Err(DeviceKitError::Validation { field: "server-url" });
        }
        if self.device_name.is_empty() {
            return Err(DeviceKitError::Validation {
                field: "device-name",
            });
        }
        Ok(())
    }

    /// Writes the identity to `path`, world-readable.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<(), DeviceKitError> {
        let buf = serde_yaml::to_string(self)?;
        fs.write(path, buf.as_bytes(), DEVICE_CONFIG_MODE)
            .map_err(|err| DeviceKitError::io(format!("write {}", path.display()), err))
    }

    /// Replaces the device name and group of the identity stored at `path`.
    ///
    /// The stored identity is unchanged if the write fails.
    ///
    /// # Errors
    ///
    /// See [`DeviceIdentity::load`] and [`DeviceIdentity::save`].
    pub fn rename(
        fs: &dyn FileSystem,
        path: &Path,
        device_name: &str,
        group: &str,
    ) -> Result<Self, DeviceKitError> {
        let mut identity = Self::load(fs, path)?;
        identity.device_name = device_name.to_string();
        identity.group = group.to_string();
        identity.validate()?;
        identity.save(fs, path)?;
        tracing::info!(device_name, group, "renamed device");
        Ok(identity)
    }
}

/// Points the host name file and the loopback line of the hosts file at
/// `hostname`.
///
/// The two files are updated one after the other. If the second update fails
/// the first is not rolled back.
///
/// # Errors
///
/// Returns an error if either file cannot be read or written.
pub fn update_host_files(
    fs: &dyn FileSystem,
    hostname_file: &Path,
    hosts_file: &Path,
    hostname: &str,
) -> Result<(), DeviceKitError> {
    fs.write(hostname_file, hostname.as_bytes(), HOST_FILE_MODE)
        .map_err(|err| DeviceKitError::io(format!("write {}", hostname_file.display()), err))?;

    let input = fs
        .read(hosts_file)
        .map_err(|err| DeviceKitError::io(format!("read {}", hosts_file.display()), err))?
        .ok_or_else(|| {
            DeviceKitError::io(
                format!("read {}", hosts_file.display()),
                std::io::ErrorKind::NotFound.into(),
            )
        })?;
    // lines are handled as raw bytes; only the loopback line is rewritten
    let output = input
        .split(|byte| *byte == b'\n')
        .map(|line| {
            if line.starts_with(LOOPBACK_PREFIX.as_bytes()) {
                format!("{LOOPBACK_PREFIX}\t{hostname}").into_bytes()
            } else {
                line.to_vec()
            }
        })
        .collect::<Vec<_>>()
        .join(&b'\n');

    fs.write(hosts_file, &output, HOST_FILE_MODE)
        .map_err(|err| DeviceKitError::io(format!("write {}", hosts_file.display()), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use test_case::test_case;

    const CONFIG: &str = "/etc/cacophony/device.yaml";

    fn seeded(yaml: &str) -> MemoryFileSystem {
        let fs = MemoryFileSystem::new();
        fs.write(Path::new(CONFIG), yaml.as_bytes(), 0o644)
            .expect("seed");
        fs
    }

    #[test]
    fn test_load_missing_is_not_registered() {
        let fs = MemoryFileSystem::new();
        let err = DeviceIdentity::load(&fs, Path::new(CONFIG)).expect_err("missing");
        assert!(matches!(err, DeviceKitError::NotRegistered { .. }));
    }

    #[test]
    fn test_load_valid_config() {
        let fs = seeded(
            "server-url: https://api.cacophony.org.nz\ngroup: birds\ndevice-name: pi-17\n",
        );
        let identity = DeviceIdentity::load(&fs, Path::new(CONFIG)).expect("load");
        assert_eq!(
            identity,
            DeviceIdentity::new("https://api.cacophony.org.nz", "birds", "pi-17")
        );
    }

    #[test_case("group: birds\ndevice-name: pi-17\n", "server-url" ; "missing server url")]
    #[test_case("server-url: https://x\ngroup: birds\n", "device-name" ; "missing device name")]
    #[test_case("server-url: ''\ndevice-name: ''\n", "server-url" ; "both empty")]
    fn test_load_names_missing_field(yaml: &str, missing: &str) {
        let fs = seeded(yaml);
        match DeviceIdentity::load(&fs, Path::new(CONFIG)) {
            Err(DeviceKitError::Validation { field }) => assert_eq!(field, missing),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_rename_persists_name_and_group() {
        let fs = seeded("server-url: https://x\ngroup: birds\ndevice-name: pi-17\n");
        let renamed =
            DeviceIdentity::rename(&fs, Path::new(CONFIG), "pi-18", "possums").expect("rename");
        assert_eq!(renamed.device_name, "pi-18");
        assert_eq!(renamed.group, "possums");
        assert_eq!(renamed.server_url, "https://x");

        let reloaded = DeviceIdentity::load(&fs, Path::new(CONFIG)).expect("load");
        assert_eq!(reloaded, renamed);
        assert_eq!(fs.mode(Path::new(CONFIG)), Some(0o644));
    }

    #[test]
    fn test_rename_to_empty_name_leaves_file_untouched() {
        let fs = seeded("server-url: https://x\ngroup: birds\ndevice-name: pi-17\n");
        let err = DeviceIdentity::rename(&fs, Path::new(CONFIG), "", "possums")
            .expect_err("empty name");
        assert!(matches!(
            err,
            DeviceKitError::Validation {
                field: "device-name"
            }
        ));
        let reloaded = DeviceIdentity::load(&fs, Path::new(CONFIG)).expect("load");
        assert_eq!(reloaded.device_name, "pi-17");
        assert_eq!(reloaded.group, "birds");
    }

    #[test]
    fn test_update_host_files_rewrites_loopback_line() {
        let fs = MemoryFileSystem::new();
        let hostname = Path::new("/etc/hostname");
        let hosts = Path::new("/etc/hosts");
        fs.write(
            hosts,
            b"127.0.0.1\tpi-17\n::1\tlocalhost ip6-localhost\n\n",
            0o644,
        )
        .expect("seed");

        update_host_files(&fs, hostname, hosts, "pi-18").expect("update");

        assert_eq!(fs.read(hostname).expect("read"), Some(b"pi-18".to_vec()));
        let hosts_content = fs.read(hosts).expect("read").expect("present");
        assert_eq!(
            String::from_utf8(hosts_content).expect("utf8"),
            "127.0.0.1\tpi-18\n::1\tlocalhost ip6-localhost\n\n"
        );
    }

    #[test]
    fn test_update_host_files_keeps_non_utf8_lines() {
        let fs = MemoryFileSystem::new();
        let hostname = Path::new("/etc/hostname");
        let hosts = Path::new("/etc/hosts");
        fs.write(hosts, b"# caf\xe9 lan\n127.0.1.1\told\n10.0.0.2\tnas\xff\n", 0o644)
            .expect("seed");

        update_host_files(&fs, hostname, hosts, "pi-18").expect("update");

        assert_eq!(
            fs.read(hosts).expect("read"),
            Some(b"# caf\xe9 lan\n127.0.1.1\told\n10.0.0.2\tnas\xff\n".to_vec())
        );

        fs.write(hosts, b"127.0.0.1\tpi-17 \xfe\n\xfd\n", 0o644)
            .expect("seed");
        update_host_files(&fs, hostname, hosts, "pi-19").expect("update");
        assert_eq!(
            fs.read(hosts).expect("read"),
            Some(b"127.0.0.1\tpi-19\n\xfd\n".to_vec())
        );
    }

    #[test]
    fn test_update_host_files_without_hosts_file_fails_after_hostname() {
        let fs = MemoryFileSystem::new();
        let hostname = Path::new("/etc/hostname");
        let hosts = Path::new("/etc/hosts");

        let err = update_host_files(&fs, hostname, hosts, "pi-18").expect_err("no hosts");
        assert!(matches!(err, DeviceKitError::Io { .. }));
        assert_eq!(fs.read(hostname).expect("read"), Some(b"pi-18".to_vec()));
    }
}
