//! Fixed device paths, lock timing and HTTP client settings.

use std::time::Duration;

/// Public device identity (server URL, group, device name).
pub const DEVICE_CONFIG_PATH: &str = "/etc/cacophony/device.yaml";

/// Private credential (password, device id). Owner read/write only.
pub const PRIVATE_CONFIG_PATH: &str = "/etc/cacophony/device-priv.yaml";

/// Advisory lock shared by every credential handle on the host.
pub const LOCK_FILE_PATH: &str = "/var/lock/cacophony-priv.lock";

/// Host name file rewritten on rename.
pub const HOSTNAME_FILE_PATH: &str = "/etc/hostname";

/// Hosts file whose loopback line is rewritten on rename.
pub const HOSTS_FILE_PATH: &str = "/etc/hosts";

pub(crate) const LOOPBACK_PREFIX: &str = "127.0.0.1";

pub(crate) const DEVICE_CONFIG_MODE: u32 = 0o644;
pub(crate) const PRIVATE_CONFIG_MODE: u32 = 0o600;
pub(crate) const HOST_FILE_MODE: u32 = 0o644;

/// How long lock acquisition waits before giving up.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between lock attempts while waiting.
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(678);

pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const HTTP_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub(crate) const HTTP_MAX_IDLE_CONNECTIONS: usize = 5;

pub(crate) const PASSWORD_LENGTH: usize = 20;

pub(crate) const API_BASE_PATH: &str = "/api/v1";
pub(crate) const EVENT_TIMES_KEY: &str = "dateTimes";
