//! Provisioning: ties the identity config, the credential store and the
//! session together.
//!
//! Flows that read and then write device state ([`Device::connect`],
//! [`Device::rename`]) hold the exclusive credential lock for their whole
//! duration, so two processes can never both decide to register.

use std::sync::Arc;
use std::time::Duration;

use crate::api::DeviceApi;
use crate::config::{update_host_files, DeviceIdentity};
use crate::credential::{CredentialStore, PrivateCredential};
use crate::defaults::{LOCK_RETRY_DELAY, LOCK_TIMEOUT};
use crate::error::DeviceKitError;
use crate::fs::{FileSystem, OsFileSystem};
use crate::paths::DevicePaths;

/// A device on this host: where its files live and how to reach them.
#[derive(Clone)]
pub struct Device {
    paths: DevicePaths,
    fs: Arc<dyn FileSystem>,
    lock_timeout: Duration,
    retry_delay: Duration,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new(DevicePaths::default(), Arc::new(OsFileSystem))
    }
}

impl Device {
    /// Creates a device using `paths` on the filesystem `fs`.
    #[must_use]
    pub const fn new(paths: DevicePaths, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            paths,
            fs,
            lock_timeout: LOCK_TIMEOUT,
            retry_delay: LOCK_RETRY_DELAY,
        }
    }

    /// Overrides how long credential lock acquisition waits.
    #[must_use]
    pub const fn with_lock_timing(mut self, timeout: Duration, retry_delay: Duration) -> Self {
        self.lock_timeout = timeout;
        self.retry_delay = retry_delay;
        self
    }

    /// Returns the paths of this device.
    #[must_use]
    pub const fn paths(&self) -> &DevicePaths {
        &self.paths
    }

    /// Returns a fresh handle on the private credential.
    #[must_use]
    pub fn credential_store(&self) -> CredentialStore {
        CredentialStore::new(Arc::clone(&self.fs), &self.paths)
            .with_lock_timing(self.lock_timeout, self.retry_delay)
    }

    /// Loads the identity config.
    ///
    /// # Errors
    ///
    /// See [`DeviceIdentity::load`].
    pub fn identity(&self) -> Result<DeviceIdentity, DeviceKitError> {
        DeviceIdentity::load(self.fs.as_ref(), self.paths.device_config())
    }

    /// Validates and writes a new identity config.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a required field is empty, or an error if
    /// the write fails.
    pub fn provision(&self, identity: &DeviceIdentity) -> Result<(), DeviceKitError> {
        identity.validate()?;
        identity.save(self.fs.as_ref(), self.paths.device_config())?;
        tracing::info!(
            device_name = %identity.device_name,
            group = %identity.group,
            "provisioned device identity"
        );
        Ok(())
    }

    /// Reads the private credential under a shared lock.
    ///
    /// # Errors
    ///
    /// See [`CredentialStore::read`].
    pub fn private_credential(&self) -> Result<Option<PrivateCredential>, DeviceKitError> {
        self.credential_store().read()
    }

    /// Connects to the server, registering the device if it has no stored
    /// password.
    ///
    /// The exclusive credential lock is held from the identity and credential
    /// reads until a newly generated credential has been written, so a rename
    /// that finishes while this call waits is registered under the new name.
    /// A failed registration leaves the credential file untouched.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceKitError::NotRegistered`] if there is no identity
    /// config, [`DeviceKitError::LockTimeout`] if the lock is busy, and any
    /// error from [`DeviceApi::create`] or [`CredentialStore::write`].
    pub async fn connect(&self) -> Result<DeviceApi, DeviceKitError> {
        let mut store = lock_exclusive(self.credential_store()).await?;
        let identity = self.identity()?;

        let password = store
            .read()?
            .map(|credential| credential.password)
            .filter(|password| !password.is_empty());

        let api = DeviceApi::create(
            &identity.server_url,
            &identity.group,
            &identity.device_name,
            password.as_deref(),
        )
        .await?;

        if api.just_registered() {
            let password = api.password().ok_or(DeviceKitError::NoPassword)?;
            store.write(api.device_id(), password)?;
        }
        store.unlock();
        Ok(api)
    }

    /// Renames the device and regroups it, then points the host name files
    /// at the new name, all under the exclusive credential lock.
    ///
    /// The host name files are updated after the config. If that step fails
    /// the config keeps the new name; the error must be treated as a failed
    /// rename.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceKitError::LockTimeout`] if the lock is busy, and any
    /// error from [`DeviceIdentity::rename`] or [`update_host_files`].
    pub async fn rename(
        &self,
        device_name: &str,
        group: &str,
    ) -> Result<DeviceIdentity, DeviceKitError> {
        let mut store = lock_exclusive(self.credential_store()).await?;
        let identity = DeviceIdentity::rename(
            self.fs.as_ref(),
            self.paths.device_config(),
            device_name,
            group,
        )?;
        update_host_files(
            self.fs.as_ref(),
            self.paths.hostname_file(),
            self.paths.hosts_file(),
            device_name,
        )?;
        store.unlock();
        Ok(identity)
    }
}

/// Acquires the exclusive lock off the async runtime, since acquisition
/// sleeps between attempts.
async fn lock_exclusive(mut store: CredentialStore) -> Result<CredentialStore, DeviceKitError> {
    let lock_path = store.lock_path().to_path_buf();
    let (store, acquired) = tokio::task::spawn_blocking(move || {
        let acquired = store.acquire_exclusive();
        (store, acquired)
    })
    .await
    .map_err(|err| DeviceKitError::Lock(format!("lock task failed: {err}")))?;

    if acquired? {
        Ok(store)
    } else {
        Err(DeviceKitError::LockTimeout { path: lock_path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use mockito::Matcher;

    const SHORT: Duration = Duration::from_millis(200);
    const RETRY: Duration = Duration::from_millis(20);

    struct Fixture {
        _dir: tempfile::TempDir,
        fs: Arc<MemoryFileSystem>,
        device: Device,
    }

    fn fixture(server_url: &str) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = Arc::new(MemoryFileSystem::new());
        let shared: Arc<dyn FileSystem> = fs.clone();
        let device = Device::new(DevicePaths::rooted(dir.path()), shared)
            .with_lock_timing(SHORT, RETRY);
        device
            .provision(&DeviceIdentity::new(server_url, "birds", "pi-17"))
            .expect("provision");
        Fixture {
            _dir: dir,
            fs,
            device,
        }
    }

    #[tokio::test]
    async fn test_connect_without_identity_is_not_registered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let device = Device::new(
            DevicePaths::rooted(dir.path()),
            Arc::new(MemoryFileSystem::new()),
        );
        let err = device.connect().await.expect_err("no identity");
        assert!(matches!(err, DeviceKitError::NotRegistered { .. }));
    }

    #[test]
    fn test_provision_rejects_incomplete_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = Arc::new(MemoryFileSystem::new());
        let shared: Arc<dyn FileSystem> = fs.clone();
        let device = Device::new(DevicePaths::rooted(dir.path()), shared);

        let err = device
            .provision(&DeviceIdentity::new("", "birds", "pi-17"))
            .expect_err("no url");
        assert!(matches!(err, DeviceKitError::Validation { field: "server-url" }));
        assert!(!fs.exists(device.paths().device_config()).expect("exists"));
    }

    #[tokio::test]
    async fn test_connect_registers_and_persists_credential() {
        let mut server = mockito::Server::new_async().await;
        let register = server
            .mock("POST", "/api/v1/devices")
            .with_status(201)
            .with_body(r#"{"Success":true,"Token":"tok123","ID":42}"#)
            .create_async()
            .await;
        let fixture = fixture(&server.url());

        let api = fixture.device.connect().await.expect("connect");
        register.assert_async().await;
        assert_eq!(api.token(), Some("tok123"));
        assert!(api.just_registered());

        let stored = fixture
            .device
            .private_credential()
            .expect("read")
            .expect("present");
        assert_eq!(Some(stored.password.as_str()), api.password());
        assert_eq!(stored.device_id, 42);
        assert_eq!(
            fixture.fs.mode(fixture.device.paths().private_config()),
            Some(0o600)
        );
        assert!(fixture
            .device
            .credential_store()
            .acquire_exclusive()
            .expect("lock released"));
    }

    #[tokio::test]
    async fn test_second_connect_authenticates_with_stored_password() {
        let mut server = mockito::Server::new_async().await;
        let register = server
            .mock("POST", "/api/v1/devices")
            .with_status(201)
            .with_body(r#"{"Success":true,"Token":"tok-reg","ID":42}"#)
            .expect(1)
            .create_async()
            .await;
        let fixture = fixture(&server.url());

        let first = fixture.device.connect().await.expect("register");
        let password = first.password().expect("password").to_string();

        let authenticate = server
            .mock("POST", "/authenticate_device")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "devicename": "pi-17",
                "password": password,
            })))
            .with_status(200)
            .with_body(r#"{"success":true,"token":"tok-auth"}"#)
            .create_async()
            .await;

        let second = fixture.device.connect().await.expect("authenticate");
        register.assert_async().await;
        authenticate.assert_async().await;
        assert_eq!(second.token(), Some("tok-auth"));
        assert!(!second.just_registered());
        assert_eq!(second.password(), Some(password.as_str()));
    }

    #[tokio::test]
    async fn test_failed_registration_leaves_store_untouched() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/devices")
            .with_status(422)
            .with_body(r#"{"Success":false,"Messages":["devicename in use"]}"#)
            .create_async()
            .await;
        let fixture = fixture(&server.url());

        let err = fixture.device.connect().await.expect_err("name taken");
        assert!(err.is_permanent());
        assert!(err.to_string().contains("devicename in use"));
        assert_eq!(fixture.device.private_credential().expect("read"), None);
    }

    #[tokio::test]
    async fn test_connect_times_out_while_lock_is_held() {
        let mut server = mockito::Server::new_async().await;
        let register = server
            .mock("POST", "/api/v1/devices")
            .expect(0)
            .create_async()
            .await;
        let fixture = fixture(&server.url());

        let mut holder = fixture.device.credential_store();
        assert!(holder.acquire_exclusive().expect("lock"));

        let err = fixture.device.connect().await.expect_err("busy");
        assert!(matches!(err, DeviceKitError::LockTimeout { .. }));
        register.assert_async().await;
        holder.unlock();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_reads_identity_inside_lock() {
        let mut server = mockito::Server::new_async().await;
        let register_new_name = server
            .mock("POST", "/api/v1/devices")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "group": "possums",
                "devicename": "pi-18",
            })))
            .with_status(201)
            .with_body(r#"{"Success":true,"Token":"tok-18","ID":18}"#)
            .expect(1)
            .create_async()
            .await;
        let fixture = fixture(&server.url());
        let paths = fixture.device.paths().clone();

        let mut holder = fixture.device.credential_store();
        assert!(holder.acquire_exclusive().expect("lock"));

        let waiting = fixture
            .device
            .clone()
            .with_lock_timing(Duration::from_secs(5), RETRY);
        let connect = tokio::spawn(async move { waiting.connect().await });

        // let the connect start waiting on the lock before the rename lands
        std::thread::sleep(Duration::from_millis(100));
        DeviceIdentity::rename(
            fixture.fs.as_ref(),
            paths.device_config(),
            "pi-18",
            "possums",
        )
        .expect("rename under lock");
        holder.unlock();

        let api = connect.await.expect("join").expect("connect");
        register_new_name.assert_async().await;
        assert_eq!(api.session().identity().device_name, "pi-18");
        assert_eq!(api.device_id(), 18);
    }

    #[tokio::test]
    async fn test_rename_updates_config_and_host_files() {
        let fixture = fixture("https://api.example");
        let paths = fixture.device.paths().clone();
        fixture
            .fs
            .write(paths.hosts_file(), b"127.0.0.1\tpi-17\n", 0o644)
            .expect("seed hosts");

        let identity = fixture
            .device
            .rename("pi-18", "possums")
            .await
            .expect("rename");
        assert_eq!(identity.device_name, "pi-18");
        assert_eq!(fixture.device.identity().expect("load"), identity);
        assert_eq!(
            fixture.fs.read(paths.hostname_file()).expect("read"),
            Some(b"pi-18".to_vec())
        );
        assert_eq!(
            fixture.fs.read(paths.hosts_file()).expect("read"),
            Some(b"127.0.0.1\tpi-18\n".to_vec())
        );
    }

    #[tokio::test]
    async fn test_rename_waits_for_lock() {
        let fixture = fixture("https://api.example");
        let mut holder = fixture.device.credential_store();
        assert!(holder.acquire_shared().expect("lock"));

        let err = fixture
            .device
            .rename("pi-18", "possums")
            .await
            .expect_err("busy");
        assert!(matches!(err, DeviceKitError::LockTimeout { .. }));
        assert_eq!(fixture.device.identity().expect("load").device_name, "pi-17");
    }
}
