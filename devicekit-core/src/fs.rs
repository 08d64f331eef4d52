//! Filesystem capability injected into the config and credential stores.
//!
//! Production code uses [`OsFileSystem`]. [`MemoryFileSystem`] keeps files in
//! a map so config and credential logic can be tested without touching the
//! host.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Small-file storage used for device config, private credentials and host
/// name files.
pub trait FileSystem: Send + Sync {
    /// Reads the file at `path`.
    ///
    /// Returns `Ok(None)` if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    /// Replaces the content of `path` and applies the Unix permission bits in
    /// `mode`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails. Implementations must leave the
    /// previous content in place when that happens.
    fn write(&self, path: &Path, bytes: &[u8], mode: u32) -> io::Result<()>;

    /// Checks if a file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.read(path)?.is_some())
    }
}

/// The host filesystem. Writes go to a temporary sibling that is synced and
/// renamed over the target.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write(&self, path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = temp_sibling(path);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        std::os::unix::fs::OpenOptionsExt::mode(&mut options, mode);
        #[cfg(not(unix))]
        let _ = mode;

        let result = (|| {
            let mut file = options.open(&tmp_path)?;
            // the mode passed to open is masked by the umask
            #[cfg(unix)]
            file.set_permissions(std::os::unix::fs::PermissionsExt::from_mode(mode))?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp_path, path)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "file".into(), |name| name.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.tmp"))
}

/// In-memory filesystem. Not persistent; intended for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: Mutex<HashMap<PathBuf, MemoryFile>>,
}

#[derive(Debug, Clone)]
struct MemoryFile {
    bytes: Vec<u8>,
    mode: u32,
}

impl MemoryFileSystem {
    /// Creates an empty in-memory filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the permission bits the file was last written with.
    #[must_use]
    pub fn mode(&self, path: &Path) -> Option<u32> {
        self.files
            .lock()
            .ok()
            .and_then(|files| files.get(path).map(|file| file.mode))
    }

    /// Removes a file, returning whether it existed.
    pub fn remove(&self, path: &Path) -> bool {
        self.files
            .lock()
            .is_ok_and(|mut files| files.remove(path).is_some())
    }
}

impl FileSystem for MemoryFileSystem {
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        let files = self.files.lock().map_err(|_| poisoned())?;
        Ok(files.get(path).map(|file| file.bytes.clone()))
    }

    fn write(&self, path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
        self.files.lock().map_err(|_| poisoned())?.insert(
            path.to_path_buf(),
            MemoryFile {
                bytes: bytes.to_vec(),
                mode,
            },
        );
        Ok(())
    }
}

fn poisoned() -> io::Error {
    io::Error::other("memory filesystem mutex poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_write_replaces_content_and_sets_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/dir/device-priv.yaml");
        let fs = OsFileSystem;

        assert_eq!(fs.read(&path).expect("read"), None);
        assert!(!fs.exists(&path).expect("exists"));

        fs.write(&path, b"first", 0o600).expect("write");
        fs.write(&path, b"second", 0o600).expect("write");
        assert_eq!(fs.read(&path).expect("read"), Some(b"second".to_vec()));
        assert!(!temp_sibling(&path).exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_memory_records_mode() {
        let fs = MemoryFileSystem::new();
        let path = Path::new("/etc/cacophony/device.yaml");

        assert_eq!(fs.read(path).expect("read"), None);
        fs.write(path, b"device-name: a", 0o644).expect("write");
        assert_eq!(fs.mode(path), Some(0o644));
        assert!(fs.exists(path).expect("exists"));

        assert!(fs.remove(path));
        assert!(!fs.exists(path).expect("exists"));
        assert_eq!(fs.mode(path), None);
    }
}
