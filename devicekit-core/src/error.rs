use std::path::PathBuf;

use thiserror::Error;

/// Error outputs from `DeviceKit`
#[derive(Debug, Error)]
pub enum DeviceKitError {
    /// The presented input is not valid for the requested operation
    #[error("invalid_input: {attribute}: {reason}")]
    InvalidInput {
        /// Name of the rejected argument.
        attribute: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A required device config field is empty
    #[error("validation_error: {field} missing")]
    Validation {
        /// Config key that is missing, as written in the YAML file.
        field: &'static str,
    },
    /// The device has not been provisioned or registered yet
    #[error("not_registered: {} not found", path.display())]
    NotRegistered {
        /// File that was expected to exist.
        path: PathBuf,
    },
    /// The server rejected the request and an identical retry will fail too (4xx)
    #[error("permanent_api_error: {url} ({}): {message}", fmt_status(*status))]
    PermanentApi {
        /// Requested URL.
        url: String,
        /// HTTP status, if a response was received.
        status: Option<u16>,
        /// Response body or transport error detail.
        message: String,
    },
    /// The request failed in a way that may succeed on retry (5xx, network)
    #[error("temporary_api_error: {url} ({}): {message}", fmt_status(*status))]
    TemporaryApi {
        /// Requested URL.
        url: String,
        /// HTTP status, if a response was received.
        status: Option<u16>,
        /// Response body or transport error detail.
        message: String,
    },
    /// The HTTP exchange succeeded but the payload reports a failure
    #[error("application_failure: {context}: {message}")]
    ApplicationFailure {
        /// Operation that failed.
        context: &'static str,
        /// First message reported by the server.
        message: String,
    },
    /// The credential lock could not be acquired in time
    #[error("lock_timeout: {}", path.display())]
    LockTimeout {
        /// Lock file path.
        path: PathBuf,
    },
    /// A credential write was attempted without holding the exclusive lock
    #[error("not_locked: {} is not locked", path.display())]
    NotLocked {
        /// Credential file path.
        path: PathBuf,
    },
    /// Operating system error while locking
    #[error("lock_error: {0}")]
    Lock(String),
    /// Authentication requires a password and none is set
    #[error("no_password_set")]
    NoPassword,
    /// A download destination already exists
    #[error("file_exists: {}", path.display())]
    FileExists {
        /// Destination path.
        path: PathBuf,
    },
    /// Unexpected error serializing or deserializing information
    #[error("serialization_error: {0}")]
    Serialization(String),
    /// Filesystem failure
    #[error("io_error: {context}: {source}")]
    Io {
        /// Operation and path involved.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl DeviceKitError {
    /// Returns `true` if retrying the same request cannot succeed.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::PermanentApi { .. } | Self::ApplicationFailure { .. })
    }

    /// Returns `true` if the operation is safe to retry later.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::TemporaryApi { .. } | Self::LockTimeout { .. })
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<serde_yaml::Error> for DeviceKitError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<serde_json::Error> for DeviceKitError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

fn fmt_status(status: Option<u16>) -> String {
    status.map_or_else(|| "no response".to_string(), |code| code.to_string())
}
