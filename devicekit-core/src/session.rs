//! In-memory session state of one device connection.
//!
//! A [`Session`] is owned by a single [`crate::DeviceApi`] and is never
//! persisted. Fields change only through the transition methods, which keep
//! the state, password, token and `just_registered` flag consistent.

use secrecy::{ExposeSecret, SecretString};
use strum::Display;

use crate::config::DeviceIdentity;
use crate::error::DeviceKitError;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    /// No token yet.
    Unauthenticated,
    /// A registration request is in flight.
    Registering,
    /// An authentication request is in flight.
    Authenticating,
    /// A token is held.
    Authenticated,
    /// The last registration or authentication failed.
    Failed,
}

/// Identity, password and bearer token of one device connection.
#[derive(Debug)]
pub struct Session {
    identity: DeviceIdentity,
    password: Option<SecretString>,
    token: Option<SecretString>,
    device_id: u32,
    just_registered: bool,
    state: SessionState,
}

impl Session {
    /// Starts an unauthenticated session. An empty password is treated as
    /// no password.
    #[must_use]
    pub fn new(identity: DeviceIdentity, password: Option<&str>) -> Self {
        Self {
            identity,
            password: password
                .filter(|password| !password.is_empty())
                .map(|password| SecretString::from(password.to_string())),
            token: None,
            device_id: 0,
            just_registered: false,
            state: SessionState::Unauthenticated,
        }
    }

    /// Returns the identity this session acts for.
    #[must_use]
    pub const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the device password, if one is known.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(ExposeSecret::expose_secret)
    }

    /// Returns the current bearer token, if authenticated.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_ref().map(ExposeSecret::expose_secret)
    }

    /// Returns the id the server assigned at registration, or 0 if unknown.
    #[must_use]
    pub const fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Returns `true` if this session registered a new device.
    #[must_use]
    pub const fn just_registered(&self) -> bool {
        self.just_registered
    }

    pub(crate) const fn token_secret(&self) -> Option<&SecretString> {
        self.token.as_ref()
    }

    pub(crate) const fn password_secret(&self) -> Option<&SecretString> {
        self.password.as_ref()
    }

    /// Enters `Registering`. Only valid while no password is known.
    pub(crate) fn begin_registration(&mut self) -> Result<(), DeviceKitError> {
        if self.password.is_some() {
            return Err(DeviceKitError::InvalidInput {
                attribute: "password".to_string(),
                reason: "already registered".to_string(),
            });
        }
        self.state = SessionState::Registering;
        Ok(())
    }

    /// Records a successful registration.
    pub(crate) fn complete_registration(
        &mut self,
        token: String,
        password: SecretString,
        device_id: u32,
    ) {
        self.token = Some(SecretString::from(token));
        self.password = Some(password);
        self.device_id = device_id;
        self.just_registered = true;
        self.state = SessionState::Authenticated;
    }

    /// Enters `Authenticating`. Requires a password.
    pub(crate) fn begin_authentication(&mut self) -> Result<(), DeviceKitError> {
        if self.password.is_none() {
            return Err(DeviceKitError::NoPassword);
        }
        self.state = SessionState::Authenticating;
        Ok(())
    }

    /// Records a successful authentication, replacing any previous token.
    pub(crate) fn complete_authentication(&mut self, token: String, device_id: Option<u32>) {
        self.token = Some(SecretString::from(token));
        if let Some(device_id) = device_id.filter(|id| *id != 0) {
            self.device_id = device_id;
        }
        self.state = SessionState::Authenticated;
    }

    /// Marks the in-flight registration or authentication as failed.
    pub(crate) fn fail(&mut self) {
        self.token = None;
        self.state = SessionState::Failed;
    }
}
