//! Registration and authentication against the API server.

use rand::{distributions::Alphanumeric, Rng};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::DeviceIdentity;
use crate::defaults::{API_BASE_PATH, PASSWORD_LENGTH};
use crate::error::DeviceKitError;
use crate::http_request::Request;
use crate::session::{Session, SessionState};

#[derive(Serialize)]
struct RegisterBody<'a> {
    group: &'a str,
    devicename: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct AuthenticateBody<'a> {
    devicename: &'a str,
    password: &'a str,
}

/// Body returned by the registration and authentication endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TokenResponse {
    #[serde(alias = "success", default)]
    success: bool,
    #[serde(alias = "messages", default)]
    messages: Vec<String>,
    #[serde(alias = "token", default)]
    token: String,
    #[serde(rename = "ID", alias = "id", alias = "Id", default)]
    id: u32,
}

impl TokenResponse {
    fn message(&self) -> String {
        self.messages
            .first()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Client for one device: holds the session and issues every API call with
/// its token.
///
/// Not designed for concurrent use; give each logical connection its own
/// instance.
#[derive(Debug)]
pub struct DeviceApi {
    pub(crate) session: Session,
    pub(crate) request: Request,
    pub(crate) server_url: String,
    register_url: String,
    authenticate_url: String,
}

impl DeviceApi {
    /// Connects to the server as `device_name`.
    ///
    /// Without a password (or with an empty one) the device is registered
    /// under a freshly generated password. With a password the device
    /// authenticates. Exactly one of the two runs.
    ///
    /// Registration is not idempotent: every call registers a new device, so
    /// the generated password must be persisted straight away.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceKitError::InvalidInput`] if `device_name` is empty,
    /// [`DeviceKitError::PermanentApi`] or [`DeviceKitError::TemporaryApi`]
    /// if the server rejects the request, and
    /// [`DeviceKitError::ApplicationFailure`] if the server reports failure
    /// in an otherwise successful response.
    pub async fn create(
        server_url: &str,
        group: &str,
        device_name: &str,
        password: Option<&str>,
    ) -> Result<Self, DeviceKitError> {
        if device_name.is_empty() {
            return Err(DeviceKitError::InvalidInput {
                attribute: "device_name".to_string(),
                reason: "no device name".to_string(),
            });
        }
        let identity = DeviceIdentity::new(server_url, group, device_name);
        let mut api = Self::new(Session::new(identity, password))?;

        if api.session.password().is_none() {
            api.register().await?;
        } else {
            api.authenticate().await?;
        }
        Ok(api)
    }

    fn new(session: Session) -> Result<Self, DeviceKitError> {
        let server_url = session.identity().server_url.trim_end_matches('/').to_string();
        Ok(Self {
            register_url: format!("{server_url}{API_BASE_PATH}/devices"),
            authenticate_url: format!("{server_url}/authenticate_device"),
            server_url,
            session,
            request: Request::new()?,
        })
    }

    /// Authenticates again with the session password, e.g. after the token
    /// expired.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceKitError::NoPassword`] if no password is set, and the
    /// same API errors as [`DeviceApi::create`].
    pub async fn reauthenticate(&mut self) -> Result<(), DeviceKitError> {
        self.authenticate().await
    }

    async fn authenticate(&mut self) -> Result<(), DeviceKitError> {
        self.session.begin_authentication()?;
        let result = self.request_authentication().await;
        self.settle(result, "failed getting new token").map(|response| {
            self.session
                .complete_authentication(response.token, Some(response.id));
            tracing::info!(device_name = %self.session.identity().device_name, "authenticated device");
        })
    }

    async fn request_authentication(&self) -> Result<TokenResponse, DeviceKitError> {
        let password = self
            .session
            .password_secret()
            .ok_or(DeviceKitError::NoPassword)?;
        let body = AuthenticateBody {
            devicename: &self.session.identity().device_name,
            password: password.expose_secret(),
        };
        self.token_request(&self.authenticate_url, &body).await
    }

    async fn register(&mut self) -> Result<(), DeviceKitError> {
        self.session.begin_registration()?;
        let password = generate_password();
        let result = self.request_registration(&password).await;
        self.settle(result, "registration failed").map(|response| {
            if response.id == 0 {
                tracing::warn!("registration response carried no device id");
            }
            self.session
                .complete_registration(response.token, password, response.id);
            tracing::info!(
                device_name = %self.session.identity().device_name,
                device_id = self.session.device_id(),
                "registered device"
            );
        })
    }

    async fn request_registration(
        &self,
        password: &SecretString,
    ) -> Result<TokenResponse, DeviceKitError> {
        let identity = self.session.identity();
        let body = RegisterBody {
            group: &identity.group,
            devicename: &identity.device_name,
            password: password.expose_secret(),
        };
        self.token_request(&self.register_url, &body).await
    }

    async fn token_request<T: Serialize + Sync>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<TokenResponse, DeviceKitError> {
        let response = self
            .request
            .handle(self.request.post(url).json(body))
            .await?;
        let text = response.text().await.map_err(|err| DeviceKitError::TemporaryApi {
            url: url.to_string(),
            status: None,
            message: format!("body read failed: {err}"),
        })?;
        serde_json::from_str(&text)
            .map_err(|err| DeviceKitError::Serialization(format!("decode: {err}")))
    }

    /// Turns a token exchange into a successful response or a failed session.
    fn settle(
        &mut self,
        result: Result<TokenResponse, DeviceKitError>,
        context: &'static str,
    ) -> Result<TokenResponse, DeviceKitError> {
        let outcome = result.and_then(|response| {
            if response.success {
                Ok(response)
            } else {
                Err(DeviceKitError::ApplicationFailure {
                    context,
                    message: response.message(),
                })
            }
        });
        if let Err(err) = &outcome {
            tracing::warn!(%err, "{context}");
            self.session.fail();
        }
        outcome
    }

    /// Returns the session state.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Returns the current bearer token.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.session.token()
    }

    /// Returns the device password: the one supplied, or the one generated
    /// at registration.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.session.password()
    }

    /// Returns `true` if this instance registered a new device.
    #[must_use]
    pub const fn just_registered(&self) -> bool {
        self.session.just_registered()
    }

    /// Returns the server-assigned device id, or 0 if the server did not
    /// report one.
    #[must_use]
    pub const fn device_id(&self) -> u32 {
        self.session.device_id()
    }

    /// Returns `true` if a token is held.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session.state() == SessionState::Authenticated
    }
}

/// Random printable password of `PASSWORD_LENGTH` characters.
fn generate_password() -> SecretString {
    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect();
    SecretString::from(password)
}
