use reqwest::{Method, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};

use crate::defaults::{HTTP_IDLE_TIMEOUT, HTTP_MAX_IDLE_CONNECTIONS, HTTP_TIMEOUT};
use crate::error::DeviceKitError;

/// A thin wrapper on an HTTP client. Sets connection timeouts, the idle pool
/// size and the user-agent, and maps failed exchanges onto permanent or
/// temporary errors. Requests are never retried here.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    client: reqwest::Client,
}

impl Request {
    /// Initializes a new `Request` instance.
    pub(crate) fn new() -> Result<Self, DeviceKitError> {
        let client = reqwest::Client::builder()
            .connect_timeout(HTTP_TIMEOUT)
            .read_timeout(HTTP_TIMEOUT)
            .pool_idle_timeout(HTTP_IDLE_TIMEOUT)
            .pool_max_idle_per_host(HTTP_MAX_IDLE_CONNECTIONS)
            .user_agent(format!("devicekit-core/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| DeviceKitError::PermanentApi {
                url: "<client>".to_string(),
                status: None,
                message: format!("http client build failed: {err}"),
            })?;
        Ok(Self { client })
    }

    /// Creates a request builder with defaults applied.
    pub(crate) fn req(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Creates a request builder carrying the device token.
    pub(crate) fn authorized(
        &self,
        method: Method,
        url: &str,
        token: &SecretString,
    ) -> RequestBuilder {
        self.req(method, url)
            .header(reqwest::header::AUTHORIZATION, token.expose_secret())
    }

    /// Creates a GET request builder with defaults applied.
    pub(crate) fn get(&self, url: &str) -> RequestBuilder {
        self.req(Method::GET, url)
    }

    /// Creates a POST request builder with defaults applied.
    pub(crate) fn post(&self, url: &str) -> RequestBuilder {
        self.req(Method::POST, url)
    }

    /// Sends a request and checks the response status.
    ///
    /// Transport failures are temporary; a response outside 2xx is permanent
    /// for 4xx and temporary otherwise, with the response body as the message.
    pub(crate) async fn handle(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, DeviceKitError> {
        let (client, request) = request_builder.build_split();
        let request = request.map_err(|err| DeviceKitError::PermanentApi {
            url: err
                .url()
                .map_or_else(|| "<unknown>".to_string(), ToString::to_string),
            status: None,
            message: format!("request build failed: {err}"),
        })?;
        let url = request.url().to_string();
        tracing::debug!(method = %request.method(), %url, "sending request");

        let response = client
            .execute(request)
            .await
            .map_err(|err| DeviceKitError::TemporaryApi {
                url: url.clone(),
                status: None,
                message: format!("request failed: {err}"),
            })?;
        check_status(url, response).await
    }
}

/// Passes 2xx responses through and turns anything else into an error.
async fn check_status(
    url: String,
    response: Response,
) -> Result<Response, DeviceKitError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let message = match response.text().await {
        Ok(body) => body,
        Err(err) => {
            return Err(DeviceKitError::TemporaryApi {
                url,
                status: Some(code),
                message: format!("request failed and body read failed: {err}"),
            })
        }
    };
    tracing::warn!(%url, status = code, "request rejected");
    if status.is_client_error() {
        Err(DeviceKitError::PermanentApi {
            url,
            status: Some(code),
            message,
        })
    } else {
        Err(DeviceKitError::TemporaryApi {
            url,
            status: Some(code),
            message,
        })
    }
}
