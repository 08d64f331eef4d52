//! Authorized calls made with the session token.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::api::DeviceApi;
use crate::defaults::{API_BASE_PATH, EVENT_TIMES_KEY};
use crate::error::DeviceKitError;

/// Kind of recording sent in the upload metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum RecordingType {
    /// Raw thermal camera recording.
    #[default]
    ThermalRaw,
    /// Audio recording.
    Audio,
}

#[derive(Serialize)]
struct RecordingMetadata {
    #[serde(rename = "type")]
    kind: String,
}

/// File metadata plus a short-lived token for downloading its content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    /// File metadata.
    #[serde(alias = "File", default)]
    pub file: FileInfo,
    /// Signed token for the content request.
    #[serde(alias = "Jwt", default)]
    pub jwt: String,
}

/// Metadata of a stored file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// Names of the file.
    #[serde(alias = "Details", default)]
    pub details: FileDetails,
    /// Server-side file type.
    #[serde(rename = "type", alias = "Type", default)]
    pub kind: String,
}

/// Names of a stored file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDetails {
    /// Display name.
    #[serde(alias = "Name", default)]
    pub name: String,
    /// Name the file was uploaded with.
    #[serde(alias = "OriginalName", default)]
    pub original_name: String,
}

impl DeviceApi {
    fn api_url(&self, path: &str) -> String {
        format!("{}{API_BASE_PATH}{path}", self.server_url)
    }

    fn token_or_err(&self) -> Result<&SecretString, DeviceKitError> {
        self.session
            .token_secret()
            .ok_or_else(|| DeviceKitError::InvalidInput {
                attribute: "token".to_string(),
                reason: "session is not authenticated".to_string(),
            })
    }

    /// Uploads a thermal recording read from `reader`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader fails, the session has no token, or the
    /// server rejects the upload.
    pub async fn upload_recording<R>(&self, reader: R) -> Result<(), DeviceKitError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.upload_recording_as(RecordingType::ThermalRaw, reader)
            .await
    }

    /// Uploads a recording of the given kind as a two-part form: a JSON
    /// `data` field carrying the type tag, and the `file` content.
    ///
    /// # Errors
    ///
    /// See [`DeviceApi::upload_recording`].
    pub async fn upload_recording_as<R>(
        &self,
        kind: RecordingType,
        mut reader: R,
    ) -> Result<(), DeviceKitError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let token = self.token_or_err()?;
        let metadata = serde_json::to_string(&RecordingMetadata {
            kind: kind.to_string(),
        })?;

        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .await
            .map_err(|err| DeviceKitError::io("read recording", err))?;
        let size = content.len();

        let form = Form::new()
            .text("data", metadata)
            .part("file", Part::bytes(content).file_name("file"));

        let url = self.api_url("/recordings");
        self.request
            .handle(
                self.request
                    .authorized(Method::POST, &url, token)
                    .multipart(form),
            )
            .await?;
        tracing::info!(%kind, size, "uploaded recording");
        Ok(())
    }

    /// Reports an event. `details` must be a JSON object; the event times are
    /// added to it under `dateTimes` as RFC 3339 UTC strings.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceKitError::Serialization`] if `details` is not a JSON
    /// object, [`DeviceKitError::TemporaryApi`] on network failure, and the
    /// permanent/temporary split for rejected requests.
    pub async fn report_event(
        &self,
        details: &[u8],
        times: &[DateTime<Utc>],
    ) -> Result<(), DeviceKitError> {
        let token = self.token_or_err()?;
        let mut event: Map<String, Value> = serde_json::from_slice(details)?;
        let times = times
            .iter()
            .map(|time| Value::String(format_timestamp(time)))
            .collect();
        event.insert(EVENT_TIMES_KEY.to_string(), Value::Array(times));

        let url = self.api_url("/events");
        self.request
            .handle(
                self.request
                    .authorized(Method::POST, &url, token)
                    .json(&event),
            )
            .await?;
        tracing::debug!("reported event");
        Ok(())
    }

    /// Fetches metadata and a download token for `file_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is rejected or the body cannot be
    /// decoded.
    pub async fn get_file_details(&self, file_id: u64) -> Result<FileResponse, DeviceKitError> {
        let token = self.token_or_err()?;
        let url = self.api_url(&format!("/files/{file_id}"));
        let response = self
            .request
            .handle(self.request.authorized(Method::GET, &url, token))
            .await?;
        let body = response.bytes().await.map_err(|err| DeviceKitError::TemporaryApi {
            url,
            status: None,
            message: format!("body read failed: {err}"),
        })?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Downloads the file described by `file` to `dest`. Never overwrites:
    /// fails if `dest` already exists. A partially written file is removed
    /// when the download fails.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceKitError::FileExists`] if `dest` exists, an API error
    /// if the content request is rejected, and an I/O error if writing fails.
    pub async fn download_file(
        &self,
        file: &FileResponse,
        dest: impl AsRef<Path>,
    ) -> Result<(), DeviceKitError> {
        let dest = dest.as_ref();
        if tokio::fs::try_exists(dest)
            .await
            .map_err(|err| DeviceKitError::io(format!("stat {}", dest.display()), err))?
        {
            return Err(DeviceKitError::FileExists {
                path: dest.to_path_buf(),
            });
        }

        let url = self.api_url("/signedUrl");
        let response = self
            .request
            .handle(self.request.get(&url).query(&[("jwt", &file.jwt)]))
            .await?;

        let mut out = create_destination(dest).await?;

        let result = stream_to_file(response, &mut out, &url, dest).await;
        drop(out);
        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        let written = result?;
        tracing::info!(path = %dest.display(), written, "downloaded file");
        Ok(())
    }

    /// Fetches the recording schedule as raw bytes; the caller parses it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is rejected or the body cannot be read.
    pub async fn get_schedule(&self) -> Result<Vec<u8>, DeviceKitError> {
        let token = self.token_or_err()?;
        let url = self.api_url("/schedules");
        let response = self
            .request
            .handle(self.request.authorized(Method::GET, &url, token))
            .await?;
        let body = response.bytes().await.map_err(|err| DeviceKitError::TemporaryApi {
            url,
            status: None,
            message: format!("body read failed: {err}"),
        })?;
        Ok(body.to_vec())
    }
}

/// Creates `dest` only if nothing is there yet. Losing that race to another
/// writer is reported the same way as a destination that existed up front.
async fn create_destination(dest: &Path) -> Result<tokio::fs::File, DeviceKitError> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .await
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                DeviceKitError::FileExists {
                    path: dest.to_path_buf(),
                }
            } else {
                DeviceKitError::io(format!("create {}", dest.display()), err)
            }
        })
}

async fn stream_to_file(
    mut response: reqwest::Response,
    out: &mut tokio::fs::File,
    url: &str,
    dest: &Path,
) -> Result<u64, DeviceKitError> {
    let mut written = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| DeviceKitError::TemporaryApi {
            url: url.to_string(),
            status: None,
            message: format!("body read failed: {err}"),
        })?
    {
        out.write_all(&chunk)
            .await
            .map_err(|err| DeviceKitError::io(format!("write {}", dest.display()), err))?;
        written += chunk.len() as u64;
    }
    out.flush()
        .await
        .map_err(|err| DeviceKitError::io(format!("flush {}", dest.display()), err))?;
    Ok(written)
}

fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}
