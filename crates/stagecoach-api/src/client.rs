use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use stagecoach_core::{Build, GameCredentials, Upload, UpgradePath};

use crate::urls::{ApiEndpoints, SourceUrlParams};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_USER_AGENT: &str = concat!("stagecoach/", env!("CARGO_PKG_VERSION"));

/// Remote calls an install operation makes against the package server.
pub trait PackageApi: Send + Sync {
    /// Opens a download session for `game_id`; the returned id is attached to
    /// every source URL of the operation.
    fn new_download_session(&self, game_id: i64, download_key: Option<i64>) -> Result<String>;

    fn find_upgrade(
        &self,
        current_build_id: i64,
        upload_id: i64,
        download_key: Option<i64>,
    ) -> Result<UpgradePath>;

    fn source_url(&self, params: &SourceUrlParams<'_>) -> String;
}

/// Builds a `PackageApi` for the credentials of one operation.
pub trait ApiConnector: Send + Sync {
    fn connect(&self, credentials: &GameCredentials) -> Result<Arc<dyn PackageApi>>;
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("API request to {endpoint} failed with status {status}: {message}")]
    Status {
        endpoint: String,
        status: u16,
        message: String,
    },
    #[error("API response from {endpoint} could not be decoded: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub server: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            server: stagecoach_core::DEFAULT_SERVER.to_string(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ApiSettings {
    pub fn build_client(&self) -> Result<Client> {
        Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .build()
            .context("failed to create HTTP client")
    }
}

#[derive(Debug, Deserialize)]
struct DownloadSessionResponse {
    uuid: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

/// `PackageApi` over the server's HTTP API.
pub struct HttpApiClient {
    client: Client,
    endpoints: ApiEndpoints,
}

impl HttpApiClient {
    pub fn new(settings: &ApiSettings, credentials: &GameCredentials) -> Result<Self> {
        let server = match credentials.server.as_deref().map(str::trim) {
            Some(server) if !server.is_empty() => server,
            _ => settings.server.as_str(),
        };
        Ok(Self {
            client: settings.build_client()?,
            endpoints: ApiEndpoints::new(server, &credentials.api_key),
        })
    }

    pub fn endpoints(&self) -> &ApiEndpoints {
        &self.endpoints
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!(url = %self.endpoints.redact(url), "GET");
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to reach {}", self.endpoints.redact(url)))?;
        decode_response(&self.endpoints.redact(url), response)
    }

    fn post_json<T: DeserializeOwned>(&self, url: &str, form: &[(&str, String)]) -> Result<T> {
        debug!(url = %self.endpoints.redact(url), "POST");
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .with_context(|| format!("failed to reach {}", self.endpoints.redact(url)))?;
        decode_response(&self.endpoints.redact(url), response)
    }
}

impl PackageApi for HttpApiClient {
    fn new_download_session(&self, game_id: i64, download_key: Option<i64>) -> Result<String> {
        let mut form = Vec::new();
        if let Some(key) = download_key {
            form.push(("download_key_id", key.to_string()));
        }
        let response: DownloadSessionResponse =
            self.post_json(&self.endpoints.download_sessions(game_id), &form)?;
        Ok(response.uuid)
    }

    fn find_upgrade(
        &self,
        current_build_id: i64,
        upload_id: i64,
        download_key: Option<i64>,
    ) -> Result<UpgradePath> {
        self.get_json(&self.endpoints.upgrade_path(upload_id, current_build_id, download_key))
    }

    fn source_url(&self, params: &SourceUrlParams<'_>) -> String {
        self.endpoints.source_url(params)
    }
}

/// Connects to the HTTP API with shared settings; per-operation credentials
/// may override the server.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    settings: ApiSettings,
}

impl HttpConnector {
    pub fn new(settings: ApiSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ApiSettings {
        &self.settings
    }
}

impl ApiConnector for HttpConnector {
    fn connect(&self, credentials: &GameCredentials) -> Result<Arc<dyn PackageApi>> {
        Ok(Arc::new(HttpApiClient::new(&self.settings, credentials)?))
    }
}

pub(crate) fn decode_response<T: DeserializeOwned>(endpoint: &str, response: Response) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("failed to read response from {endpoint}"))?;
    decode_body(endpoint, status.as_u16(), &body)
}

pub(crate) fn decode_body<T: DeserializeOwned>(endpoint: &str, status: u16, body: &str) -> Result<T> {
    let errors = serde_json::from_str::<ErrorResponse>(body)
        .map(|parsed| parsed.errors)
        .unwrap_or_default();
    if !(200..300).contains(&status) || !errors.is_empty() {
        let message = if errors.is_empty() {
            body.trim().chars().take(200).collect()
        } else {
            errors.join("; ")
        };
        return Err(ApiError::Status {
            endpoint: endpoint.to_string(),
            status,
            message,
        }
        .into());
    }

    serde_json::from_str(body).map_err(|source| {
        ApiError::Decode {
            endpoint: endpoint.to_string(),
            source,
        }
        .into()
    })
}

/// Convenience for callers that only hold an upload and optional build.
pub fn source_url_for(
    api: &dyn PackageApi,
    upload: &Upload,
    build: Option<&Build>,
    download_session_id: Option<&str>,
    download_key: Option<i64>,
) -> String {
    api.source_url(&SourceUrlParams {
        upload_id: upload.id,
        build_id: build.map(|build| build.id),
        download_session_id,
        download_key,
    })
}
