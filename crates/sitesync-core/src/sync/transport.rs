//! Transports carrying the sync protocol to the remote authority.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::authority::AuthorityStore;
use crate::error::{Error, Result};
use crate::models::AppVersion;
use crate::util::{compact_text, is_http_url, normalize_text_option};

use super::protocol::{BatchRequest, BatchResponse, RemoteChange};

/// Header carrying the pushing installation's id
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Remote end of the sync protocol
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// `GET /version`
    async fn fetch_version(&self) -> Result<AppVersion>;

    /// `POST /sync/batch`
    async fn push_batch(&self, batch: &BatchRequest) -> Result<BatchResponse>;

    /// `GET /sync/changes?since=...`; `None` requests a full snapshot
    async fn pull_changes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteChange>>;

    /// `GET /healthz`
    async fn ping(&self) -> Result<()>;
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpSyncTransport {
    base_url: String,
    client: reqwest::Client,
    client_id: Option<String>,
}

impl HttpSyncTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(error.to_string()))?;
        Ok(Self {
            base_url,
            client,
            client_id: None,
        })
    }

    /// Send this id on every request (used for server-side rate limiting).
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn with_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("Accept", "application/json");
        match self.client_id.as_deref() {
            Some(id) => request.header(CLIENT_ID_HEADER, id),
            None => request,
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        response
            .json::<T>()
            .await
            .map_err(|error| Error::Network(format!("invalid response payload: {error}")))
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn fetch_version(&self) -> Result<AppVersion> {
        let response = self
            .with_headers(self.client.get(self.url("/version")))
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn push_batch(&self, batch: &BatchRequest) -> Result<BatchResponse> {
        let response = self
            .with_headers(self.client.post(self.url("/sync/batch")))
            .header(CLIENT_ID_HEADER, &batch.client_id)
            .json(batch)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn pull_changes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteChange>> {
        let mut request = self.with_headers(self.client.get(self.url("/sync/changes")));
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339_opts(SecondsFormat::Millis, true))]);
        }
        let response = request.send().await?;
        Self::read_json(response).await
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .with_headers(self.client.get(self.url("/healthz")))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

/// Payload problems are permanent; everything else may clear up on retry.
fn classify_status(status: StatusCode, body: &str) -> Error {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::PAYLOAD_TOO_LARGE => {
            Error::Validation(message)
        }
        StatusCode::CONFLICT => Error::Conflict(message),
        _ => Error::Network(message),
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::Config("server url must not be empty".to_string()))?;
    if is_http_url(&url) {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(Error::Config(
            "server url must include http:// or https://".to_string(),
        ))
    }
}

/// Transport that applies batches directly to an in-process authority.
///
/// Used by tests and the CLI's loopback mode; `set_reachable(false)` makes
/// every call fail with a network error.
#[derive(Clone)]
pub struct InProcessTransport {
    authority: AuthorityStore,
    reachable: Arc<AtomicBool>,
}

impl InProcessTransport {
    pub fn new(authority: AuthorityStore) -> Self {
        Self {
            authority,
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn authority(&self) -> &AuthorityStore {
        &self.authority
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Network("authority unreachable".to_string()))
        }
    }
}

#[async_trait]
impl SyncTransport for InProcessTransport {
    async fn fetch_version(&self) -> Result<AppVersion> {
        self.check_reachable()?;
        Ok(self.authority.version())
    }

    async fn push_batch(&self, batch: &BatchRequest) -> Result<BatchResponse> {
        self.check_reachable()?;
        self.authority.apply_batch(batch).await
    }

    async fn pull_changes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteChange>> {
        self.check_reachable()?;
        self.authority.changes_since(since).await
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }
}
