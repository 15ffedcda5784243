//! HTTP transport to the archive server. The orchestrator only sees the
//! `ArchiveTransport` trait and the tagged `TransportError` discriminants, so
//! its control loop is testable with a scripted implementation.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use shared::protocol::{ErrorBody, ProcessMediaResponse, SyncResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server rate limited the request")]
    RateLimited { retry_after_seconds: Option<u64> },
    #[error("request timed out")]
    Timeout,
    #[error("credentials rejected: {0}")]
    Credential(String),
    #[error("transport failure: {0}")]
    Http(String),
}

#[async_trait]
pub trait ArchiveTransport: Send + Sync {
    async fn sync(&self) -> Result<SyncResponse, TransportError>;
    async fn process_media(&self, batch: u32) -> Result<ProcessMediaResponse, TransportError>;
}

pub struct HttpTransport {
    http: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(&self, response: Response) -> Result<Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_seconds = response
                    .json::<ErrorBody>()
                    .await
                    .ok()
                    .and_then(|body| body.retry_after_seconds);
                Err(TransportError::RateLimited {
                    retry_after_seconds,
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(TransportError::Credential(
                format!("server rejected credentials ({status})"),
            )),
            _ => {
                let detail = response
                    .json::<ErrorBody>()
                    .await
                    .map(|body| body.error)
                    .unwrap_or_else(|_| status.to_string());
                Err(TransportError::Http(detail))
            }
        }
    }
}

fn map_reqwest(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(error.to_string())
    }
}

#[async_trait]
impl ArchiveTransport for HttpTransport {
    async fn sync(&self) -> Result<SyncResponse, TransportError> {
        let url = format!("{}/sync", self.base_url);
        let response = self.http.post(url).send().await.map_err(map_reqwest)?;
        self.check(response)
            .await?
            .json::<SyncResponse>()
            .await
            .map_err(map_reqwest)
    }

    async fn process_media(&self, batch: u32) -> Result<ProcessMediaResponse, TransportError> {
        let url = format!("{}/process-media", self.base_url);
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "batch": batch }))
            .send()
            .await
            .map_err(map_reqwest)?;
        self.check(response)
            .await?
            .json::<ProcessMediaResponse>()
            .await
            .map_err(map_reqwest)
    }
}
