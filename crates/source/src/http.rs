//! `reqwest`-backed message source speaking to an authenticated gateway that
//! fronts the real provider. The gateway owns sessions and credentials; this
//! client only translates its observable responses into `SourceError`s.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};

use shared::domain::{ChannelId, ExternalId};

use crate::{MessageSource, SourceError, SourceMessage};

const DEFAULT_RETRY_AFTER_SECONDS: u64 = 30;

pub struct HttpMessageSource {
    http: Client,
    base_url: String,
}

impl HttpMessageSource {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn check(&self, response: Response) -> Result<Response, SourceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_seconds = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECONDS);
                Err(SourceError::RateLimited {
                    retry_after_seconds,
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SourceError::Credential(
                format!("gateway rejected session ({status})"),
            )),
            StatusCode::NOT_FOUND => Err(SourceError::NotFound(format!(
                "gateway returned 404 for {}",
                response.url()
            ))),
            _ => Err(SourceError::Network(format!(
                "gateway returned {status} for {}",
                response.url()
            ))),
        }
    }

    async fn fetch_window(
        &self,
        channel: &ChannelId,
        boundary_param: &str,
        boundary: Option<&ExternalId>,
        limit: usize,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        let url = format!("{}/channels/{}/messages", self.base_url, channel);
        let mut request = self.http.get(url).query(&[("limit", limit.to_string())]);
        if let Some(boundary) = boundary {
            request = request.query(&[(boundary_param, boundary.as_decimal())]);
        }
        let response = self.check(request.send().await.map_err(map_reqwest)?).await?;
        response
            .json::<Vec<SourceMessage>>()
            .await
            .map_err(map_reqwest)
    }
}

#[async_trait]
impl MessageSource for HttpMessageSource {
    async fn fetch_forward(
        &self,
        channel: &ChannelId,
        after: Option<&ExternalId>,
        limit: usize,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        self.fetch_window(channel, "after", after, limit).await
    }

    async fn fetch_backward(
        &self,
        channel: &ChannelId,
        before: &ExternalId,
        limit: usize,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        self.fetch_window(channel, "before", Some(before), limit)
            .await
    }

    async fn resolve_message(
        &self,
        channel: &ChannelId,
        id: &ExternalId,
    ) -> Result<SourceMessage, SourceError> {
        let url = format!("{}/channels/{}/messages/{}", self.base_url, channel, id);
        let response = self
            .check(self.http.get(url).send().await.map_err(map_reqwest)?)
            .await?;
        response.json::<SourceMessage>().await.map_err(map_reqwest)
    }

    async fn download_media(
        &self,
        channel: &ChannelId,
        id: &ExternalId,
    ) -> Result<Vec<u8>, SourceError> {
        let url = format!(
            "{}/channels/{}/messages/{}/media",
            self.base_url, channel, id
        );
        let response = self
            .check(self.http.get(url).send().await.map_err(map_reqwest)?)
            .await?;
        let bytes = response.bytes().await.map_err(map_reqwest)?;
        Ok(bytes.to_vec())
    }
}

fn map_reqwest(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout
    } else {
        SourceError::Network(err.to_string())
    }
}
