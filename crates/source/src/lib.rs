//! Contracts for the two external collaborators of the archive: the remote
//! message source and the blob store. Only their observable behavior matters
//! to the pipeline; concrete backends live behind these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use shared::domain::{ChannelId, ExternalId};

pub mod fs;
pub mod http;
pub mod memory;

pub use fs::FsBlobStore;
pub use http::HttpMessageSource;
pub use memory::{MemoryBlobStore, MemoryMessageSource};

/// One message as reported by the remote source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMessage {
    pub id: ExternalId,
    #[serde(default)]
    pub text: Option<String>,
    pub date: DateTime<Utc>,
    /// Album identifier when the message is part of a multi-item group.
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub media: Option<SourceMedia>,
}

impl SourceMessage {
    /// Pure service/system event: nothing archivable beyond the id itself.
    pub fn is_service_event(&self) -> bool {
        self.media.is_none() && self.text.as_deref().map_or(true, |t| t.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMedia {
    /// Provider media kind tag, e.g. "photo", "video", "document".
    pub kind: String,
    /// File extension for the stored blob, e.g. "jpg".
    pub file_type: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("rate limited by provider, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },
    #[error("credential rejected: {0}")]
    Credential(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("source call timed out")]
    Timeout,
    #[error("source network error: {0}")]
    Network(String),
}

/// Remote message service contract. `fetch_forward` returns chronological
/// ascending order, `fetch_backward` descending; both are windows the caller
/// must still boundary-check, since provider-side filtering is not trusted.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch_forward(
        &self,
        channel: &ChannelId,
        after: Option<&ExternalId>,
        limit: usize,
    ) -> Result<Vec<SourceMessage>, SourceError>;

    async fn fetch_backward(
        &self,
        channel: &ChannelId,
        before: &ExternalId,
        limit: usize,
    ) -> Result<Vec<SourceMessage>, SourceError>;

    async fn resolve_message(
        &self,
        channel: &ChannelId,
        id: &ExternalId,
    ) -> Result<SourceMessage, SourceError>;

    async fn download_media(
        &self,
        channel: &ChannelId,
        id: &ExternalId,
    ) -> Result<Vec<u8>, SourceError>;
}

/// Keyed object store holding downloaded media bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], mime_type: &str) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<(Vec<u8>, String)>>;
}
