//! Operation layer of the archive: each public function is one short-lived,
//! stateless unit of work over the persisted store and the two external
//! collaborators. All cross-invocation coordination happens through the
//! message table, never through in-memory handoff.

use std::sync::Arc;
use std::time::Duration;

use shared::{
    domain::ChannelId,
    error::{ApiError, ErrorCode},
    protocol::{MediaInfo, MessageView, MessagesPage, Pagination},
};
use source::{BlobStore, MessageSource, SourceError};
use storage::{Storage, StoredMessage};

pub mod cursor;
pub mod media;
pub mod puller;

pub use cursor::{decide_plan, SyncPlan};
pub use media::{process_media, MediaPolicy, MediaRunOutcome};
pub use puller::{sync_channel, SyncOutcome};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub source: Arc<dyn MessageSource>,
    pub blobs: Arc<dyn BlobStore>,
    pub policy: MediaPolicy,
}

impl ApiContext {
    pub fn new(
        storage: Storage,
        source: Arc<dyn MessageSource>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            storage,
            source,
            blobs,
            policy: MediaPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: MediaPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.policy.download_timeout = timeout;
        self
    }
}

/// Paginated read of archived messages joined with media metadata,
/// newest first.
pub async fn list_messages(
    ctx: &ApiContext,
    channel: &ChannelId,
    limit: u32,
    offset: u32,
) -> Result<MessagesPage, ApiError> {
    let total = ctx
        .storage
        .count_messages(channel)
        .await
        .map_err(internal)?;
    let messages = ctx
        .storage
        .list_messages(channel, limit, offset)
        .await
        .map_err(internal)?;

    let has_more = u64::from(offset) + (messages.len() as u64) < total;
    Ok(MessagesPage {
        success: true,
        messages: messages.into_iter().map(message_view).collect(),
        pagination: Pagination {
            total,
            limit,
            offset,
            has_more,
        },
    })
}

pub fn message_view(message: StoredMessage) -> MessageView {
    MessageView {
        id: message.id,
        external_message_id: message.external_message_id,
        channel_id: message.channel_id,
        text: message.text,
        date: message.date,
        group_id: message.group_id,
        media_status: message.media_status,
        media_type: message.media_type,
        media_key: message.media_key,
        media: message.media.map(|m| MediaInfo {
            blob_key: m.blob_key,
            file_type: m.file_type,
            file_size: m.file_size,
            mime_type: m.mime_type,
        }),
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

/// Provider failures keep their discriminant across the boundary so the
/// orchestrator can branch without string-matching.
fn from_source(err: SourceError) -> ApiError {
    match err {
        SourceError::RateLimited {
            retry_after_seconds,
        } => ApiError::rate_limited("rate limited by message source", retry_after_seconds),
        SourceError::Credential(message) => ApiError::new(ErrorCode::Credential, message),
        SourceError::NotFound(message) => ApiError::new(ErrorCode::NotFound, message),
        SourceError::Timeout => ApiError::new(ErrorCode::Timeout, "message source call timed out"),
        SourceError::Network(message) => ApiError::new(ErrorCode::Internal, message),
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
