//! Media fetch worker. Each cycle claims at most one candidate row, resolves
//! it against the source, applies the archiving policy, and drives the row to
//! its next status through the guarded storage transitions. Every cycle ends
//! in a durable status, so a crashed worker leaves at worst one row stuck in
//! `processing` for an operator to re-queue.

use std::time::Duration;

use chrono::Utc;
use shared::{
    domain::{ChannelId, MediaStatus},
    error::ApiError,
    protocol::{MediaItemOutcome, ProcessMediaResponse},
};
use source::{SourceError, SourceMedia};
use storage::{StoredMediaObject, StoredMessage};
use tracing::{info, warn};

use crate::{from_source, internal, ApiContext};

pub const DEFAULT_BATCH: u32 = 1;
pub const MAX_BATCH: u32 = 10;

/// What the worker will and will not archive.
#[derive(Debug, Clone)]
pub struct MediaPolicy {
    /// Provider kind tags eligible for download.
    pub approved_kinds: Vec<String>,
    pub max_bytes: u64,
    pub download_timeout: Duration,
}

impl Default for MediaPolicy {
    fn default() -> Self {
        Self {
            approved_kinds: vec!["photo".to_string()],
            max_bytes: 10 * 1024 * 1024,
            download_timeout: Duration::from_secs(30),
        }
    }
}

impl MediaPolicy {
    pub fn approves_kind(&self, kind: &str) -> bool {
        self.approved_kinds.iter().any(|k| k == kind)
    }
}

pub type MediaRunOutcome = ProcessMediaResponse;

/// Runs up to `batch` worker cycles and reports the per-row outcomes plus the
/// backlog left behind. Stops early once the backlog is drained.
pub async fn process_media(
    ctx: &ApiContext,
    channel: &ChannelId,
    batch: Option<u32>,
) -> Result<MediaRunOutcome, ApiError> {
    let cycles = batch.unwrap_or(DEFAULT_BATCH).clamp(1, MAX_BATCH);
    let mut outcomes = Vec::new();

    for _ in 0..cycles {
        match run_one(ctx, channel).await? {
            Some(outcome) => outcomes.push(outcome),
            None => break,
        }
    }

    let remaining = ctx
        .storage
        .count_media_backlog(channel)
        .await
        .map_err(internal)?;

    info!(
        channel = %channel,
        processed = outcomes.len(),
        remaining,
        "media worker batch finished"
    );

    Ok(ProcessMediaResponse {
        success: true,
        remaining,
        outcomes,
    })
}

/// One claim-resolve-download-store cycle. `Ok(None)` means no candidate was
/// available (empty backlog, or a racing worker claimed the row first).
async fn run_one(
    ctx: &ApiContext,
    channel: &ChannelId,
) -> Result<Option<MediaItemOutcome>, ApiError> {
    let candidate = match ctx
        .storage
        .select_media_candidate(channel)
        .await
        .map_err(internal)?
    {
        Some(row) => row,
        None => return Ok(None),
    };

    if !ctx
        .storage
        .mark_media_processing(candidate.id)
        .await
        .map_err(internal)?
    {
        // Lost the claim race; nothing durable happened on our side.
        return Ok(None);
    }

    let resolved = match ctx.source.resolve_message(channel, &candidate.external_message_id).await {
        Ok(message) => message,
        Err(SourceError::NotFound(reason)) => {
            // Source no longer has the message; retryable in case it was a
            // transient provider inconsistency.
            ctx.storage.fail_media(candidate.id).await.map_err(internal)?;
            return Ok(Some(failure(&candidate, reason)));
        }
        Err(err) => {
            ctx.storage.fail_media(candidate.id).await.map_err(internal)?;
            return Err(from_source(err));
        }
    };

    let media = match resolved.media {
        Some(media) => media,
        None => {
            // The row claimed media at ingestion but the source now reports
            // none. Permanent: re-resolving will not grow an attachment.
            ctx.storage
                .skip_media(candidate.id, MediaStatus::Skipped)
                .await
                .map_err(internal)?;
            return Ok(Some(skip(&candidate, MediaStatus::Skipped, "no media on resolved message")));
        }
    };

    if !ctx.policy.approves_kind(&media.kind) {
        ctx.storage
            .skip_media(candidate.id, MediaStatus::SkippedType)
            .await
            .map_err(internal)?;
        return Ok(Some(skip(
            &candidate,
            MediaStatus::SkippedType,
            &format!("media kind '{}' not approved", media.kind),
        )));
    }

    if media.size > ctx.policy.max_bytes {
        ctx.storage
            .skip_media(candidate.id, MediaStatus::SkippedLarge)
            .await
            .map_err(internal)?;
        return Ok(Some(skip(
            &candidate,
            MediaStatus::SkippedLarge,
            &format!("{} bytes exceeds limit of {}", media.size, ctx.policy.max_bytes),
        )));
    }

    let bytes = match tokio::time::timeout(
        ctx.policy.download_timeout,
        ctx.source.download_media(channel, &candidate.external_message_id),
    )
    .await
    {
        Err(_) => {
            warn!(
                channel = %channel,
                message_id = candidate.id.0,
                timeout_secs = ctx.policy.download_timeout.as_secs(),
                "media download timed out"
            );
            ctx.storage.fail_media(candidate.id).await.map_err(internal)?;
            return Ok(Some(failure(&candidate, "download timed out".to_string())));
        }
        Ok(Err(err)) => {
            ctx.storage.fail_media(candidate.id).await.map_err(internal)?;
            return match err {
                SourceError::Timeout | SourceError::Network(_) | SourceError::NotFound(_) => {
                    Ok(Some(failure(&candidate, err.to_string())))
                }
                other => Err(from_source(other)),
            };
        }
        Ok(Ok(bytes)) => bytes,
    };

    if bytes.is_empty() {
        ctx.storage.fail_media(candidate.id).await.map_err(internal)?;
        return Ok(Some(failure(&candidate, "download produced no bytes".to_string())));
    }

    let blob_key = blob_key(&candidate, &media);
    if let Err(err) = ctx.blobs.put(&blob_key, &bytes, &media.mime_type).await {
        warn!(
            channel = %channel,
            message_id = candidate.id.0,
            key = %blob_key,
            "blob store write failed: {err:#}"
        );
        ctx.storage.fail_media(candidate.id).await.map_err(internal)?;
        return Ok(Some(failure(&candidate, "blob store write failed".to_string())));
    }

    let object = StoredMediaObject {
        blob_key: blob_key.clone(),
        file_type: media.file_type.clone(),
        file_size: bytes.len() as u64,
        mime_type: media.mime_type.clone(),
    };
    let completed = ctx
        .storage
        .complete_media(candidate.id, &blob_key, &object)
        .await
        .map_err(internal)?;
    if !completed {
        // A racing invocation finished this row first; report its result.
        return Ok(Some(MediaItemOutcome {
            message_id: candidate.id,
            status: MediaStatus::Completed,
            media_key: None,
            skipped: false,
            reason: Some("already completed by another worker".to_string()),
        }));
    }

    info!(
        channel = %channel,
        message_id = candidate.id.0,
        key = %blob_key,
        bytes = bytes.len(),
        "media archived"
    );

    Ok(Some(MediaItemOutcome {
        message_id: candidate.id,
        status: MediaStatus::Completed,
        media_key: Some(blob_key),
        skipped: false,
        reason: None,
    }))
}

/// Keys carry a millisecond stamp so a re-archived row never overwrites the
/// blob a concurrent reader may be streaming.
fn blob_key(candidate: &StoredMessage, media: &SourceMedia) -> String {
    format!(
        "channel/{}/{}-{}.{}",
        candidate.channel_id.as_str(),
        candidate.external_message_id.as_decimal(),
        Utc::now().timestamp_millis(),
        media.file_type
    )
}

fn failure(candidate: &StoredMessage, reason: String) -> MediaItemOutcome {
    MediaItemOutcome {
        message_id: candidate.id,
        status: MediaStatus::Failed,
        media_key: None,
        skipped: false,
        reason: Some(reason),
    }
}

fn skip(candidate: &StoredMessage, status: MediaStatus, reason: &str) -> MediaItemOutcome {
    MediaItemOutcome {
        message_id: candidate.id,
        status,
        media_key: None,
        skipped: true,
        reason: Some(reason.to_string()),
    }
}
