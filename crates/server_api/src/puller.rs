//! One bounded cursor-tracker + puller + persister cycle. Pulls a window from
//! the source, re-checks every boundary client-side (provider filtering is
//! not trusted), and upserts each message idempotently.

use shared::{
    domain::{ChannelId, MediaStatus, SyncMode},
    error::ApiError,
    protocol::SyncResponse,
};
use source::SourceMessage;
use storage::MessageRecord;
use tracing::{info, warn};

use crate::{cursor::decide_plan, from_source, internal, message_view, ApiContext, SyncPlan};

/// Forward windows are larger: already-seen ranges rarely carry media that
/// needs synchronous classification, unlike unseen backfill history.
pub const FORWARD_WINDOW: usize = 50;
pub const BACKFILL_WINDOW: usize = 25;

/// Sentinel stored for pure service/system events so the cursor still
/// advances through batches with nothing archivable.
pub const SERVICE_PLACEHOLDER_TEXT: &str = "[service message]";

pub type SyncOutcome = SyncResponse;

pub async fn sync_channel(ctx: &ApiContext, channel: &ChannelId) -> Result<SyncOutcome, ApiError> {
    let cursor = ctx
        .storage
        .channel_cursor(channel)
        .await
        .map_err(internal)?;
    let plan = decide_plan(cursor.as_ref());
    let mode = plan.mode();

    let window = match &plan {
        SyncPlan::Forward { after } => ctx
            .source
            .fetch_forward(channel, after.as_ref(), FORWARD_WINDOW)
            .await
            .map_err(from_source)?,
        SyncPlan::Backfill { before } => ctx
            .source
            .fetch_backward(channel, before, BACKFILL_WINDOW)
            .await
            .map_err(from_source)?,
    };

    let mut synced = 0u64;
    let mut media = 0u64;
    let mut messages = Vec::new();

    for message in window {
        if !strictly_beyond_boundary(&plan, &message) {
            // The source leaked an item at or inside the known range; the
            // window is no longer trustworthy past this point.
            warn!(
                channel = %channel,
                external_id = %message.id,
                mode = mode.as_str(),
                "source returned message at or inside boundary; stopping window"
            );
            break;
        }

        let has_media = message.media.is_some();
        let record = to_record(channel, message);
        let row_id = ctx.storage.upsert_message(&record).await.map_err(internal)?;
        synced += 1;
        if has_media {
            media += 1;
        }

        if let Some(stored) = ctx.storage.get_message(row_id).await.map_err(internal)? {
            messages.push(message_view(stored));
        }
    }

    info!(
        channel = %channel,
        mode = mode.as_str(),
        synced,
        media,
        "sync cycle finished"
    );

    Ok(SyncResponse {
        success: true,
        synced,
        media,
        has_new_messages: mode == SyncMode::Forward && synced > 0,
        mode,
        cooldown_seconds: if media > 0 { 1 } else { 0 },
        messages,
    })
}

fn strictly_beyond_boundary(plan: &SyncPlan, message: &SourceMessage) -> bool {
    match plan {
        SyncPlan::Forward { after: None } => true,
        SyncPlan::Forward { after: Some(after) } => &message.id > after,
        SyncPlan::Backfill { before } => &message.id < before,
    }
}

fn to_record(channel: &ChannelId, message: SourceMessage) -> MessageRecord {
    let text = if message.is_service_event() {
        Some(SERVICE_PLACEHOLDER_TEXT.to_string())
    } else {
        message.text
    };
    let (media_status, media_type) = match &message.media {
        Some(media) => (MediaStatus::Pending, Some(media.kind.clone())),
        None => (MediaStatus::None, None),
    };

    MessageRecord {
        external_message_id: message.id,
        channel_id: channel.clone(),
        text,
        date: message.date,
        group_id: message.group_id,
        media_status,
        media_type,
    }
}
