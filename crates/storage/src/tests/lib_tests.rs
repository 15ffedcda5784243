use super::*;
use chrono::TimeZone;

fn channel() -> ChannelId {
    ChannelId::parse("1001234567890").expect("channel id")
}

fn record(id: u64, text: Option<&str>, status: MediaStatus) -> MessageRecord {
    MessageRecord {
        external_message_id: ExternalId::from_u64(id),
        channel_id: channel(),
        text: text.map(str::to_string),
        date: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        group_id: None,
        media_status: status,
        media_type: match status {
            MediaStatus::None => None,
            _ => Some("photo".to_string()),
        },
    }
}

fn object(key: &str) -> StoredMediaObject {
    StoredMediaObject {
        blob_key: key.to_string(),
        file_type: "jpg".to_string(),
        file_size: 2048,
        mime_type: "image/jpeg".to_string(),
    }
}

async fn setup() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

#[tokio::test]
async fn opening_a_file_database_creates_missing_parent_dirs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nested/data/archive.db");
    let url = format!("sqlite://{}", db_path.display());

    let storage = Storage::new(&url).await.expect("db");
    storage.health_check().await.expect("ping");

    assert!(db_path.parent().expect("parent").exists());
}

#[tokio::test]
async fn upsert_is_idempotent_and_refreshes_mutable_fields() {
    let storage = setup().await;

    let first = storage
        .upsert_message(&record(101, Some("hello"), MediaStatus::None))
        .await
        .expect("insert");
    let second = storage
        .upsert_message(&record(101, Some("hello, edited"), MediaStatus::None))
        .await
        .expect("update");

    assert_eq!(first, second);
    assert_eq!(storage.count_messages(&channel()).await.expect("count"), 1);

    let row = storage
        .get_message(first)
        .await
        .expect("get")
        .expect("row exists");
    assert_eq!(row.text.as_deref(), Some("hello, edited"));
}

#[tokio::test]
async fn upsert_seeds_pending_once_media_is_first_observed() {
    let storage = setup().await;

    let id = storage
        .upsert_message(&record(102, Some("text only at first"), MediaStatus::None))
        .await
        .expect("insert");
    let row = storage.get_message(id).await.expect("get").expect("row");
    assert_eq!(row.media_status, MediaStatus::None);

    storage
        .upsert_message(&record(102, Some("now with photo"), MediaStatus::Pending))
        .await
        .expect("re-ingest");
    let row = storage.get_message(id).await.expect("get").expect("row");
    assert_eq!(row.media_status, MediaStatus::Pending);
    assert_eq!(row.media_type.as_deref(), Some("photo"));
}

#[tokio::test]
async fn upsert_never_regresses_a_completed_row() {
    let storage = setup().await;

    let id = storage
        .upsert_message(&record(103, Some("with media"), MediaStatus::Pending))
        .await
        .expect("insert");
    assert!(storage
        .complete_media(id, "channel/1/103-1.jpg", &object("channel/1/103-1.jpg"))
        .await
        .expect("complete"));

    storage
        .upsert_message(&record(103, Some("edited later"), MediaStatus::Pending))
        .await
        .expect("re-ingest");

    let row = storage.get_message(id).await.expect("get").expect("row");
    assert_eq!(row.media_status, MediaStatus::Completed);
    assert_eq!(row.media_key.as_deref(), Some("channel/1/103-1.jpg"));
    assert_eq!(row.text.as_deref(), Some("edited later"));
}

#[tokio::test]
async fn cursor_orders_ids_numerically_beyond_i64() {
    let storage = setup().await;

    for raw in ["99", "100", "92233720368547758080"] {
        let mut rec = record(1, Some("x"), MediaStatus::None);
        rec.external_message_id = ExternalId::parse(raw).expect("id");
        storage.upsert_message(&rec).await.expect("insert");
    }

    let cursor = storage
        .channel_cursor(&channel())
        .await
        .expect("cursor")
        .expect("non-empty");
    assert_eq!(cursor.earliest.as_decimal(), "99");
    assert_eq!(cursor.latest.as_decimal(), "92233720368547758080");
    assert_eq!(cursor.count, 3);
    assert!(!cursor.is_contiguous());
}

#[tokio::test]
async fn empty_channel_has_no_cursor() {
    let storage = setup().await;
    assert!(storage
        .channel_cursor(&channel())
        .await
        .expect("cursor")
        .is_none());
}

#[tokio::test]
async fn candidate_selection_prefers_pending_then_newest() {
    let storage = setup().await;

    let failed = storage
        .upsert_message(&record(201, Some("old failed"), MediaStatus::Pending))
        .await
        .expect("insert");
    assert!(storage.fail_media(failed).await.expect("fail"));
    let older_pending = storage
        .upsert_message(&record(202, Some("older pending"), MediaStatus::Pending))
        .await
        .expect("insert");
    let newest_pending = storage
        .upsert_message(&record(203, Some("newest pending"), MediaStatus::Pending))
        .await
        .expect("insert");

    let pick = storage
        .select_media_candidate(&channel())
        .await
        .expect("select")
        .expect("candidate");
    assert_eq!(pick.id, newest_pending);

    assert!(storage
        .complete_media(newest_pending, "k1", &object("k1"))
        .await
        .expect("complete"));
    let pick = storage
        .select_media_candidate(&channel())
        .await
        .expect("select")
        .expect("candidate");
    assert_eq!(pick.id, older_pending);

    assert!(storage
        .complete_media(older_pending, "k2", &object("k2"))
        .await
        .expect("complete"));
    let pick = storage
        .select_media_candidate(&channel())
        .await
        .expect("select")
        .expect("candidate");
    assert_eq!(pick.id, failed);
    assert_eq!(storage.count_media_backlog(&channel()).await.expect("n"), 1);
}

#[tokio::test]
async fn skipped_rows_are_never_reselected() {
    let storage = setup().await;

    let id = storage
        .upsert_message(&record(301, None, MediaStatus::Pending))
        .await
        .expect("insert");
    assert!(storage
        .skip_media(id, MediaStatus::SkippedType)
        .await
        .expect("skip"));

    assert!(storage
        .select_media_candidate(&channel())
        .await
        .expect("select")
        .is_none());
    assert_eq!(storage.count_media_backlog(&channel()).await.expect("n"), 0);

    // Terminal: a later fail/skip attempt must not move the row.
    assert!(!storage.fail_media(id).await.expect("fail"));
    assert!(!storage
        .skip_media(id, MediaStatus::Skipped)
        .await
        .expect("skip"));
    let row = storage.get_message(id).await.expect("get").expect("row");
    assert_eq!(row.media_status, MediaStatus::SkippedType);
    assert!(row.media_key.is_none());
}

#[tokio::test]
async fn complete_media_is_noop_on_already_completed_row() {
    let storage = setup().await;

    let id = storage
        .upsert_message(&record(302, None, MediaStatus::Pending))
        .await
        .expect("insert");
    assert!(storage.mark_media_processing(id).await.expect("claim"));
    // Second claim loses the race.
    assert!(!storage.mark_media_processing(id).await.expect("claim"));

    assert!(storage
        .complete_media(id, "first-key", &object("first-key"))
        .await
        .expect("complete"));
    assert!(!storage
        .complete_media(id, "second-key", &object("second-key"))
        .await
        .expect("complete"));

    let row = storage.get_message(id).await.expect("get").expect("row");
    assert_eq!(row.media_status, MediaStatus::Completed);
    assert_eq!(row.media_key.as_deref(), Some("first-key"));
    let media = row.media.expect("media object");
    assert_eq!(media.blob_key, "first-key");
}

#[tokio::test]
async fn media_key_is_set_iff_completed() {
    let storage = setup().await;

    let id = storage
        .upsert_message(&record(303, None, MediaStatus::Pending))
        .await
        .expect("insert");
    assert!(storage.fail_media(id).await.expect("fail"));
    let row = storage.get_message(id).await.expect("get").expect("row");
    assert_eq!(row.media_status, MediaStatus::Failed);
    assert!(row.media_key.is_none());

    assert!(storage
        .complete_media(id, "key", &object("key"))
        .await
        .expect("complete"));
    let row = storage.get_message(id).await.expect("get").expect("row");
    assert_eq!(row.media_status, MediaStatus::Completed);
    assert!(row.media_key.is_some());
}

#[tokio::test]
async fn list_messages_pages_newest_first() {
    let storage = setup().await;

    for id in 1..=5u64 {
        storage
            .upsert_message(&record(id, Some("m"), MediaStatus::None))
            .await
            .expect("insert");
    }

    let page = storage
        .list_messages(&channel(), 2, 0)
        .await
        .expect("page");
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].external_message_id.as_decimal(), "5");
    assert_eq!(page[1].external_message_id.as_decimal(), "4");

    let page = storage
        .list_messages(&channel(), 2, 4)
        .await
        .expect("page");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].external_message_id.as_decimal(), "1");
    assert_eq!(storage.count_messages(&channel()).await.expect("count"), 5);
}
