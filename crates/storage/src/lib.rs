use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ChannelCursor, ChannelId, ExternalId, MediaStatus, MessageRowId};

/// Shared persisted state for the whole pipeline. There is no channel lock:
/// idempotent upserts and guarded status transitions are the only race
/// mitigation between overlapping invocations.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageRowId,
    pub external_message_id: ExternalId,
    pub channel_id: ChannelId,
    pub text: Option<String>,
    pub date: DateTime<Utc>,
    pub group_id: Option<String>,
    pub media_status: MediaStatus,
    pub media_type: Option<String>,
    pub media_key: Option<String>,
    pub media: Option<StoredMediaObject>,
}

#[derive(Debug, Clone)]
pub struct StoredMediaObject {
    pub blob_key: String,
    pub file_type: String,
    pub file_size: u64,
    pub mime_type: String,
}

/// One message as handed to the upsert. `media_status` here is only the
/// *initial* status; it never overwrites an existing non-`none` status.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub external_message_id: ExternalId,
    pub channel_id: ChannelId,
    pub text: Option<String>,
    pub date: DateTime<Utc>,
    pub group_id: Option<String>,
    pub media_status: MediaStatus,
    pub media_type: Option<String>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                external_message_id TEXT NOT NULL,
                channel_id          TEXT NOT NULL,
                text                TEXT,
                date                TEXT NOT NULL,
                group_id            TEXT,
                media_status        TEXT NOT NULL DEFAULT 'none',
                media_type          TEXT,
                media_key           TEXT,
                UNIQUE (external_message_id, channel_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure messages table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL UNIQUE REFERENCES messages(id),
                blob_key   TEXT NOT NULL,
                file_type  TEXT NOT NULL,
                file_size  INTEGER NOT NULL,
                mime_type  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure media table exists")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_media_backlog
             ON messages (channel_id, media_status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert-or-update keyed on `(external_message_id, channel_id)`. Mutable
    /// fields (text, date, group id) always reflect the latest application;
    /// `media_status` is only seeded none->initial the first time media is
    /// observed and never regresses, and `media_key` is left untouched.
    /// Returns the row id on both paths.
    pub async fn upsert_message(&self, record: &MessageRecord) -> Result<MessageRowId> {
        let rec = sqlx::query(
            r#"
            INSERT INTO messages
                (external_message_id, channel_id, text, date, group_id, media_status, media_type)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (external_message_id, channel_id) DO UPDATE SET
                text = excluded.text,
                date = excluded.date,
                group_id = excluded.group_id,
                media_status = CASE
                    WHEN messages.media_status = 'none' THEN excluded.media_status
                    ELSE messages.media_status
                END,
                media_type = COALESCE(messages.media_type, excluded.media_type)
            RETURNING id
            "#,
        )
        .bind(record.external_message_id.as_decimal())
        .bind(record.channel_id.as_str())
        .bind(record.text.as_deref())
        .bind(record.date)
        .bind(record.group_id.as_deref())
        .bind(record.media_status.as_str())
        .bind(record.media_type.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageRowId(rec.get::<i64, _>(0)))
    }

    /// Derived `{earliest, latest, count}` for a channel. Ids are stored as
    /// normalized decimal strings, so `(LENGTH, value)` ordering is numeric
    /// ordering without ever touching native integer types.
    pub async fn channel_cursor(&self, channel: &ChannelId) -> Result<Option<ChannelCursor>> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT external_message_id FROM messages WHERE channel_id = ?1
                 ORDER BY LENGTH(external_message_id) ASC, external_message_id ASC LIMIT 1),
                (SELECT external_message_id FROM messages WHERE channel_id = ?1
                 ORDER BY LENGTH(external_message_id) DESC, external_message_id DESC LIMIT 1),
                (SELECT COUNT(*) FROM messages WHERE channel_id = ?1)
            "#,
        )
        .bind(channel.as_str())
        .fetch_one(&self.pool)
        .await?;

        let count = row.get::<i64, _>(2);
        if count == 0 {
            return Ok(None);
        }
        let earliest = parse_external_id(row.get::<String, _>(0))?;
        let latest = parse_external_id(row.get::<String, _>(1))?;
        Ok(Some(ChannelCursor {
            earliest,
            latest,
            count: count as u64,
        }))
    }

    pub async fn get_message(&self, id: MessageRowId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "{MESSAGE_SELECT} WHERE m.id = ? LIMIT 1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_message_row).transpose()
    }

    /// Newest-first page of archived messages with joined media metadata.
    pub async fn list_messages(
        &self,
        channel: &ChannelId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "{MESSAGE_SELECT}
             WHERE m.channel_id = ?
             ORDER BY LENGTH(m.external_message_id) DESC, m.external_message_id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(channel.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(map_message_row).collect()
    }

    pub async fn count_messages(&self, channel: &ChannelId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE channel_id = ?")
            .bind(channel.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Next media work item: `pending` before `failed`, newest row first so a
    /// freshly ingested backlog drains before deep history.
    pub async fn select_media_candidate(
        &self,
        channel: &ChannelId,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "{MESSAGE_SELECT}
             WHERE m.channel_id = ? AND m.media_status IN ('pending', 'failed')
             ORDER BY CASE m.media_status WHEN 'pending' THEN 0 ELSE 1 END, m.id DESC
             LIMIT 1"
        ))
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_message_row).transpose()
    }

    pub async fn count_media_backlog(&self, channel: &ChannelId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE channel_id = ? AND media_status IN ('pending', 'failed')",
        )
        .bind(channel.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Advisory in-flight marker. Returns false when the row was already
    /// claimed or finished, in which case the caller must not proceed.
    pub async fn mark_media_processing(&self, id: MessageRowId) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE messages SET media_status = 'processing'
             WHERE id = ? AND media_status IN ('pending', 'failed')",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Terminal success: sets `media_key`, status `completed`, and replaces
    /// the media object record in one transaction. A row that already reached
    /// `completed` is left untouched (racing invocation acted first).
    pub async fn complete_media(
        &self,
        id: MessageRowId,
        blob_key: &str,
        object: &StoredMediaObject,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE messages SET media_status = 'completed', media_key = ?
             WHERE id = ? AND media_status != 'completed'",
        )
        .bind(blob_key)
        .bind(id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO media (message_id, blob_key, file_type, file_size, mime_type)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (message_id) DO UPDATE SET
                blob_key = excluded.blob_key,
                file_type = excluded.file_type,
                file_size = excluded.file_size,
                mime_type = excluded.mime_type",
        )
        .bind(id.0)
        .bind(&object.blob_key)
        .bind(&object.file_type)
        .bind(i64::try_from(object.file_size).unwrap_or(i64::MAX))
        .bind(&object.mime_type)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Retryable failure. Guarded so a terminal row is never dragged back.
    pub async fn fail_media(&self, id: MessageRowId) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE messages SET media_status = 'failed'
             WHERE id = ? AND media_status IN ('pending', 'processing', 'failed')",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Policy-based terminal skip; the row is never re-selected afterwards.
    pub async fn skip_media(&self, id: MessageRowId, status: MediaStatus) -> Result<bool> {
        if !matches!(
            status,
            MediaStatus::Skipped | MediaStatus::SkippedType | MediaStatus::SkippedLarge
        ) {
            return Err(anyhow!(
                "skip_media called with non-skip status '{}'",
                status.as_str()
            ));
        }
        let updated = sqlx::query(
            "UPDATE messages SET media_status = ?
             WHERE id = ? AND media_status IN ('pending', 'processing', 'failed')",
        )
        .bind(status.as_str())
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.external_message_id, m.channel_id, m.text, m.date, \
     m.group_id, m.media_status, m.media_type, m.media_key, \
     md.blob_key, md.file_type, md.file_size, md.mime_type \
     FROM messages m LEFT JOIN media md ON md.message_id = m.id";

fn map_message_row(row: SqliteRow) -> Result<StoredMessage> {
    let media_status_raw = row.get::<String, _>(6);
    let media_status = MediaStatus::parse(&media_status_raw)
        .ok_or_else(|| anyhow!("unknown media_status '{media_status_raw}' in messages row"))?;

    let media = row
        .get::<Option<String>, _>(9)
        .map(|blob_key| StoredMediaObject {
            blob_key,
            file_type: row.get::<String, _>(10),
            file_size: row.get::<i64, _>(11).max(0) as u64,
            mime_type: row.get::<String, _>(12),
        });

    Ok(StoredMessage {
        id: MessageRowId(row.get::<i64, _>(0)),
        external_message_id: parse_external_id(row.get::<String, _>(1))?,
        channel_id: ChannelId::parse(&row.get::<String, _>(2))
            .map_err(|e| anyhow!("corrupt channel_id in messages row: {e}"))?,
        text: row.get::<Option<String>, _>(3),
        date: row.get::<DateTime<Utc>, _>(4),
        group_id: row.get::<Option<String>, _>(5),
        media_status,
        media_type: row.get::<Option<String>, _>(7),
        media_key: row.get::<Option<String>, _>(8),
        media,
    })
}

fn parse_external_id(raw: String) -> Result<ExternalId> {
    ExternalId::parse(&raw).map_err(|e| anyhow!("corrupt external_message_id in store: {e}"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
