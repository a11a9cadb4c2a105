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
use tokio::sync::broadcast;

use shared::{
    domain::{ChannelId, ChannelSummary, MessageId, UserId, UserProfile},
    protocol::{MessageRow, NewMessage, ReadReceiptRow, StoreChange},
};

const CHANGE_FEED_CAPACITY: usize = 1024;
const LOCAL_BLOB_SCHEME: &str = "local-blob://";

/// Single-node chat store: SQLite tables plus an in-process change feed.
///
/// Every successful mutation of messages or read receipts is published on the
/// change feed after the write commits. Subscribers receive changes for all
/// channels and filter by [`StoreChange::channel_id`].
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<StoreChange>,
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub bucket: String,
    pub path: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // In-memory databases live and die with their connection.
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let max_connections = if in_memory {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self { pool, changes })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn publish(&self, change: StoreChange) {
        // No subscribers is not an error for the writer.
        let _ = self.changes.send(change);
    }

    pub async fn upsert_user(
        &self,
        user_id: &UserId,
        display_name: &str,
        photo_url: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, display_name, photo_url) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET display_name=excluded.display_name, photo_url=excluded.photo_url",
        )
        .bind(user_id.as_str())
        .bind(display_name)
        .bind(photo_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_profiles(&self, user_ids: &[UserId]) -> Result<Vec<UserProfile>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; user_ids.len()].join(", ");
        let sql = format!(
            "SELECT id, display_name, photo_url FROM users WHERE id IN ({placeholders}) ORDER BY id ASC"
        );
        let mut query = sqlx::query(&sql);
        for user_id in user_ids {
            query = query.bind(user_id.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(profile_from_row).collect())
    }

    pub async fn create_channel(&self, name: &str, color: &str) -> Result<ChannelId> {
        let channel_id = ChannelId::new(uuid::Uuid::new_v4().to_string());
        sqlx::query("INSERT INTO channels (id, name, color) VALUES (?, ?, ?)")
            .bind(channel_id.as_str())
            .bind(name)
            .bind(color)
            .execute(&self.pool)
            .await?;
        Ok(channel_id)
    }

    pub async fn rename_channel(&self, channel_id: &ChannelId, name: &str) -> Result<bool> {
        let updated = sqlx::query("UPDATE channels SET name = ? WHERE id = ?")
            .bind(name)
            .bind(channel_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    pub async fn add_channel_member(&self, channel_id: &ChannelId, user_id: &UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO channel_members (channel_id, user_id) VALUES (?, ?)
             ON CONFLICT(channel_id, user_id) DO NOTHING",
        )
        .bind(channel_id.as_str())
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_channel_member(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
    ) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM channel_members WHERE channel_id = ? AND user_id = ?")
            .bind(channel_id.as_str())
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    pub async fn load_channel(&self, channel_id: &ChannelId) -> Result<Option<ChannelSummary>> {
        let row = sqlx::query("SELECT id, name, color FROM channels WHERE id = ?")
            .bind(channel_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let members = sqlx::query(
            "SELECT user_id FROM channel_members WHERE channel_id = ? ORDER BY user_id ASC",
        )
        .bind(channel_id.as_str())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| UserId(r.get::<String, _>(0)))
        .collect();

        Ok(Some(ChannelSummary {
            channel_id: ChannelId(row.get::<String, _>(0)),
            name: row.get::<String, _>(1),
            color: row.get::<String, _>(2),
            members,
        }))
    }

    pub async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow> {
        let message_id = MessageId::new(uuid::Uuid::new_v4().to_string());
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO messages (id, channel_id, sender_id, text, image_url, client_ref, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message_id.as_str())
        .bind(message.channel_id.as_str())
        .bind(message.sender_id.as_str())
        .bind(message.text.as_deref())
        .bind(message.image_url.as_deref())
        .bind(message.client_ref.as_deref())
        .bind(created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert message into channel {}", message.channel_id))?;

        let row = MessageRow {
            id: message_id,
            channel_id: message.channel_id.clone(),
            sender_id: message.sender_id.clone(),
            text: message.text.clone(),
            image_url: message.image_url.clone(),
            created_at: truncate_to_millis(created_at)?,
            client_ref: message.client_ref.clone(),
        };
        self.publish(StoreChange::MessageInserted {
            message: row.clone(),
        });
        Ok(row)
    }

    pub async fn load_message(&self, message_id: &MessageId) -> Result<Option<MessageRow>> {
        let row = sqlx::query(
            "SELECT id, channel_id, sender_id, text, image_url, client_ref, created_at
             FROM messages WHERE id = ?",
        )
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| message_from_row(&r)).transpose()
    }

    /// All messages of a channel, oldest first.
    pub async fn list_channel_messages(&self, channel_id: &ChannelId) -> Result<Vec<MessageRow>> {
        let rows = sqlx::query(
            "SELECT id, channel_id, sender_id, text, image_url, client_ref, created_at
             FROM messages
             WHERE channel_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(channel_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn update_message_text(&self, message_id: &MessageId, text: &str) -> Result<bool> {
        let updated = sqlx::query("UPDATE messages SET text = ? WHERE id = ?")
            .bind(text)
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Ok(false);
        }

        if let Some(message) = self.load_message(message_id).await? {
            self.publish(StoreChange::MessageUpdated { message });
        }
        Ok(true)
    }

    pub async fn delete_message(&self, message_id: &MessageId) -> Result<bool> {
        let row = sqlx::query("DELETE FROM messages WHERE id = ? RETURNING channel_id")
            .bind(message_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };

        self.publish(StoreChange::MessageDeleted {
            channel_id: ChannelId(row.get::<String, _>(0)),
            message_id: message_id.clone(),
        });
        Ok(true)
    }

    /// Records that `user_id` has read `message_id`.
    ///
    /// Idempotent per (message, user): a repeated call only refreshes `read_at`
    /// and does not publish a second insert notification.
    pub async fn upsert_read_receipt(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
    ) -> Result<ReadReceiptRow> {
        let channel_id = sqlx::query("SELECT channel_id FROM messages WHERE id = ?")
            .bind(message_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(|r| ChannelId(r.get::<String, _>(0)))
            .ok_or_else(|| anyhow!("message {message_id} does not exist"))?;

        let read_at = truncate_to_millis(Utc::now())?;
        let inserted = sqlx::query(
            "INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?, ?, ?)
             ON CONFLICT(message_id, user_id) DO NOTHING",
        )
        .bind(message_id.as_str())
        .bind(user_id.as_str())
        .bind(read_at.timestamp_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();

        let receipt = ReadReceiptRow {
            message_id: message_id.clone(),
            user_id: user_id.clone(),
            read_at,
        };

        if inserted > 0 {
            self.publish(StoreChange::ReadReceiptInserted {
                channel_id,
                receipt: receipt.clone(),
            });
        } else {
            sqlx::query("UPDATE message_reads SET read_at = ? WHERE message_id = ? AND user_id = ?")
                .bind(read_at.timestamp_millis())
                .bind(message_id.as_str())
                .bind(user_id.as_str())
                .execute(&self.pool)
                .await?;
        }

        Ok(receipt)
    }

    pub async fn list_read_receipts(&self, message_id: &MessageId) -> Result<Vec<ReadReceiptRow>> {
        let rows = sqlx::query(
            "SELECT message_id, user_id, read_at FROM message_reads
             WHERE message_id = ?
             ORDER BY read_at ASC, user_id ASC",
        )
        .bind(message_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(receipt_from_row).collect()
    }

    pub async fn list_channel_read_receipts(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<ReadReceiptRow>> {
        let rows = sqlx::query(
            "SELECT r.message_id, r.user_id, r.read_at
             FROM message_reads r
             INNER JOIN messages m ON m.id = r.message_id
             WHERE m.channel_id = ?
             ORDER BY r.read_at ASC, r.user_id ASC",
        )
        .bind(channel_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(receipt_from_row).collect()
    }

    /// Stores `bytes` under `bucket/path`, replacing any previous object, and
    /// returns the URL the object resolves at.
    pub async fn store_blob(
        &self,
        bucket: &str,
        path: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<String> {
        sqlx::query(
            "INSERT INTO blobs (bucket, path, content_type, bytes, created_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(bucket, path) DO UPDATE SET content_type=excluded.content_type, bytes=excluded.bytes, created_at=excluded.created_at",
        )
        .bind(bucket)
        .bind(path)
        .bind(content_type)
        .bind(bytes)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store blob {bucket}/{path}"))?;
        Ok(format!("{LOCAL_BLOB_SCHEME}{bucket}/{path}"))
    }

    pub async fn load_blob(&self, url: &str) -> Result<Option<StoredBlob>> {
        let Some((bucket, path)) = url
            .strip_prefix(LOCAL_BLOB_SCHEME)
            .and_then(|rest| rest.split_once('/'))
        else {
            return Ok(None);
        };
        let row = sqlx::query(
            "SELECT bucket, path, content_type, bytes FROM blobs WHERE bucket = ? AND path = ?",
        )
        .bind(bucket)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredBlob {
            bucket: r.get::<String, _>(0),
            path: r.get::<String, _>(1),
            content_type: r.get::<Option<String>, _>(2),
            bytes: r.get::<Vec<u8>, _>(3),
        }))
    }
}

fn profile_from_row(row: &SqliteRow) -> UserProfile {
    UserProfile {
        user_id: UserId(row.get::<String, _>(0)),
        display_name: row.get::<String, _>(1),
        photo_url: row.get::<Option<String>, _>(2),
    }
}

fn message_from_row(row: &SqliteRow) -> Result<MessageRow> {
    Ok(MessageRow {
        id: MessageId(row.get::<String, _>(0)),
        channel_id: ChannelId(row.get::<String, _>(1)),
        sender_id: UserId(row.get::<String, _>(2)),
        text: row.get::<Option<String>, _>(3),
        image_url: row.get::<Option<String>, _>(4),
        client_ref: row.get::<Option<String>, _>(5),
        created_at: from_millis(row.get::<i64, _>(6))?,
    })
}

fn receipt_from_row(row: &SqliteRow) -> Result<ReadReceiptRow> {
    Ok(ReadReceiptRow {
        message_id: MessageId(row.get::<String, _>(0)),
        user_id: UserId(row.get::<String, _>(1)),
        read_at: from_millis(row.get::<i64, _>(2))?,
    })
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow!("timestamp out of range: {millis}"))
}

fn truncate_to_millis(value: DateTime<Utc>) -> Result<DateTime<Utc>> {
    from_millis(value.timestamp_millis())
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
