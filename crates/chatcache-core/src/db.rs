//! Database operations for chatcache.
//!
//! Every public operation borrows a pooled connection, or opens a
//! transaction, for its own duration only. A transaction that is dropped
//! on an error path is rolled back by sqlx.

use crate::error::{Error, Result};
use crate::models::{
    IndexStatus, Message, decode_liked_by, encode_liked_by, parse_message_id,
};
use crate::schema::{MIGRATIONS, SCHEMA, latest_version};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Database handle for chatcache.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        let parent = path.parent().unwrap_or(Path::new("."));
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Initialize schema and apply pending migrations.
    async fn init(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;

        let current = self.schema_version().await?;
        if current > latest_version() {
            return Err(Error::Migrate(format!(
                "database schema version {current} is newer than supported version {}",
                latest_version()
            )));
        }

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(migration.sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    Error::Migrate(format!(
                        "migration {} ({}) failed: {e}",
                        migration.version, migration.name
                    ))
                })?;
            sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
                .bind(migration.version)
                .bind(migration.name)
                .bind(Utc::now().timestamp())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applied schema migration"
            );
        }

        Ok(())
    }

    /// Highest applied schema version, 0 for a fresh database.
    pub async fn schema_version(&self) -> Result<i64> {
        let version: (Option<i64>,) = sqlx::query_as("SELECT MAX(version) FROM schema_migrations")
            .fetch_one(&self.pool)
            .await?;
        Ok(version.0.unwrap_or(0))
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database.
    pub async fn close(self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Index status
    // =========================================================================

    /// Get the index status of a conversation, if it was ever indexed.
    pub async fn find_index_status(&self, conversation_id: &str) -> Result<Option<IndexStatus>> {
        let row = sqlx::query(
            "SELECT conversation_id, last_indexed_id, updated_at FROM index_status WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| index_status_from_row(&row)))
    }

    /// List every index status row.
    pub async fn index_statuses(&self) -> Result<Vec<IndexStatus>> {
        let rows = sqlx::query(
            "SELECT conversation_id, last_indexed_id, updated_at FROM index_status ORDER BY conversation_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(index_status_from_row).collect())
    }

    /// Create an empty index status row if none exists.
    pub async fn ensure_index_status(&self, conversation_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO index_status (conversation_id, last_indexed_id) VALUES (?, '') ON CONFLICT(conversation_id) DO NOTHING",
        )
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move a conversation's watermark forward to `message_id`.
    ///
    /// Returns false when the stored watermark is already at or beyond it.
    pub async fn advance_watermark(&self, conversation_id: &str, message_id: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        advance_watermark_in(&mut *conn, conversation_id, message_id).await
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Insert messages that are not cached yet; existing rows are left untouched.
    ///
    /// Returns the number of newly inserted messages.
    pub async fn upsert_messages(&self, messages: &[Message]) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for msg in messages {
            if insert_if_absent(&mut *tx, msg).await? {
                inserted += 1;
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Insert a batch and advance the conversation's watermark in one transaction.
    pub async fn commit_batch(
        &self,
        conversation_id: &str,
        messages: &[Message],
        watermark: Option<&str>,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for msg in messages {
            if msg.conversation_id != conversation_id {
                return Err(Error::Other(format!(
                    "message {} belongs to conversation {}, not {conversation_id}",
                    msg.id, msg.conversation_id
                )));
            }
            if insert_if_absent(&mut *tx, msg).await? {
                inserted += 1;
            }
        }
        if let Some(watermark) = watermark {
            advance_watermark_in(&mut *tx, conversation_id, watermark).await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Get a single message by ID.
    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(message_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Get all cached messages of a conversation, newest first.
    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY CAST(id AS INTEGER) DESC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    /// Get up to `limit` messages older than `before` (or the newest ones), newest first.
    pub async fn get_messages_page(
        &self,
        conversation_id: &str,
        before: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let mut sql = String::from("SELECT * FROM messages WHERE conversation_id = ?");
        if before.is_some() {
            sql.push_str(" AND CAST(id AS INTEGER) < ?");
        }
        sql.push_str(" ORDER BY CAST(id AS INTEGER) DESC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(conversation_id);
        if let Some(before) = before {
            let before = i64::try_from(parse_message_id(before)?)
                .map_err(|_| Error::Parse(format!("message id '{before}' is out of range")))?;
            query = query.bind(before);
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;

        rows.iter().map(message_from_row).collect()
    }

    /// Replace the like-set of a cached message.
    pub async fn update_likes(&self, id: &str, liked_by: &[String]) -> Result<()> {
        let result = sqlx::query("UPDATE messages SET liked_by = ? WHERE id = ?")
            .bind(encode_liked_by(liked_by))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("message '{id}'")));
        }
        Ok(())
    }

    /// Get message count.
    pub async fn count_messages(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    /// Number of conversations with at least one cached message.
    pub async fn count_conversations(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(DISTINCT conversation_id) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}

async fn insert_if_absent(conn: &mut SqliteConnection, msg: &Message) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO messages (id, conversation_id, created_at, sender_id, sender_name, text, attachments, liked_by, system)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&msg.id)
    .bind(&msg.conversation_id)
    .bind(msg.created_at.timestamp())
    .bind(&msg.sender_id)
    .bind(&msg.sender_name)
    .bind(&msg.text)
    .bind(msg.attachments.to_string())
    .bind(encode_liked_by(&msg.liked_by))
    .bind(msg.system)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn advance_watermark_in(
    conn: &mut SqliteConnection,
    conversation_id: &str,
    message_id: &str,
) -> Result<bool> {
    // Normalized so the numeric comparison below sees a canonical value.
    let canonical = parse_message_id(message_id)?.to_string();

    let result = sqlx::query(
        r#"
        INSERT INTO index_status (conversation_id, last_indexed_id, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(conversation_id) DO UPDATE SET
            last_indexed_id = excluded.last_indexed_id,
            updated_at = excluded.updated_at
        WHERE index_status.last_indexed_id = ''
            OR CAST(index_status.last_indexed_id AS INTEGER) < CAST(excluded.last_indexed_id AS INTEGER)
        "#,
    )
    .bind(conversation_id)
    .bind(&canonical)
    .bind(Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;

    let moved = result.rows_affected() > 0;
    if moved {
        tracing::debug!(conversation = conversation_id, watermark = %canonical, "Advanced watermark");
    }
    Ok(moved)
}

fn index_status_from_row(row: &SqliteRow) -> IndexStatus {
    IndexStatus {
        conversation_id: row.get("conversation_id"),
        last_indexed_id: row.get("last_indexed_id"),
        updated_at: row
            .get::<Option<i64>, _>("updated_at")
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        created_at: chrono::DateTime::from_timestamp(row.get::<i64, _>("created_at"), 0)
            .unwrap_or_default()
            .with_timezone(&Utc),
        sender_id: row.get("sender_id"),
        sender_name: row.get("sender_name"),
        text: row.get("text"),
        attachments: serde_json::from_str(row.get::<&str, _>("attachments"))?,
        liked_by: decode_liked_by(row.get::<&str, _>("liked_by")),
        system: row.get::<bool, _>("system"),
    })
}
