use crate::{
    entry::{ConversationEntry, EntryEdit},
    journal::{DayDigest, DayDigests},
};
use anyhow::{Context, Result};
use chrono::{NaiveDate, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqliteRow, ConnectOptions, Row, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

/// Result of a record request.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Recorded(ConversationEntry),
    /// The user already has an entry with this id; nothing was written.
    Duplicate(String),
}

/// Message count and activity span of one chat session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub session_id: String,
    pub conversation_length: i64,
    pub created_at: Option<String>,
    pub last_activity: Option<String>,
}

/// Result of an edit request.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOutcome {
    Updated(ConversationEntry),
    NotFound,
    /// More than one entry matched the key; nothing was changed.
    Ambiguous(usize),
}

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

const ENTRY_COLUMNS: &str = "id, session_id, message, response, timestamp, date, latitude, \
     longitude, location_name, photo_url, summary, diary, category, extra";

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                message TEXT NOT NULL,
                response TEXT NOT NULL,
                timestamp TEXT,
                date TEXT,
                latitude REAL,
                longitude REAL,
                location_name TEXT,
                photo_url TEXT,
                summary TEXT,
                diary TEXT,
                category TEXT,
                extra TEXT NOT NULL DEFAULT '{}',
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (user_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_entries_user_timestamp ON entries(user_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_entries_user_session ON entries(user_id, session_id);

            CREATE TABLE IF NOT EXISTS day_digests (
                user_id TEXT NOT NULL,
                date TEXT NOT NULL,
                images TEXT,
                summary TEXT,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (user_id, date)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Store a conversation entry for a user.
    /// Assigns an id and a UTC timestamp when the entry has none.
    /// Ids are unique per user.
    pub async fn record_entry(
        &self,
        user_id: &str,
        mut entry: ConversationEntry,
    ) -> Result<RecordOutcome> {
        if entry.id.as_deref().map_or(true, str::is_empty) {
            entry.id = Some(Uuid::new_v4().to_string());
        }
        if entry.timestamp.is_none() {
            entry.timestamp = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        let extra = serde_json::to_string(&entry.extra).context("Failed to encode entry extras")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO entries (id, user_id, session_id, message, response, timestamp, date,
                latitude, longitude, location_name, photo_url, summary, diary, category, extra)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(user_id)
        .bind(&entry.session_id)
        .bind(&entry.message)
        .bind(&entry.response)
        .bind(&entry.timestamp)
        .bind(&entry.date)
        .bind(entry.latitude)
        .bind(entry.longitude)
        .bind(&entry.location_name)
        .bind(&entry.photo_url)
        .bind(&entry.summary)
        .bind(&entry.diary)
        .bind(&entry.category)
        .bind(extra)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(RecordOutcome::Recorded(entry)),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                let id = entry.id.unwrap_or_default();
                tracing::warn!(user_id, id = %id, "refusing entry, id already recorded");
                Ok(RecordOutcome::Duplicate(id))
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to save entry")),
        }
    }

    /// All entries of a user, in the order they were recorded.
    pub async fn list_entries(&self, user_id: &str) -> Result<Vec<ConversationEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE user_id = ? ORDER BY rowid ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch entries")?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Entries of a single chat session, in the order they were recorded.
    pub async fn list_session_entries(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Vec<ConversationEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries \
             WHERE user_id = ? AND session_id = ? ORDER BY rowid ASC"
        ))
        .bind(user_id)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch session entries")?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Summary of one chat session, or `None` when it has no entries.
    pub async fn session_info(&self, user_id: &str, session_id: &str) -> Result<Option<SessionInfo>> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS length, MIN(timestamp) AS first, MAX(timestamp) AS last \
             FROM entries WHERE user_id = ? AND session_id = ?",
        )
        .bind(user_id)
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to summarize session")?;

        let length: i64 = row.try_get("length")?;
        if length == 0 {
            return Ok(None);
        }

        Ok(Some(SessionInfo {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            conversation_length: length,
            created_at: row.try_get("first")?,
            last_activity: row.try_get("last")?,
        }))
    }

    pub async fn get_entry(&self, user_id: &str, id: &str) -> Result<Option<ConversationEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE user_id = ? AND id = ?"
        ))
        .bind(user_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch entry")?;

        row.as_ref().map(entry_from_row).transpose()
    }

    /// Overwrite the editable text fields of an entry by id.
    pub async fn edit_entry(&self, user_id: &str, id: &str, edit: &EntryEdit) -> Result<EditOutcome> {
        let Some(mut entry) = self.get_entry(user_id, id).await? else {
            return Ok(EditOutcome::NotFound);
        };
        edit.apply(&mut entry);

        sqlx::query("UPDATE entries SET message = ?, response = ? WHERE user_id = ? AND id = ?")
            .bind(&entry.message)
            .bind(&entry.response)
            .bind(user_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update entry")?;

        Ok(EditOutcome::Updated(entry))
    }

    /// Edit addressed by timestamp, as older clients do.
    /// Timestamps are not unique, so a key matching several entries is refused.
    pub async fn edit_entry_by_timestamp(
        &self,
        user_id: &str,
        timestamp: &str,
        edit: &EntryEdit,
    ) -> Result<EditOutcome> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM entries WHERE user_id = ? AND timestamp = ?")
                .bind(user_id)
                .bind(timestamp)
                .fetch_all(&self.pool)
                .await
                .context("Failed to look up entries by timestamp")?;

        match ids.as_slice() {
            [] => Ok(EditOutcome::NotFound),
            [id] => self.edit_entry(user_id, id, edit).await,
            many => {
                tracing::warn!(
                    user_id,
                    timestamp,
                    matches = many.len(),
                    "refusing edit, timestamp matches several entries"
                );
                Ok(EditOutcome::Ambiguous(many.len()))
            }
        }
    }

    /// Save or replace the digest of one day.
    pub async fn save_day_digest(&self, user_id: &str, date: NaiveDate, digest: &DayDigest) -> Result<()> {
        let images = digest
            .images
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode digest images")?;

        sqlx::query(
            r#"
            INSERT INTO day_digests (user_id, date, images, summary)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, date) DO UPDATE SET
                images = excluded.images,
                summary = excluded.summary,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(user_id)
        .bind(date.format("%Y-%m-%d").to_string())
        .bind(images)
        .bind(&digest.summary)
        .execute(&self.pool)
        .await
        .context("Failed to save day digest")?;

        Ok(())
    }

    pub async fn day_digests(&self, user_id: &str) -> Result<DayDigests> {
        let rows = sqlx::query("SELECT date, images, summary FROM day_digests WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch day digests")?;

        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let images: Option<String> = row.try_get("images")?;
            let images = images
                .map(|raw| serde_json::from_str::<Vec<String>>(&raw))
                .transpose()
                .context("Corrupt digest images")?;
            keyed.push((
                row.try_get::<String, _>("date")?,
                DayDigest {
                    images,
                    summary: row.try_get("summary")?,
                },
            ));
        }

        Ok(DayDigests::from_keyed(keyed))
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<ConversationEntry> {
    let extra: String = row.try_get("extra")?;
    let extra: Map<String, Value> = serde_json::from_str(&extra).context("Corrupt entry extras")?;

    Ok(ConversationEntry {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        message: row.try_get("message")?,
        response: row.try_get("response")?,
        timestamp: row.try_get("timestamp")?,
        date: row.try_get("date")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        location_name: row.try_get("location_name")?,
        photo_url: row.try_get("photo_url")?,
        summary: row.try_get("summary")?,
        diary: row.try_get("diary")?,
        category: row.try_get("category")?,
        extra,
    })
}
