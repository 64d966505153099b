//! SQLite queue store
//!
//! Durable implementation of the queue contract using SQLite with WAL mode
//! for crash-safe atomic commits.

use super::{ProgressHub, QueueStore};
use crate::error::{ManagerError, Result};
use crate::types::{
    DownloadId, DownloadRecord, DownloadRequest, DownloadState, NetworkConstraint,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// SQLite-backed queue store
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    hub: ProgressHub,
}

impl SqliteStore {
    /// Create a store at the given path
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    ManagerError::Database(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;

            // WAL mode for better concurrency and crash safety
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            migrate(&conn)?;

            Ok(conn)
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to initialize database: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            hub: ProgressHub::new(),
        })
    }

    /// Create an in-memory store (for testing)
    pub async fn in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to create in-memory database: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            hub: ProgressHub::new(),
        })
    }

    async fn fetch(&self, id: DownloadId) -> Result<Option<DownloadRecord>> {
        let conn = self.conn.lock().await;
        fetch_record(&conn, id)
    }
}

/// Current schema version. Bump when adding migrations.
const CURRENT_SCHEMA_VERSION: u32 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS downloads (
    id TEXT PRIMARY KEY,

    -- Request
    url TEXT NOT NULL,
    file_name TEXT NOT NULL,
    directory TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    network TEXT NOT NULL DEFAULT 'any',
    requires_charging INTEGER NOT NULL DEFAULT 0,
    scheduled_at TEXT NOT NULL,
    max_retries INTEGER NOT NULL DEFAULT 3,
    limit_bps INTEGER,
    headers_json TEXT,
    metadata_json TEXT,

    -- Progress
    state TEXT NOT NULL,
    downloaded_bytes INTEGER NOT NULL DEFAULT 0,
    total_bytes INTEGER NOT NULL DEFAULT 0,
    speed_bps INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,

    -- Timestamps
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_downloads_state ON downloads(state);
CREATE INDEX IF NOT EXISTS idx_downloads_queue ON downloads(state, scheduled_at);
"#;

/// Run schema migrations, tracked via `PRAGMA user_version`.
///
/// Idempotent: calling on an already-current database is a no-op.
fn migrate(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    debug_assert_eq!(
        conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))
            .unwrap(),
        CURRENT_SCHEMA_VERSION
    );

    Ok(())
}

/// Fixed-width UTC timestamp so lexicographic ordering matches time order
fn to_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_ts(s: &str) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

const RECORD_COLUMNS: &str = "id, url, file_name, directory, priority, network, requires_charging, \
     scheduled_at, max_retries, limit_bps, headers_json, metadata_json, \
     state, downloaded_bytes, total_bytes, speed_bps, retry_count, last_error, \
     created_at, started_at, completed_at, updated_at";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DownloadRecord> {
    let id_str: String = row.get(0)?;
    let id = DownloadId::parse(&id_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("invalid download id: {}", id_str).into(),
        )
    })?;

    let network_str: String = row.get(5)?;
    let constraint = network_str.parse::<NetworkConstraint>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
    })?;

    let headers_json: Option<String> = row.get(10)?;
    let headers = headers_json
        .as_deref()
        .and_then(|j| serde_json::from_str(j).ok())
        .unwrap_or_default();

    let metadata_json: Option<String> = row.get(11)?;
    let metadata = metadata_json
        .as_deref()
        .and_then(|j| serde_json::from_str(j).ok())
        .unwrap_or_default();

    let state_str: String = row.get(12)?;
    let state = state_str.parse::<DownloadState>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, e.into())
    })?;

    let scheduled_at: String = row.get(7)?;
    let created_at: String = row.get(18)?;
    let started_at: Option<String> = row.get(19)?;
    let completed_at: Option<String> = row.get(20)?;
    let updated_at: String = row.get(21)?;

    Ok(DownloadRecord {
        id,
        request: DownloadRequest {
            url: row.get(1)?,
            file_name: row.get(2)?,
            directory: row.get::<_, String>(3)?.into(),
            priority: row.get(4)?,
            constraint,
            requires_charging: row.get(6)?,
            scheduled_at: from_ts(&scheduled_at)?,
            max_retries: row.get::<_, i64>(8)? as u32,
            limit_bps: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
            headers,
            metadata,
        },
        state,
        downloaded_bytes: row.get::<_, i64>(13)? as u64,
        total_bytes: row.get::<_, i64>(14)? as u64,
        speed_bps: row.get::<_, i64>(15)? as u64,
        retry_count: row.get::<_, i64>(16)? as u32,
        last_error: row.get(17)?,
        created_at: from_ts(&created_at)?,
        started_at: started_at.as_deref().map(from_ts).transpose()?,
        completed_at: completed_at.as_deref().map(from_ts).transpose()?,
        updated_at: from_ts(&updated_at)?,
    })
}

fn fetch_record(conn: &Connection, id: DownloadId) -> Result<Option<DownloadRecord>> {
    let sql = format!("SELECT {} FROM downloads WHERE id = ?1", RECORD_COLUMNS);
    let record = conn
        .query_row(&sql, params![id.to_string()], row_to_record)
        .optional()?;
    Ok(record)
}

fn upsert_record(conn: &Connection, record: &DownloadRecord) -> Result<()> {
    let headers_json =
        serde_json::to_string(&record.request.headers).unwrap_or_else(|_| "[]".to_string());
    let metadata_json =
        serde_json::to_string(&record.request.metadata).unwrap_or_else(|_| "{}".to_string());

    conn.execute(
        r#"
        INSERT INTO downloads (
            id, url, file_name, directory, priority, network, requires_charging,
            scheduled_at, max_retries, limit_bps, headers_json, metadata_json,
            state, downloaded_bytes, total_bytes, speed_bps, retry_count, last_error,
            created_at, started_at, completed_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7,
            ?8, ?9, ?10, ?11, ?12,
            ?13, ?14, ?15, ?16, ?17, ?18,
            ?19, ?20, ?21, ?22
        )
        ON CONFLICT(id) DO UPDATE SET
            state = excluded.state,
            downloaded_bytes = excluded.downloaded_bytes,
            total_bytes = excluded.total_bytes,
            speed_bps = excluded.speed_bps,
            retry_count = excluded.retry_count,
            last_error = excluded.last_error,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            updated_at = excluded.updated_at
        "#,
        params![
            record.id.to_string(),
            record.request.url,
            record.request.file_name,
            record.request.directory.to_string_lossy().to_string(),
            record.request.priority,
            record.request.constraint.as_str(),
            record.request.requires_charging,
            to_ts(&record.request.scheduled_at),
            record.request.max_retries as i64,
            record.request.limit_bps.map(|v| v as i64),
            headers_json,
            metadata_json,
            record.state.as_str(),
            record.downloaded_bytes as i64,
            record.total_bytes as i64,
            record.speed_bps as i64,
            record.retry_count as i64,
            record.last_error,
            to_ts(&record.created_at),
            record.started_at.map(|t| to_ts(&t)),
            record.completed_at.map(|t| to_ts(&t)),
            to_ts(&record.updated_at),
        ],
    )?;

    Ok(())
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn insert(&self, record: &DownloadRecord) -> Result<()> {
        {
            let conn = self.conn.lock().await;
            upsert_record(&conn, record)?;
        }
        self.hub.publish(record.id, Some(record.clone()));
        Ok(())
    }

    async fn update(&self, record: &DownloadRecord) -> Result<()> {
        {
            let conn = self.conn.lock().await;
            upsert_record(&conn, record)?;
        }
        self.hub.publish(record.id, Some(record.clone()));
        Ok(())
    }

    async fn update_progress(
        &self,
        id: DownloadId,
        downloaded_bytes: u64,
        total_bytes: u64,
        speed_bps: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = {
            let conn = self.conn.lock().await;
            conn.execute(
                r#"
                UPDATE downloads
                SET downloaded_bytes = ?2, total_bytes = ?3, speed_bps = ?4, updated_at = ?5
                WHERE id = ?1
                "#,
                params![
                    id.to_string(),
                    downloaded_bytes as i64,
                    total_bytes as i64,
                    speed_bps as i64,
                    to_ts(&updated_at),
                ],
            )?;
            fetch_record(&conn, id)?
        };
        if let Some(record) = updated {
            self.hub.publish(id, Some(record));
        }
        Ok(())
    }

    async fn get(&self, id: DownloadId) -> Result<Option<DownloadRecord>> {
        self.fetch(id).await
    }

    async fn list_queued(&self, before: DateTime<Utc>) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM downloads \
             WHERE state = 'queued' AND scheduled_at <= ?1 \
             ORDER BY priority ASC, created_at ASC, id ASC",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let iter = stmt.query_map(params![to_ts(&before)], row_to_record)?;

        let mut records = Vec::new();
        for record in iter {
            records.push(record?);
        }
        Ok(records)
    }

    async fn list_all(&self) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM downloads ORDER BY created_at ASC, id ASC",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let iter = stmt.query_map([], row_to_record)?;

        let mut records = Vec::new();
        for record in iter {
            records.push(record?);
        }
        Ok(records)
    }

    async fn count_by_state(&self, state: DownloadState) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM downloads WHERE state = ?1",
            params![state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn delete(&self, id: DownloadId) -> Result<()> {
        {
            let conn = self.conn.lock().await;
            conn.execute("DELETE FROM downloads WHERE id = ?1", params![id.to_string()])?;
        }
        self.hub.publish(id, None);
        Ok(())
    }

    async fn watch(&self, id: DownloadId) -> watch::Receiver<Option<DownloadRecord>> {
        let current = self.fetch(id).await.unwrap_or_default();
        self.hub.watch(id, current)
    }
}
