//! `SqliteStore` — the default [`super::Store`] implementation, backed by
//! `sqlx`'s SQLite driver: a connection pool over two tables, WAL mode,
//! a busy timeout, and `sqlx::migrate!`-driven schema setup.

use std::path::Path;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::instrument;

use super::{Store, StoreError};
use crate::model::{QueueEntry, RegistryEntry};

/// Default maximum number of pooled connections.
///
/// Kept low since `SQLite` uses file-level locking and a large pool
/// just contends on the same lock.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// `SQLite` busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Caller-configurable store identity: a database name and schema
/// version, so a host can run multiple independent stores side by side.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base file name (without extension) for the database file.
    pub name: String,
    /// Schema version, tracked informationally; migrations are additive
    /// and self-describing via `sqlx::migrate!`.
    pub schema_version: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "offline-data-manager".to_string(),
            schema_version: 1,
        }
    }
}

/// `SQLite`-backed implementation of [`Store`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if absent) a database file under `dir`, named per
    /// `config`, enables WAL mode, and runs pending migrations.
    #[instrument(skip(config), fields(dir = %dir.display(), name = %config.name))]
    pub async fn open(dir: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        let db_path = dir.join(format!("{}.sqlite", config.name));
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Opens an in-memory store. Useful for tests and for callers that
    /// don't need the registry to survive a process restart.
    #[instrument]
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self))]
    async fn get_registry(&self, id: &str) -> Result<Option<RegistryEntry>, StoreError> {
        let row = sqlx::query_as::<_, RegistryEntry>("SELECT * FROM registry WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    #[instrument(skip(self))]
    async fn get_all_registry(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        let rows = sqlx::query_as::<_, RegistryEntry>(
            "SELECT * FROM registry ORDER BY priority ASC, registered_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn get_all_registry_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT id FROM registry")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    #[instrument(skip(self, entry), fields(id = %entry.id))]
    async fn put_registry(&self, entry: &RegistryEntry) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO registry (
                id, download_url, mime_type, version, protected, priority,
                ttl_seconds, total_bytes, metadata, registered_at, updated_at,
                status, bytes_downloaded, mirrored_total_bytes, error_message,
                deferred_reason
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(id) DO UPDATE SET
                download_url = excluded.download_url,
                mime_type = excluded.mime_type,
                version = excluded.version,
                protected = excluded.protected,
                priority = excluded.priority,
                ttl_seconds = excluded.ttl_seconds,
                total_bytes = excluded.total_bytes,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at,
                status = excluded.status,
                bytes_downloaded = excluded.bytes_downloaded,
                mirrored_total_bytes = excluded.mirrored_total_bytes,
                error_message = excluded.error_message,
                deferred_reason = excluded.deferred_reason",
        )
        .bind(&entry.id)
        .bind(&entry.download_url)
        .bind(&entry.mime_type)
        .bind(entry.version)
        .bind(entry.protected)
        .bind(entry.priority)
        .bind(entry.ttl_seconds)
        .bind(entry.total_bytes)
        .bind(&entry.metadata)
        .bind(entry.registered_at)
        .bind(entry.updated_at)
        .bind(&entry.status_str)
        .bind(entry.bytes_downloaded)
        .bind(entry.mirrored_total_bytes)
        .bind(&entry.error_message)
        .bind(&entry.deferred_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_registry(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM registry WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_queue(&self, id: &str) -> Result<Option<QueueEntry>, StoreError> {
        let row = sqlx::query_as::<_, QueueEntry>("SELECT * FROM queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    #[instrument(skip(self))]
    async fn get_all_queue(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query_as::<_, QueueEntry>("SELECT * FROM queue")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    #[instrument(skip(self, entry), fields(id = %entry.id))]
    async fn put_queue(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO queue (
                id, status, data, mime_type, bytes_downloaded, total_bytes,
                byte_offset, retry_count, last_attempt_at, completed_at,
                expires_at, error_message, deferred_reason
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                data = excluded.data,
                mime_type = excluded.mime_type,
                bytes_downloaded = excluded.bytes_downloaded,
                total_bytes = excluded.total_bytes,
                byte_offset = excluded.byte_offset,
                retry_count = excluded.retry_count,
                last_attempt_at = excluded.last_attempt_at,
                completed_at = excluded.completed_at,
                expires_at = excluded.expires_at,
                error_message = excluded.error_message,
                deferred_reason = excluded.deferred_reason",
        )
        .bind(&entry.id)
        .bind(&entry.status_str)
        .bind(&entry.data)
        .bind(&entry.mime_type)
        .bind(entry.bytes_downloaded)
        .bind(entry.total_bytes)
        .bind(entry.byte_offset)
        .bind(entry.retry_count)
        .bind(entry.last_attempt_at)
        .bind(entry.completed_at)
        .bind(entry.expires_at)
        .bind(&entry.error_message)
        .bind(&entry.deferred_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_queue(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
