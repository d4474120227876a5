//! The `Store` contract: two logical tables, `registry` and `queue`,
//! each keyed by item id, supporting atomic get/put/delete and
//! whole-table scans.
//!
//! This crate treats the concrete storage engine as an external
//! collaborator reached through the [`Store`] trait, so a host can swap
//! in its own backend. [`sqlite::SqliteStore`] is the default,
//! `sqlx`-backed implementation.

mod error;
mod sqlite;

pub use error::{StoreError, StoreErrorKind};
pub use sqlite::{SqliteStore, StoreConfig};

use async_trait::async_trait;

use crate::model::{QueueEntry, RegistryEntry};

/// Persistence contract the registry manager and download engine are
/// built against.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Fetches a registry row by id.
    async fn get_registry(&self, id: &str) -> Result<Option<RegistryEntry>, StoreError>;

    /// Fetches every registry row.
    async fn get_all_registry(&self) -> Result<Vec<RegistryEntry>, StoreError>;

    /// Fetches every registry id, without materializing full rows.
    async fn get_all_registry_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Atomically inserts or replaces a registry row.
    async fn put_registry(&self, entry: &RegistryEntry) -> Result<(), StoreError>;

    /// Removes a registry row. A no-op (not an error) if absent.
    async fn delete_registry(&self, id: &str) -> Result<(), StoreError>;

    /// Fetches a queue row by id.
    async fn get_queue(&self, id: &str) -> Result<Option<QueueEntry>, StoreError>;

    /// Fetches every queue row.
    async fn get_all_queue(&self) -> Result<Vec<QueueEntry>, StoreError>;

    /// Atomically inserts or replaces a queue row. The engine relies on
    /// this being a single atomic write so that a `complete` status and
    /// its `data` never appear in two separate writes.
    async fn put_queue(&self, entry: &QueueEntry) -> Result<(), StoreError>;

    /// Removes a queue row. A no-op (not an error) if absent.
    async fn delete_queue(&self, id: &str) -> Result<(), StoreError>;
}
