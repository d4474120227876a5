//! [`RegistryEntry`] — the authoritative, caller-facing description of a
//! registered file.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::Status;

/// Default priority assigned to a registration that doesn't specify one.
///
/// Lower values are drained earlier; ties break by insertion order.
pub const DEFAULT_PRIORITY: i64 = 10;

/// A registered item: identity, source URL, version, and scheduling hints.
///
/// This is the row stored in the `registry` table. Status fields are
/// mirrored here from the `queue` table on every engine write so that
/// [`crate::registry::RegistryManager::get_status`] can read a single row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RegistryEntry {
    /// Primary key. Non-empty.
    pub id: String,
    /// URL fetched verbatim by the engine.
    pub download_url: String,
    /// MIME type, or `None` to infer it at download time.
    pub mime_type: Option<String>,
    /// Monotonic version. A strict increase over the stored value triggers
    /// a refresh; an equal or lesser value is a no-op.
    pub version: i64,
    /// When `true`, `delete_file` without `remove_protected` resets the
    /// row to `pending` instead of removing it.
    pub protected: bool,
    /// Lower values drain earlier. Stable tie-break by insertion order.
    pub priority: i64,
    /// Seconds after `completed_at` at which a `complete` row expires.
    /// `0` means never.
    pub ttl_seconds: i64,
    /// Optional size hint supplied by the caller at registration time.
    pub total_bytes: Option<i64>,
    /// Caller-owned opaque metadata, shallow-merged by
    /// `update_registry_metadata`.
    pub metadata: serde_json::Value,
    /// Set once, at first registration.
    pub registered_at: i64,
    /// Bumped on every registry write.
    pub updated_at: i64,

    // --- mirrored queue status fields, kept here so a status read
    // touches one row. ---
    /// Mirror of `queue.status`.
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Mirror of `queue.bytes_downloaded`.
    pub bytes_downloaded: i64,
    /// Mirror of `queue.total_bytes` once reconciled by a HEAD/GET probe.
    pub mirrored_total_bytes: Option<i64>,
    /// Mirror of `queue.error_message`.
    pub error_message: Option<String>,
    /// Mirror of `queue.deferred_reason`.
    pub deferred_reason: Option<String>,
}

impl RegistryEntry {
    /// Returns the mirrored lifecycle status, falling back to `Pending` if
    /// the stored string is somehow unrecognized (defensive; the registry
    /// only ever writes values produced by [`Status::as_str`]).
    #[must_use]
    pub fn status(&self) -> Status {
        self.status_str.parse().unwrap_or(Status::Pending)
    }
}

/// Caller-supplied registration input, validated by
/// [`crate::registry::RegistryManager::register_file`] before it becomes
/// a [`RegistryEntry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationInput {
    /// Primary key. Must be non-empty.
    pub id: String,
    /// URL fetched verbatim. Must be non-empty and a well-formed URL.
    pub download_url: String,
    /// MIME type, or `None` to infer it at download time.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Monotonic version. Must be non-negative.
    #[serde(default)]
    pub version: i64,
    /// See [`RegistryEntry::protected`].
    #[serde(default)]
    pub protected: bool,
    /// See [`RegistryEntry::priority`]. Defaults to [`DEFAULT_PRIORITY`].
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Seconds after completion at which the item expires. Must be
    /// non-negative; `0` means never.
    #[serde(default)]
    pub ttl_seconds: i64,
    /// Optional size hint.
    #[serde(default)]
    pub total_bytes: Option<i64>,
    /// Caller-owned opaque metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}
