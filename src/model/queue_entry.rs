//! [`QueueEntry`] and [`Status`] — transient download state for a single
//! registered item.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a queue entry.
///
/// READY = {[`Status::Complete`], [`Status::Expired`]} — see
/// [`super::is_ready_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting to be dispatched by the drain loop.
    Pending,
    /// A fetch is currently in flight.
    InProgress,
    /// Aborted mid-transfer (cancellation or offline edge); resumable.
    Paused,
    /// Downloaded successfully; `data` is addressable.
    Complete,
    /// Was `Complete`, past its TTL; `data` is still addressable.
    Expired,
    /// Exhausted all retry attempts.
    Failed,
    /// Held back by a quota/storage check; re-evaluated every drain cycle.
    Deferred,
}

impl Status {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "complete" => Ok(Self::Complete),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            "deferred" => Ok(Self::Deferred),
            _ => Err(format!("invalid status: {s}")),
        }
    }
}

/// Transient per-item download state (the `queue` table row).
///
/// Invariants: `byte_offset <= total_bytes` when both are
/// known; `data.is_some()` implies `status` is `Complete` or `Expired` and
/// `data.len()` equals the size stamped at `completed_at`; `expires_at`
/// implies `ttl_seconds > 0` at completion time; at most one in-flight
/// fetch per `id`.
#[derive(Debug, Clone, FromRow)]
pub struct QueueEntry {
    /// Equals `registry.id`.
    pub id: String,
    /// Current lifecycle status (stored as text, parsed via [`Self::status`]).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Downloaded bytes. Addressable (via `retrieve`) only when `status`
    /// is `Complete` or `Expired`; a `Paused` row may also carry a
    /// non-`None` value here, holding the bytes accumulated so far so a
    /// resumed attempt can continue past `byte_offset` without
    /// re-downloading them.
    pub data: Option<Vec<u8>>,
    /// Resolved MIME type, set at completion.
    pub mime_type: Option<String>,
    /// Bytes downloaded so far in the current attempt. Monotonic within an
    /// attempt.
    pub bytes_downloaded: i64,
    /// Total size, reconciled from the HEAD/GET probe.
    pub total_bytes: Option<i64>,
    /// Persisted resumption cursor.
    pub byte_offset: i64,
    /// Number of attempts made since the last success or explicit retry.
    pub retry_count: i64,
    /// Timestamp of the most recent attempt start.
    pub last_attempt_at: Option<i64>,
    /// Timestamp of the successful completion.
    pub completed_at: Option<i64>,
    /// Timestamp at which a `Complete` row becomes `Expired`.
    pub expires_at: Option<i64>,
    /// Message from the most recent failed attempt.
    pub error_message: Option<String>,
    /// Reason the row is held in `Deferred`.
    pub deferred_reason: Option<String>,
}

impl QueueEntry {
    /// Returns the parsed status, falling back to `Pending` if the stored
    /// string is unrecognized.
    #[must_use]
    pub fn status(&self) -> Status {
        self.status_str.parse().unwrap_or(Status::Pending)
    }

    /// `true` iff this row's payload is addressable: status is in READY
    /// and `data` is present.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        super::is_ready_status(self.status()) && self.data.is_some()
    }
}

impl fmt::Display for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueEntry {{ id: {}, status: {} }}",
            self.id,
            self.status()
        )
    }
}
