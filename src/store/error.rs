//! Error types for [`super::Store`] operations.
//!
//! A typed classification alongside the human-readable message, so
//! callers can distinguish transient lock contention from a genuine
//! schema problem without string-matching.

use std::fmt;

use thiserror::Error;

/// Structured classification for store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/foreign-key/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// The backing volume is out of space.
    QuotaExceeded,
    /// Filesystem or transport IO failure.
    Io,
    /// SQL protocol/driver error.
    Protocol,
    /// Unclassified database failure.
    Other,
}

impl StoreErrorKind {
    #[must_use]
    pub(super) fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Protocol(_) => Self::Protocol,
            sqlx::Error::Database(database_error) => classify_database_error(database_error.as_ref()),
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Io => "io",
            Self::Protocol => "protocol",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> StoreErrorKind {
    let code = database_error.code();
    if matches!(code.as_deref(), Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")) {
        return StoreErrorKind::BusyOrLocked;
    }

    if matches!(code.as_deref(), Some("SQLITE_FULL" | "13")) {
        return StoreErrorKind::QuotaExceeded;
    }

    if database_error.is_unique_violation()
        || database_error.is_foreign_key_violation()
        || database_error.is_check_violation()
        || code
            .as_deref()
            .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT"))
    {
        return StoreErrorKind::ConstraintViolation;
    }

    let message = database_error.message().to_ascii_lowercase();
    if message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("database is busy")
    {
        return StoreErrorKind::BusyOrLocked;
    }
    if message.contains("database or disk is full") {
        return StoreErrorKind::QuotaExceeded;
    }

    StoreErrorKind::Other
}

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database rejected or failed an operation.
    #[error("store error ({kind}): {message}")]
    Database {
        /// Typed classification of the failure.
        kind: StoreErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// Migrations failed to apply when opening the store.
    #[error("failed to run store migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: StoreErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    /// Returns the typed error kind, when this is a database error.
    #[must_use]
    pub fn kind(&self) -> Option<StoreErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::Migration(_) => None,
        }
    }

    /// `true` when this error is a busy/locked condition that a caller
    /// might reasonably retry.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        self.kind() == Some(StoreErrorKind::BusyOrLocked)
    }

    /// `true` when the backing volume is out of space.
    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        self.kind() == Some(StoreErrorKind::QuotaExceeded)
    }
}
