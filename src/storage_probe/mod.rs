//! Disk usage/quota estimation.
//!
//! The engine consults a [`StorageProbe`] before dispatching a download
//! so it can defer work rather than fail a write partway through. Uses
//! `fs2` to read filesystem free/total space for the directory the
//! store lives under.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

/// A point-in-time usage/quota estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    /// Bytes currently occupied by this manager's data, as best known.
    pub usage_bytes: u64,
    /// Total bytes this manager is permitted to occupy.
    pub quota_bytes: u64,
}

impl StorageEstimate {
    /// Bytes remaining before `quota_bytes` is reached.
    #[must_use]
    pub fn available_bytes(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.usage_bytes)
    }
}

/// Errors surfaced while probing storage.
#[derive(Debug, Error)]
pub enum StorageProbeError {
    /// The underlying filesystem call failed.
    #[error("failed to read storage stats for {path}: {source}")]
    Io {
        /// Path the probe attempted to read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Storage accounting contract. A host can supply its own
/// implementation (e.g. backed by a platform storage-quota API); this
/// crate ships [`DiskStorageProbe`], which treats the filesystem holding
/// the store directory as the quota.
#[async_trait]
pub trait StorageProbe: Send + Sync + std::fmt::Debug {
    /// Returns the current usage/quota estimate.
    async fn estimate(&self) -> Result<StorageEstimate, StorageProbeError>;

    /// `true` iff `available - QUOTA_RESERVE_FRACTION * quota >= n`.
    /// The reserve is a fraction of *total quota*, not of `n` — a store
    /// already sitting near its quota should defer even small
    /// registrations, which a reserve scaled by `n` would miss.
    async fn has_enough_space(&self, additional_bytes: u64) -> Result<bool, StorageProbeError> {
        let estimate = self.estimate().await?;
        let reserve = (estimate.quota_bytes as f64 * QUOTA_RESERVE_FRACTION) as u64;
        let available_after_reserve = estimate.available_bytes().saturating_sub(reserve);
        Ok(available_after_reserve >= additional_bytes)
    }
}

/// Fraction of quota held back before the engine will dispatch a new
/// download, so near-quota writes don't outrun the estimate.
pub const QUOTA_RESERVE_FRACTION: f64 = 0.10;

/// Filesystem-backed [`StorageProbe`]: usage is the current size of the
/// store directory's contents; quota is the filesystem's total capacity.
#[derive(Debug, Clone)]
pub struct DiskStorageProbe {
    dir: PathBuf,
}

impl DiskStorageProbe {
    /// Probes the filesystem holding `dir`. `dir` is used as the usage
    /// accounting root and must exist.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn directory_size(path: &Path) -> std::io::Result<u64> {
        let mut total = 0u64;
        let entries = std::fs::read_dir(path)?;
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                total += Self::directory_size(&entry.path())?;
            } else {
                total += metadata.len();
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl StorageProbe for DiskStorageProbe {
    async fn estimate(&self) -> Result<StorageEstimate, StorageProbeError> {
        let dir = self.dir.clone();
        let (usage, total, free) = tokio::task::spawn_blocking(move || {
            let usage = Self::directory_size(&dir)?;
            let total = fs2::total_space(&dir)?;
            let free = fs2::free_space(&dir)?;
            std::io::Result::Ok((usage, total, free))
        })
        .await
        .expect("storage probe task panicked")
        .map_err(|source| StorageProbeError::Io {
            path: self.dir.clone(),
            source,
        })?;

        // Quota is whatever this process could actually still write: the
        // bytes it already occupies plus whatever free space remains.
        let quota = usage.saturating_add(free).min(total.max(usage));
        Ok(StorageEstimate {
            usage_bytes: usage,
            quota_bytes: quota,
        })
    }
}
