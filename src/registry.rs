//! Registry Manager: validation, version comparison, metadata merge,
//! expiry evaluation, and the status-projection view.
//!
//! A thin owner over a collection, with an `#[instrument]`d entry point
//! per operation, backed by the same store the engine drains. This is
//! the dependency root: it holds a [`WakeHandle`] rather than the engine
//! holding a reference back to it.

use thiserror::Error;
use tracing::{debug, instrument, warn};

use std::sync::Arc;

use crate::engine::WakeHandle;
use crate::events::{Event, EventBus, RegisteredReason};
use crate::model::{QueueEntry, RegistrationInput, RegistryEntry, Status};
use crate::storage_probe::{StorageEstimate, StorageProbe};
use crate::store::{Store, StoreError};
use crate::util::now_unix;

/// Malformed registration input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("id must not be empty")]
    EmptyId,
    #[error("download_url must not be empty")]
    EmptyDownloadUrl,
    #[error("download_url is not a well-formed url: {0}")]
    MalformedDownloadUrl(String),
    #[error("version must be non-negative")]
    NegativeVersion,
    #[error("ttl_seconds must be non-negative")]
    NegativeTtl,
}

/// `retrieve`/`delete_file`/`get_status` on an id with no registry row.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} is not registered")]
pub struct NotRegisteredError(pub String);

/// `retrieve` on an id whose payload isn't addressable.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} is not ready: status is not in READY, or no payload is stored")]
pub struct NotReadyError(pub String);

/// Failure modes of [`RegistryManager::register_file`].
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure modes of [`RegistryManager::retrieve`].
#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error(transparent)]
    NotRegistered(#[from] NotRegisteredError),
    #[error(transparent)]
    NotReady(#[from] NotReadyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure modes of [`RegistryManager::delete_file`].
#[derive(Debug, Error)]
pub enum DeleteError {
    #[error(transparent)]
    NotRegistered(#[from] NotRegisteredError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure modes of [`RegistryManager::get_status`]/`update_registry_metadata`.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error(transparent)]
    NotRegistered(#[from] NotRegisteredError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of [`RegistryManager::register_files`]: which ids were
/// (re)registered, and which were removed as a consequence of reconciling
/// against the caller's full list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub registered: Vec<String>,
    pub removed: Vec<String>,
}

/// A read-only projection of a registered item's status.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusView {
    pub id: String,
    pub status: Status,
    pub bytes_downloaded: i64,
    pub total_bytes: Option<i64>,
    /// `round(bytes_downloaded / total_bytes * 100)`, `None` when
    /// `total_bytes` isn't known.
    pub percent: Option<u32>,
    pub priority: i64,
    pub version: i64,
    pub error_message: Option<String>,
    pub deferred_reason: Option<String>,
    pub updated_at: i64,
}

impl StatusView {
    fn from_registry(entry: &RegistryEntry) -> Self {
        let total_bytes = entry.mirrored_total_bytes.or(entry.total_bytes);
        Self {
            id: entry.id.clone(),
            status: entry.status(),
            bytes_downloaded: entry.bytes_downloaded,
            total_bytes,
            percent: percent_of(entry.bytes_downloaded, total_bytes),
            priority: entry.priority,
            version: entry.version,
            error_message: entry.error_message.clone(),
            deferred_reason: entry.deferred_reason.clone(),
            updated_at: entry.updated_at,
        }
    }
}

fn percent_of(downloaded: i64, total: Option<i64>) -> Option<u32> {
    total.filter(|&total| total > 0).map(|total| {
        ((downloaded.max(0) as f64 / total as f64) * 100.0).round() as u32
    })
}

/// `get_all_status`'s result: per-item views sorted by priority
/// ascending, plus a storage summary.
#[derive(Debug, Clone)]
pub struct AllStatusView {
    pub items: Vec<StatusView>,
    pub storage: StorageEstimate,
}

/// Owns validation, version comparison, metadata merge, expiry evaluation,
/// and the status-projection view. Holds a [`WakeHandle`] so registration
/// and retries can nudge the drain loop without depending on
/// [`crate::engine::DownloadEngine`].
#[derive(Debug, Clone)]
pub struct RegistryManager {
    store: Arc<dyn Store>,
    events: EventBus,
    wake: WakeHandle,
    storage_probe: Arc<dyn StorageProbe>,
}

impl RegistryManager {
    /// Builds a manager over `store`, emitting through `events` and
    /// nudging `wake` on every mutation that needs the drain loop's
    /// attention. `storage_probe` backs the storage summary attached to
    /// [`Self::get_all_status`].
    #[must_use]
    pub fn new(store: Arc<dyn Store>, events: EventBus, wake: WakeHandle, storage_probe: Arc<dyn StorageProbe>) -> Self {
        Self {
            store,
            events,
            wake,
            storage_probe,
        }
    }

    /// Registers a single item.
    ///
    /// - Absent id: inserts a fresh registry row and a `pending` queue
    ///   row, emits `registered{reason:"new"}`, wakes the loop.
    /// - Present id with a strictly greater `version`: updates the
    ///   registry row (preserving `registered_at`), resets the queue
    ///   row's attempt fields to fresh-pending values while retaining
    ///   `data`/`mime_type` so `retrieve` keeps serving the old payload
    ///   until the refresh completes, mirrors the reset onto the
    ///   registry row, emits `registered{reason:"version-updated"}`,
    ///   wakes the loop.
    /// - Present id with an equal or lesser `version`: no-op.
    #[instrument(skip(self, input), fields(id = %input.id))]
    pub async fn register_file(&self, input: RegistrationInput) -> Result<(), RegisterError> {
        validate(&input)?;

        let now = now_unix();
        let existing = self.store.get_registry(&input.id).await?;

        match existing {
            None => {
                let registry_entry = RegistryEntry {
                    id: input.id.clone(),
                    download_url: input.download_url,
                    mime_type: input.mime_type,
                    version: input.version,
                    protected: input.protected,
                    priority: input.priority,
                    ttl_seconds: input.ttl_seconds,
                    total_bytes: input.total_bytes,
                    metadata: input.metadata,
                    registered_at: now,
                    updated_at: now,
                    status_str: Status::Pending.as_str().to_string(),
                    bytes_downloaded: 0,
                    mirrored_total_bytes: None,
                    error_message: None,
                    deferred_reason: None,
                };
                if let Err(err) = self.store.put_registry(&registry_entry).await {
                    return self.handle_register_write_error(&input.id, err);
                }
                if let Err(err) = self.store.put_queue(&fresh_queue_entry(&input.id, input.total_bytes)).await {
                    return self.handle_register_write_error(&input.id, err);
                }

                self.events.emit(Event::Registered {
                    id: input.id.clone(),
                    reason: RegisteredReason::New,
                });
                self.wake.wake();
                Ok(())
            }
            Some(mut registry_entry) if input.version > registry_entry.version => {
                registry_entry.download_url = input.download_url;
                registry_entry.mime_type = input.mime_type;
                registry_entry.version = input.version;
                registry_entry.protected = input.protected;
                registry_entry.priority = input.priority;
                registry_entry.ttl_seconds = input.ttl_seconds;
                registry_entry.total_bytes = input.total_bytes;
                registry_entry.metadata = input.metadata;
                registry_entry.updated_at = now;
                registry_entry.status_str = Status::Pending.as_str().to_string();
                registry_entry.bytes_downloaded = 0;
                registry_entry.mirrored_total_bytes = None;
                registry_entry.error_message = None;
                registry_entry.deferred_reason = None;

                if let Some(mut queue_entry) = self.store.get_queue(&input.id).await? {
                    queue_entry.status_str = Status::Pending.as_str().to_string();
                    queue_entry.bytes_downloaded = 0;
                    queue_entry.byte_offset = 0;
                    queue_entry.retry_count = 0;
                    queue_entry.last_attempt_at = None;
                    queue_entry.completed_at = None;
                    queue_entry.expires_at = None;
                    queue_entry.error_message = None;
                    queue_entry.deferred_reason = None;
                    queue_entry.total_bytes = input.total_bytes.or(queue_entry.total_bytes);
                    // `data`/`mime_type` deliberately retained: `retrieve`
                    // keeps serving the prior payload until the refresh
                    // lands.
                    if let Err(err) = self.store.put_queue(&queue_entry).await {
                        return self.handle_register_write_error(&input.id, err);
                    }
                } else if let Err(err) = self.store.put_queue(&fresh_queue_entry(&input.id, input.total_bytes)).await {
                    return self.handle_register_write_error(&input.id, err);
                }

                if let Err(err) = self.store.put_registry(&registry_entry).await {
                    return self.handle_register_write_error(&input.id, err);
                }

                self.events.emit(Event::Registered {
                    id: input.id.clone(),
                    reason: RegisteredReason::VersionUpdated,
                });
                self.wake.wake();
                Ok(())
            }
            Some(_) => {
                debug!("registration version <= existing; no-op");
                Ok(())
            }
        }
    }

    /// A `StoreError` hit while writing registration data. Quota
    /// exhaustion is swallowed: emits `error{id, reason}` and returns
    /// `Ok(())` rather than propagating, since a quota failure here is a
    /// deferral, not an operation failure. Any other store error still
    /// propagates.
    fn handle_register_write_error(&self, id: &str, err: StoreError) -> Result<(), RegisterError> {
        if err.is_quota_exceeded() {
            warn!(id, "storage quota exceeded while writing registration data");
            self.events.emit(Event::Error {
                id: id.to_string(),
                message: "insufficient storage quota".to_string(),
                retry_count: 0,
                will_retry: false,
            });
            return Ok(());
        }
        Err(err.into())
    }

    /// Batch variant. Reconciles the full
    /// registry against `entries`: any existing, non-protected id absent
    /// from `entries` is fully removed (registry and queue), emitting
    /// `deleted{registry_removed:true}`; protected rows absent from
    /// `entries` are preserved untouched. Every incoming entry is then
    /// fed through [`Self::register_file`].
    #[instrument(skip(self, entries))]
    pub async fn register_files(&self, entries: Vec<RegistrationInput>) -> Result<ReconcileOutcome, RegisterError> {
        for entry in &entries {
            validate(entry)?;
        }

        let incoming_ids: std::collections::HashSet<&str> = entries.iter().map(|entry| entry.id.as_str()).collect();
        let existing = self.store.get_all_registry().await?;

        let mut removed = Vec::new();
        for entry in &existing {
            if incoming_ids.contains(entry.id.as_str()) || entry.protected {
                continue;
            }
            self.store.delete_registry(&entry.id).await?;
            self.store.delete_queue(&entry.id).await?;
            removed.push(entry.id.clone());
            self.events.emit(Event::Deleted {
                id: entry.id.clone(),
                registry_removed: true,
            });
        }

        let mut registered = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = entry.id.clone();
            self.register_file(entry).await?;
            registered.push(id);
        }

        Ok(ReconcileOutcome { registered, removed })
    }

    /// Scans the queue for `complete` rows past their `expires_at` and
    /// transitions them to `expired`, mirroring the change onto the
    /// registry row and emitting `expired{id}` for each. Idempotent: a
    /// second call with no clock movement transitions nothing further.
    #[instrument(skip(self))]
    pub async fn evaluate_expiry(&self) -> Result<Vec<String>, StoreError> {
        evaluate_expiry(&*self.store, &self.events).await
    }

    /// Projects a single registry row into a [`StatusView`].
    #[instrument(skip(self))]
    pub async fn get_status(&self, id: &str) -> Result<StatusView, LookupError> {
        let entry = self
            .store
            .get_registry(id)
            .await?
            .ok_or_else(|| NotRegisteredError(id.to_string()))?;
        Ok(StatusView::from_registry(&entry))
    }

    /// Projects every registry row, sorted by priority ascending (stable
    /// tie-break by `registered_at`), alongside a storage usage/quota
    /// summary. A storage-probe failure doesn't fail the whole call: it's
    /// logged and reported as a zeroed summary, since an unrelated probe
    /// outage shouldn't block status reporting.
    #[instrument(skip(self))]
    pub async fn get_all_status(&self) -> Result<AllStatusView, StoreError> {
        let mut entries = self.store.get_all_registry().await?;
        entries.sort_by_key(|entry| (entry.priority, entry.registered_at));
        let items = entries.iter().map(StatusView::from_registry).collect();

        let storage = match self.storage_probe.estimate().await {
            Ok(estimate) => estimate,
            Err(err) => {
                warn!(error = %err, "storage probe failed while building getAllStatus; reporting zeroed summary");
                StorageEstimate {
                    usage_bytes: 0,
                    quota_bytes: 0,
                }
            }
        };

        Ok(AllStatusView { items, storage })
    }

    /// `true` iff `id`'s payload is addressable: status is in READY and a
    /// payload is stored.
    #[instrument(skip(self))]
    pub async fn is_ready(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.store.get_queue(id).await?.is_some_and(|entry| entry.is_ready()))
    }

    /// Shallow-merges `patch` into the registry row's `metadata`. Keys
    /// mapped to `null` in `patch` are ignored, not deleted — a literal
    /// delete isn't expressible through this merge.
    #[instrument(skip(self, patch))]
    pub async fn update_registry_metadata(&self, id: &str, patch: serde_json::Value) -> Result<(), LookupError> {
        let mut entry = self
            .store
            .get_registry(id)
            .await?
            .ok_or_else(|| NotRegisteredError(id.to_string()))?;

        if let serde_json::Value::Object(patch_map) = patch {
            if !entry.metadata.is_object() {
                entry.metadata = serde_json::Value::Object(serde_json::Map::new());
            }
            let metadata = entry.metadata.as_object_mut().expect("just normalized to an object");
            for (key, value) in patch_map {
                if !value.is_null() {
                    metadata.insert(key, value);
                }
            }
        }
        entry.updated_at = now_unix();
        self.store.put_registry(&entry).await?;
        Ok(())
    }

    /// Returns `id`'s payload and resolved MIME type. Fails with
    /// [`NotRegisteredError`] for an unknown id, [`NotReadyError`] when
    /// the status isn't in READY or no payload is stored.
    #[instrument(skip(self))]
    pub async fn retrieve(&self, id: &str) -> Result<(Vec<u8>, Option<String>), RetrieveError> {
        let entry = self
            .store
            .get_queue(id)
            .await?
            .ok_or_else(|| NotRegisteredError(id.to_string()))?;

        if !entry.is_ready() {
            return Err(NotReadyError(id.to_string()).into());
        }
        let data = entry.data.ok_or_else(|| NotReadyError(id.to_string()))?;
        Ok((data, entry.mime_type))
    }

    /// Removes `id`, or resets it. Aborts any active fetch first. A
    /// protected row (unless `remove_protected`) is reset to `pending`
    /// with its payload
    /// cleared rather than removed; the registry row survives and the
    /// next drain cycle re-downloads it.
    #[instrument(skip(self))]
    pub async fn delete_file(&self, id: &str, remove_protected: bool) -> Result<(), DeleteError> {
        let registry_entry = self
            .store
            .get_registry(id)
            .await?
            .ok_or_else(|| NotRegisteredError(id.to_string()))?;

        self.wake.abort(id);

        if remove_protected || !registry_entry.protected {
            self.store.delete_registry(id).await?;
            self.store.delete_queue(id).await?;
            self.events.emit(Event::Deleted {
                id: id.to_string(),
                registry_removed: true,
            });
        } else {
            self.store.put_queue(&fresh_queue_entry(id, registry_entry.total_bytes)).await?;

            let mut reset_registry = registry_entry;
            reset_registry.status_str = Status::Pending.as_str().to_string();
            reset_registry.bytes_downloaded = 0;
            reset_registry.mirrored_total_bytes = None;
            reset_registry.error_message = None;
            reset_registry.deferred_reason = None;
            reset_registry.updated_at = now_unix();
            self.store.put_registry(&reset_registry).await?;

            self.events.emit(Event::Deleted {
                id: id.to_string(),
                registry_removed: false,
            });
        }

        self.wake.wake();
        Ok(())
    }

    /// Aborts all fetches, then applies [`Self::delete_file`] to every
    /// currently-registered id.
    #[instrument(skip(self))]
    pub async fn delete_all_files(&self, remove_protected: bool) -> Result<(), StoreError> {
        self.wake.abort_all();
        let ids = self.store.get_all_registry_ids().await?;
        for id in ids {
            if let Err(err) = self.delete_file(&id, remove_protected).await {
                warn!(error = %err, id = %id, "failed to delete during delete_all_files; continuing");
            }
        }
        Ok(())
    }
}

/// Scans the queue for `complete` rows whose `expires_at` has passed,
/// transitioning them to `expired` and mirroring the change onto the
/// registry row. Free function so [`crate::engine::DownloadEngine`] can
/// call it every drain cycle without needing a [`RegistryManager`].
pub(crate) async fn evaluate_expiry(store: &dyn Store, events: &EventBus) -> Result<Vec<String>, StoreError> {
    let now = now_unix();
    let mut expired_ids = Vec::new();

    for mut entry in store.get_all_queue().await? {
        if entry.status() != Status::Complete {
            continue;
        }
        let Some(expires_at) = entry.expires_at else {
            continue;
        };
        if now < expires_at {
            continue;
        }

        entry.status_str = Status::Expired.as_str().to_string();
        store.put_queue(&entry).await?;

        if let Some(mut registry_entry) = store.get_registry(&entry.id).await? {
            registry_entry.status_str = Status::Expired.as_str().to_string();
            registry_entry.updated_at = now;
            store.put_registry(&registry_entry).await?;
        }

        events.emit(Event::Expired { id: entry.id.clone() });
        expired_ids.push(entry.id);
    }

    Ok(expired_ids)
}

/// Validates a registration input.
fn validate(input: &RegistrationInput) -> Result<(), ValidationError> {
    if input.id.trim().is_empty() {
        return Err(ValidationError::EmptyId);
    }
    if input.download_url.trim().is_empty() {
        return Err(ValidationError::EmptyDownloadUrl);
    }
    url::Url::parse(&input.download_url).map_err(|_| ValidationError::MalformedDownloadUrl(input.download_url.clone()))?;
    if input.version < 0 {
        return Err(ValidationError::NegativeVersion);
    }
    if input.ttl_seconds < 0 {
        return Err(ValidationError::NegativeTtl);
    }
    Ok(())
}

/// A fresh `pending` queue row for a newly-registered (or reset) id.
fn fresh_queue_entry(id: &str, total_bytes: Option<i64>) -> QueueEntry {
    QueueEntry {
        id: id.to_string(),
        status_str: Status::Pending.as_str().to_string(),
        data: None,
        mime_type: None,
        bytes_downloaded: 0,
        total_bytes,
        byte_offset: 0,
        retry_count: 0,
        last_attempt_at: None,
        completed_at: None,
        expires_at: None,
        error_message: None,
        deferred_reason: None,
    }
}
