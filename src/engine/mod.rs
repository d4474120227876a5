//! Download engine: the drain loop that turns `pending` queue rows into
//! `complete` ones, with bounded concurrency, retry with backoff,
//! cancellation, and storage-quota deferral.
//!
//! `DownloadEngine` dispatches a bounded number of fetch tasks per
//! round, each driven by [`pipeline::run_attempt`], and wakes itself via
//! an event-driven notify rather than polling on a fixed interval.

mod pipeline;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::connectivity::ConnectivitySource;
use crate::events::{Event, EventBus};
use crate::fetch::FetchClient;
use crate::model::{QueueEntry, RegistryEntry, Status};
use crate::registry::evaluate_expiry;
use crate::storage_probe::StorageProbe;
use crate::store::{Store, StoreError};
use crate::util::now_unix;

use pipeline::{AttemptOutcome, run_attempt};

/// Maximum number of attempts per download, counting the first one. A
/// download that fails on attempt 6 moves to `Failed`.
const MAX_ATTEMPTS: u32 = 6;

/// Base delay for exponential backoff; `attempt` is 1-indexed. No jitter.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(1000 * 2u64.pow(attempt.saturating_sub(1)))
}

/// Default bounded concurrency.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// A cloneable handle onto the engine's wake primitive and its per-item
/// cancellation registry. [`crate::registry::RegistryManager`] holds one
/// of these so it can nudge the drain loop and abort an item's in-flight
/// fetch without depending on [`DownloadEngine`] itself.
#[derive(Debug, Clone)]
pub struct WakeHandle {
    notify: Arc<Notify>,
    cancel_tokens: Arc<DashMap<String, CancellationToken>>,
}

impl WakeHandle {
    pub(crate) fn new(notify: Arc<Notify>, cancel_tokens: Arc<DashMap<String, CancellationToken>>) -> Self {
        Self { notify, cancel_tokens }
    }

    /// Wakes the drain loop if it is currently idle-waiting. A no-op,
    /// not an error, if the loop is already busy or not running.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Cancels `id`'s in-flight fetch, if one is running. A no-op if the
    /// item isn't currently being fetched.
    pub fn abort(&self, id: &str) {
        if let Some(token) = self.cancel_tokens.get(id) {
            token.cancel();
        }
    }

    /// Cancels every in-flight fetch.
    pub fn abort_all(&self) {
        for entry in self.cancel_tokens.iter() {
            entry.value().cancel();
        }
    }
}

/// Errors surfaced by engine operations that aren't part of the drain
/// loop itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} is not registered")]
    NotRegistered(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The download engine: owns the drain loop, the concurrency gate, and
/// the per-item cancellation registry.
#[derive(Debug)]
pub struct DownloadEngine {
    store: Arc<dyn Store>,
    fetch: Arc<dyn FetchClient>,
    storage_probe: Arc<dyn StorageProbe>,
    connectivity: Arc<dyn ConnectivitySource>,
    events: EventBus,
    semaphore: Arc<Semaphore>,
    wake: Arc<Notify>,
    stop_token: CancellationToken,
    cancel_tokens: Arc<DashMap<String, CancellationToken>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadEngine {
    /// Builds an engine. Does not start draining until [`Self::start`]
    /// is called.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        fetch: Arc<dyn FetchClient>,
        storage_probe: Arc<dyn StorageProbe>,
        connectivity: Arc<dyn ConnectivitySource>,
        events: EventBus,
        concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            fetch,
            storage_probe,
            connectivity,
            events,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            wake: Arc::new(Notify::new()),
            stop_token: CancellationToken::new(),
            cancel_tokens: Arc::new(DashMap::new()),
            drain_task: Mutex::new(None),
        })
    }

    /// Returns a handle the registry manager uses to nudge this engine's
    /// drain loop, without holding a reference to the engine itself.
    #[must_use]
    pub fn wake_handle(&self) -> WakeHandle {
        WakeHandle::new(Arc::clone(&self.wake), Arc::clone(&self.cancel_tokens))
    }

    /// Starts the drain loop as a background task. Idempotent: calling
    /// this while already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.drain_task.lock().await;
        if guard.is_some() {
            return;
        }
        let engine = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            engine.drain_loop().await;
        }));
    }

    /// Signals the drain loop to stop after its current dispatch round,
    /// aborts every in-flight download (see [`Self::abort_all_downloads`]),
    /// and waits for the background task to exit.
    pub async fn stop(&self) {
        self.stop_token.cancel();
        self.abort_all_downloads();
        self.wake.notify_one();

        let mut guard = self.drain_task.lock().await;
        if let Some(task) = guard.take() {
            let _ = task.await;
        }
    }

    /// Cancels an in-flight fetch for `id`, if one is running. The item
    /// moves to `Paused`, preserving its resumption offset; no retry
    /// budget is consumed.
    pub fn abort_download(&self, id: &str) {
        if let Some(token) = self.cancel_tokens.get(id) {
            token.cancel();
        }
    }

    /// Cancels every in-flight fetch.
    pub fn abort_all_downloads(&self) {
        for entry in &self.cancel_tokens {
            entry.value().cancel();
        }
    }

    /// Resets a `Failed` item back to `Pending` with a fresh retry
    /// budget, then wakes the drain loop.
    #[instrument(skip(self))]
    pub async fn retry_failed(&self, id: &str) -> Result<(), EngineError> {
        let mut entry = self
            .store
            .get_queue(id)
            .await?
            .ok_or_else(|| EngineError::NotRegistered(id.to_string()))?;

        if entry.status() != Status::Failed {
            return Ok(());
        }

        entry.status_str = Status::Pending.as_str().to_string();
        entry.retry_count = 0;
        entry.error_message = None;
        self.store.put_queue(&entry).await?;
        mirror_status(&*self.store, id, Status::Pending, None, None).await?;

        self.wake.notify_one();
        Ok(())
    }

    async fn drain_loop(self: Arc<Self>) {
        info!("drain loop started");
        loop {
            if self.stop_token.is_cancelled() {
                break;
            }

            if !self.connectivity.is_online() {
                self.abort_all_downloads();
                self.events.emit(Event::Connectivity { online: false });

                let mut connectivity_rx = self.connectivity.subscribe();
                tokio::select! {
                    () = self.stop_token.cancelled() => break,
                    result = connectivity_rx.changed() => {
                        if result.is_ok() && *connectivity_rx.borrow() {
                            self.events.emit(Event::Connectivity { online: true });
                        }
                        continue;
                    }
                }
            }

            if let Err(err) = evaluate_expiry(&*self.store, &self.events).await {
                warn!(error = %err, "expiry evaluation failed; continuing");
            }

            match self.dispatch_ready_items().await {
                Ok(dispatched_any) if !dispatched_any => {
                    // Also watch connectivity here, not just `wake`: a
                    // transition to offline while an item is in flight and
                    // this loop is otherwise idle must be noticed promptly,
                    // not only on the next unrelated wake.
                    let mut connectivity_rx = self.connectivity.subscribe();
                    tokio::select! {
                        () = self.stop_token.cancelled() => break,
                        () = self.wake.notified() => {}
                        _ = connectivity_rx.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "dispatch round failed; backing off briefly");
                    tokio::select! {
                        () = self.stop_token.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        self.events.emit(Event::Stopped);
        info!("drain loop stopped");
    }

    /// One dispatch round: evaluates candidates in priority order and
    /// spawns a bounded number of fetch tasks. Returns `true` if at
    /// least one item was dispatched (including deferrals), so the
    /// caller knows whether to wait for a wake-up.
    async fn dispatch_ready_items(self: &Arc<Self>) -> Result<bool, StoreError> {
        let registry_entries = self.store.get_all_registry().await?;
        let mut priority_by_id = std::collections::HashMap::new();
        for entry in &registry_entries {
            priority_by_id.insert(entry.id.clone(), (entry.priority, entry.registered_at));
        }

        // Every status a stalled or interrupted item could be sitting in
        // is eligible, not just `pending` — this is what lets a
        // crash-recovered `in-progress` row (left behind by
        // a killed process; nothing in `cancel_tokens` for it here) or a
        // freshly-`expired` row get picked back up. A row already being
        // driven by a live task in *this* process is skipped below via
        // `cancel_tokens`, so it never gets a second concurrent fetch.
        let mut candidates: Vec<QueueEntry> = self
            .store
            .get_all_queue()
            .await?
            .into_iter()
            .filter(|entry| {
                matches!(
                    entry.status(),
                    Status::Pending | Status::InProgress | Status::Paused | Status::Deferred | Status::Expired
                )
            })
            .collect();

        candidates.sort_by_key(|entry| priority_by_id.get(&entry.id).copied().unwrap_or((i64::MAX, i64::MAX)));

        let mut dispatched_any = false;

        for candidate in candidates {
            if self.cancel_tokens.contains_key(&candidate.id) {
                continue;
            }

            let Some(registry_entry) = registry_entries.iter().find(|entry| entry.id == candidate.id) else {
                continue;
            };

            let required_bytes = registry_entry
                .total_bytes
                .or(candidate.total_bytes)
                .map(|total| total as u64);

            if let Some(required) = required_bytes {
                match self.storage_probe.has_enough_space(required).await {
                    Ok(true) => {}
                    Ok(false) => {
                        self.defer_item(&candidate.id, "insufficient storage quota").await?;
                        dispatched_any = true;
                        continue;
                    }
                    Err(err) => {
                        warn!(error = %err, id = %candidate.id, "storage probe failed; dispatching anyway");
                    }
                }
            }

            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };

            dispatched_any = true;
            let engine = Arc::clone(self);
            let id = candidate.id.clone();
            tokio::spawn(async move {
                engine.process_item(id, permit).await;
            });
        }

        Ok(dispatched_any)
    }

    async fn defer_item(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.store.get_queue(id).await? {
            entry.status_str = Status::Deferred.as_str().to_string();
            entry.deferred_reason = Some(reason.to_string());
            self.store.put_queue(&entry).await?;
        }
        mirror_status(&*self.store, id, Status::Deferred, None, Some(reason)).await?;
        self.events.emit(Event::Deferred {
            id: id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    #[instrument(skip(self, permit), fields(id = %id))]
    async fn process_item(self: Arc<Self>, id: String, permit: tokio::sync::OwnedSemaphorePermit) {
        let cancel_token = CancellationToken::new();
        self.cancel_tokens.insert(id.clone(), cancel_token.clone());

        let outcome = self.run_retry_loop(&id, &cancel_token).await;

        self.cancel_tokens.remove(&id);
        drop(permit);

        if let Err(err) = outcome {
            warn!(error = %err, "item processing failed at the store layer");
        }

        self.wake.notify_one();
    }

    async fn run_retry_loop(&self, id: &str, cancel_token: &CancellationToken) -> Result<(), StoreError> {
        loop {
            let Some(mut queue_entry) = self.store.get_queue(id).await? else {
                return Ok(());
            };
            let Some(registry_entry) = self.store.get_registry(id).await? else {
                return Ok(());
            };

            let attempt = queue_entry.retry_count as u32 + 1;
            queue_entry.status_str = Status::InProgress.as_str().to_string();
            queue_entry.last_attempt_at = Some(now_unix());
            self.store.put_queue(&queue_entry).await?;
            mirror_status(&*self.store, id, Status::InProgress, None, None).await?;
            self.events.emit(Event::StatusChanged {
                id: id.to_string(),
                status: Status::InProgress,
            });

            let existing_data = queue_entry.data.clone().unwrap_or_default();
            let known_total_bytes = queue_entry
                .total_bytes
                .or(registry_entry.total_bytes)
                .map(|value| value.max(0) as u64);
            let outcome = run_attempt(
                &registry_entry,
                existing_data,
                known_total_bytes,
                &*self.fetch,
                &*self.store,
                &self.events,
                cancel_token,
            )
            .await;

            match outcome {
                AttemptOutcome::Success {
                    data,
                    total_bytes,
                    mime_type,
                } => {
                    self.finish_success(id, &registry_entry, data, total_bytes, mime_type).await?;
                    return Ok(());
                }
                AttemptOutcome::Cancelled { data } => {
                    self.finish_paused(id, data).await?;
                    return Ok(());
                }
                AttemptOutcome::Permanent { message } => {
                    // Only a malformed URL reaches here; retrying would
                    // never help, so the retry budget is left untouched.
                    self.finish_failed(id, &message, queue_entry.retry_count as u32).await?;
                    return Ok(());
                }
                AttemptOutcome::Retryable { message, retry_after_secs } => {
                    if attempt >= MAX_ATTEMPTS {
                        self.finish_failed(id, &message, attempt).await?;
                        return Ok(());
                    }

                    let mut failed_entry = self.store.get_queue(id).await?.unwrap_or(queue_entry);
                    failed_entry.status_str = Status::Pending.as_str().to_string();
                    failed_entry.retry_count = attempt as i64;
                    failed_entry.error_message = Some(message.clone());
                    self.store.put_queue(&failed_entry).await?;
                    mirror_status(&*self.store, id, Status::Pending, None, None).await?;
                    self.events.emit(Event::Error {
                        id: id.to_string(),
                        message: message.clone(),
                        retry_count: attempt,
                        will_retry: true,
                    });

                    let delay = retry_after_secs
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| backoff_delay(attempt));

                    tokio::select! {
                        () = cancel_token.cancelled() => {
                            let data = failed_entry.data.clone().unwrap_or_default();
                            self.finish_paused(id, data).await?;
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn finish_success(
        &self,
        id: &str,
        registry_entry: &RegistryEntry,
        data: Vec<u8>,
        total_bytes: Option<u64>,
        mime_type: Option<String>,
    ) -> Result<(), StoreError> {
        let now = now_unix();
        let bytes_len = data.len() as i64;
        let expires_at = if registry_entry.ttl_seconds > 0 {
            Some(now + registry_entry.ttl_seconds)
        } else {
            None
        };

        if let Some(mut entry) = self.store.get_queue(id).await? {
            entry.status_str = Status::Complete.as_str().to_string();
            entry.data = Some(data);
            entry.mime_type = mime_type;
            entry.bytes_downloaded = bytes_len;
            entry.total_bytes = total_bytes.map(|value| value as i64);
            entry.byte_offset = bytes_len;
            entry.completed_at = Some(now);
            entry.expires_at = expires_at;
            entry.error_message = None;
            entry.deferred_reason = None;
            self.store.put_queue(&entry).await?;
        }

        mirror_status_with_total(
            &*self.store,
            id,
            Status::Complete,
            Some(bytes_len),
            total_bytes.map(|value| value as i64),
            None,
        )
        .await?;
        self.events.emit(Event::Complete {
            id: id.to_string(),
            mime_type,
        });
        Ok(())
    }

    /// Persists a cancelled/offline-interrupted attempt's accumulated
    /// bytes as the new resumption point and moves the row to `Paused`.
    /// `deferred_reason` is stamped `"network-offline"` when the abort
    /// was connectivity-driven, so a caller inspecting status can tell
    /// the two `paused` causes apart.
    async fn finish_paused(&self, id: &str, data: Vec<u8>) -> Result<(), StoreError> {
        let bytes_len = data.len() as i64;
        let offline_reason = if self.connectivity.is_online() {
            None
        } else {
            Some("network-offline")
        };

        if let Some(mut entry) = self.store.get_queue(id).await? {
            entry.status_str = Status::Paused.as_str().to_string();
            entry.bytes_downloaded = bytes_len;
            entry.byte_offset = bytes_len;
            entry.data = Some(data);
            entry.deferred_reason = offline_reason.map(str::to_string);
            self.store.put_queue(&entry).await?;
        }
        mirror_status(&*self.store, id, Status::Paused, Some(bytes_len), offline_reason).await?;
        self.events.emit(Event::StatusChanged {
            id: id.to_string(),
            status: Status::Paused,
        });
        Ok(())
    }

    async fn finish_failed(&self, id: &str, message: &str, retry_count: u32) -> Result<(), StoreError> {
        if let Some(mut entry) = self.store.get_queue(id).await? {
            entry.status_str = Status::Failed.as_str().to_string();
            entry.error_message = Some(message.to_string());
            entry.retry_count = retry_count as i64;
            self.store.put_queue(&entry).await?;
        }
        mirror_status(&*self.store, id, Status::Failed, None, None).await?;
        self.events.emit(Event::Error {
            id: id.to_string(),
            message: message.to_string(),
            retry_count,
            will_retry: false,
        });
        Ok(())
    }
}

/// `round(downloaded / total * 100)`, or `None` when `total` isn't known.
fn percent_of(downloaded: u64, total: Option<u64>) -> Option<u32> {
    total.filter(|&total| total > 0).map(|total| {
        ((downloaded as f64 / total as f64) * 100.0).round() as u32
    })
}

/// Persists the byte offset reached by one chunk of a chunked transfer:
/// updates the queue row's `bytes_downloaded`/`byte_offset`/`total_bytes`,
/// mirrors the same fields onto the registry row, and emits a progress
/// event. A store failure here is logged and swallowed rather than
/// aborting the attempt — the bytes already landed in memory and will be
/// persisted by the next successful chunk, or by the final success path.
pub(crate) async fn persist_chunk_progress(
    store: &dyn Store,
    events: &EventBus,
    id: &str,
    bytes_downloaded: u64,
    total_bytes: Option<u64>,
) -> Result<(), StoreError> {
    if let Some(mut entry) = store.get_queue(id).await? {
        entry.bytes_downloaded = bytes_downloaded as i64;
        entry.byte_offset = bytes_downloaded as i64;
        if let Some(total) = total_bytes {
            entry.total_bytes = Some(total as i64);
        }
        store.put_queue(&entry).await?;
    }
    mirror_status_with_total(
        store,
        id,
        Status::InProgress,
        Some(bytes_downloaded as i64),
        total_bytes.map(|value| value as i64),
        None,
    )
    .await?;
    events.emit(Event::Progress {
        id: id.to_string(),
        bytes_downloaded,
        total_bytes,
        percent: percent_of(bytes_downloaded, total_bytes),
    });
    Ok(())
}

/// Writes the status (and, optionally, `bytes_downloaded`/`deferred_reason`)
/// mirrored fields onto the `registry` row, tolerating the brief window
/// where `queue` has already moved on but `registry` hasn't yet been
/// written.
async fn mirror_status(
    store: &dyn Store,
    id: &str,
    status: Status,
    bytes_downloaded: Option<i64>,
    deferred_reason: Option<&str>,
) -> Result<(), StoreError> {
    mirror_status_with_total(store, id, status, bytes_downloaded, None, deferred_reason).await
}

/// Like [`mirror_status`], additionally mirroring `queue.total_bytes`
/// once it's been reconciled from a HEAD/GET probe.
async fn mirror_status_with_total(
    store: &dyn Store,
    id: &str,
    status: Status,
    bytes_downloaded: Option<i64>,
    total_bytes: Option<i64>,
    deferred_reason: Option<&str>,
) -> Result<(), StoreError> {
    let Some(mut entry) = store.get_registry(id).await? else {
        return Ok(());
    };
    entry.status_str = status.as_str().to_string();
    if let Some(bytes) = bytes_downloaded {
        entry.bytes_downloaded = bytes;
    }
    if total_bytes.is_some() {
        entry.mirrored_total_bytes = total_bytes;
    }
    entry.deferred_reason = deferred_reason.map(str::to_string);
    entry.updated_at = now_unix();
    store.put_registry(&entry).await
}
