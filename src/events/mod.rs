//! Synchronous event bus.
//!
//! Listener callbacks run inline, on the caller's task, wrapped in
//! `catch_unwind` so a panicking listener can't take down the emitter.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::warn;

use crate::model::Status;

/// Why a `registered` event fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisteredReason {
    /// The id had no prior registry row.
    New,
    /// The id existed with a strictly lower `version`.
    VersionUpdated,
}

impl RegisteredReason {
    /// The wire/string form used in event payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::VersionUpdated => "version-updated",
        }
    }
}

impl fmt::Display for RegisteredReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Every notification this crate can emit.
/// Marked `#[non_exhaustive]` so new topics can be added without breaking
/// downstream `match` arms.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Event {
    /// A new item was registered, or an existing one was version-bumped.
    Registered { id: String, reason: RegisteredReason },
    /// An item's status changed.
    StatusChanged { id: String, status: Status },
    /// Download progress for an in-progress item.
    Progress {
        id: String,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
        /// Rounded percent complete, or `None` when the total size isn't
        /// known.
        percent: Option<u32>,
    },
    /// An item finished downloading successfully.
    Complete { id: String, mime_type: Option<String> },
    /// An item's payload expired (`ttl_seconds` elapsed).
    Expired { id: String },
    /// An attempt failed. `will_retry` is `false` only on the terminal
    /// attempt.
    Error {
        id: String,
        message: String,
        retry_count: u32,
        will_retry: bool,
    },
    /// An item was deferred (e.g. for lack of storage quota).
    Deferred { id: String, reason: String },
    /// An item was removed from the registry, or had its payload reset
    /// because a protected row survived the delete.
    Deleted { id: String, registry_removed: bool },
    /// The engine's drain loop stopped.
    Stopped,
    /// Connectivity state changed.
    Connectivity { online: bool },
}

/// A live subscription. Dropping it unsubscribes the listener.
#[must_use = "dropping this immediately unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    bus: Arc<Inner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.listeners.remove(&self.id);
    }
}

/// `true` to keep the listener subscribed, `false` to drop it after this
/// call — used by [`EventBus::once`] to unsubscribe itself without
/// removing its own entry from inside the `DashMap` iteration `emit`
/// holds (which would deadlock against the shard lock `emit` is
/// currently reading under).
type Listener = Box<dyn Fn(&Event) -> bool + Send + Sync>;

struct Inner {
    listeners: DashMap<u64, Listener>,
    next_id: AtomicU64,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("listener_count", &self.listeners.len())
            .finish()
    }
}

/// A synchronous, fan-out event emitter.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: DashMap::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Registers `listener`, returning a [`Subscription`] that
    /// unsubscribes it on drop.
    pub fn on<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.insert(id, Box::new(move |event| {
            listener(event);
            true
        }));
        Subscription {
            id,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Registers `listener`, unsubscribing it automatically after its
    /// first invocation. Since this bus has no per-topic routing,
    /// `listener` still runs for every [`Event`] variant, not just one
    /// topic; callers that only care about one topic should match on it
    /// inside `listener`.
    pub fn once<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.insert(id, Box::new(move |event| {
            listener(event);
            false
        }));
        Subscription {
            id,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Emits `event` to every currently-registered listener, in
    /// unspecified order. A listener that panics is contained: its panic
    /// is caught and logged, and the remaining listeners still run. A
    /// listener that returns `false` (only `once`'s wrapper does) is
    /// unsubscribed after the full fan-out completes, never from inside
    /// the iteration itself (`DashMap`'s shard locks aren't reentrant, so
    /// removing the entry being visited would deadlock).
    pub fn emit(&self, event: Event) {
        let mut to_remove = Vec::new();
        for entry in &self.inner.listeners {
            let listener = entry.value();
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(true) => {}
                Ok(false) => to_remove.push(*entry.key()),
                Err(_) => warn!("event listener panicked; continuing to remaining listeners"),
            }
        }
        for id in to_remove {
            self.inner.listeners.remove(&id);
        }
    }

    /// Number of currently-registered listeners. Mostly useful in tests.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }
}
