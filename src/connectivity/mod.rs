//! Connectivity source. The engine treats "offline" as a reason to
//! short-circuit the drain loop without consuming retry budget.
//!
//! There is no network-probing implementation here: it dials out
//! directly and lets `reqwest` surface connection failures.
//! [`ManualConnectivity`] mirrors that — a host that actually wants
//! OS-level connectivity signals sets it explicitly.

use async_trait::async_trait;
use tokio::sync::watch;

/// Connectivity contract. A host embeds this crate alongside its own
/// network-state signal (e.g. a platform "online"/"offline" event) by
/// implementing this trait and calling `set_online` from that signal.
#[async_trait]
pub trait ConnectivitySource: Send + Sync + std::fmt::Debug {
    /// Current connectivity state.
    fn is_online(&self) -> bool;

    /// Subscribes to connectivity changes. The returned receiver yields
    /// the current value immediately, then each subsequent change.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// A [`ConnectivitySource`] whose state is set directly by the host.
/// Defaults to online.
#[derive(Debug, Clone)]
pub struct ManualConnectivity {
    sender: watch::Sender<bool>,
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ManualConnectivity {
    /// Creates a source starting in the given state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (sender, _receiver) = watch::channel(online);
        Self { sender }
    }

    /// Updates the connectivity state, notifying subscribers. A no-op if
    /// the state is unchanged.
    pub fn set_online(&self, online: bool) {
        self.sender.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }
}

#[async_trait]
impl ConnectivitySource for ManualConnectivity {
    fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}
