//! Data model shared by the registry and the download engine.
//!
//! [`RegistryEntry`] is the authoritative description of a registered
//! item; [`QueueEntry`] is its transient download state; [`Status`] is
//! the lifecycle enum.

mod queue_entry;
mod registry_entry;

pub use queue_entry::{QueueEntry, Status};
pub use registry_entry::{DEFAULT_PRIORITY, RegistrationInput, RegistryEntry};

/// `true` iff `status` is in READY = {`Complete`, `Expired`} — the set of
/// statuses for which the payload is addressable.
#[must_use]
pub fn is_ready_status(status: Status) -> bool {
    matches!(status, Status::Complete | Status::Expired)
}
