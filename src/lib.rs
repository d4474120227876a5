//! A durable, resumable, priority-ordered download manager for
//! arbitrary binary assets.
//!
//! Callers register items with [`registry::RegistryManager::register_file`]
//! and retrieve their payload once ready via
//! [`registry::RegistryManager::retrieve`]. A background
//! [`engine::DownloadEngine`] drains the queue: bounded concurrency,
//! automatic retry with backoff, resumable transfers, storage-quota
//! awareness, and offline/cancellation handling. [`manager::Manager`]
//! wires the default `SQLite`-backed store and `reqwest`-backed fetch
//! client together; each collaborator is a trait
//! ([`store::Store`], [`fetch::FetchClient`], [`storage_probe::StorageProbe`],
//! [`connectivity::ConnectivitySource`]) so a host can substitute its own.
//!
//! ```no_run
//! # use std::path::Path;
//! # use offline_data_manager::{manager::Manager, store::StoreConfig, model::RegistrationInput};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Manager::open(Path::new("."), StoreConfig::default()).await?;
//! manager.start().await;
//! manager
//!     .registry
//!     .register_file(RegistrationInput {
//!         id: "dataset-1".to_string(),
//!         download_url: "https://example.com/dataset.bin".to_string(),
//!         mime_type: None,
//!         version: 1,
//!         protected: false,
//!         priority: 10,
//!         ttl_seconds: 0,
//!         total_bytes: None,
//!         metadata: serde_json::json!({}),
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod connectivity;
pub mod engine;
pub mod events;
pub mod fetch;
pub mod manager;
pub mod model;
pub mod registry;
pub mod storage_probe;
pub mod store;
mod util;

pub use manager::Manager;
