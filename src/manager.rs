//! Wires a [`Store`], [`FetchClient`], [`StorageProbe`], and
//! [`ConnectivitySource`] into a [`RegistryManager`] and
//! [`DownloadEngine`] pair that share an [`EventBus`].
//!
//! A single wiring function a binary or embedding host calls once at
//! startup, rather than assembling the pieces by hand.

use std::path::Path;
use std::sync::Arc;

use crate::connectivity::{ConnectivitySource, ManualConnectivity};
use crate::engine::{DEFAULT_CONCURRENCY, DownloadEngine};
use crate::events::EventBus;
use crate::fetch::{FetchClient, ReqwestFetchClient};
use crate::registry::RegistryManager;
use crate::storage_probe::{DiskStorageProbe, StorageProbe};
use crate::store::{SqliteStore, Store, StoreConfig, StoreError};

/// The fully-wired crate entry point: a [`RegistryManager`] for the
/// caller-facing API and a [`DownloadEngine`] driving the drain loop.
/// Both share the same [`Store`] and [`EventBus`].
#[derive(Debug, Clone)]
pub struct Manager {
    /// Registration, status, and retrieval API.
    pub registry: RegistryManager,
    /// The background drain loop. Call [`DownloadEngine::start`] to
    /// begin draining and [`DownloadEngine::stop`] to halt it.
    pub engine: Arc<DownloadEngine>,
    /// Shared event bus; subscribe with [`EventBus::on`].
    pub events: EventBus,
}

impl Manager {
    /// Opens (creating if absent) a `SQLite`-backed store under `dir`,
    /// and wires it to the default [`ReqwestFetchClient`],
    /// [`DiskStorageProbe`], and a [`ManualConnectivity`] source
    /// defaulting to online.
    pub async fn open(dir: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(dir, &config).await?);
        let fetch: Arc<dyn FetchClient> = Arc::new(ReqwestFetchClient::new());
        let storage_probe: Arc<dyn StorageProbe> = Arc::new(DiskStorageProbe::new(dir));
        let connectivity: Arc<dyn ConnectivitySource> = Arc::new(ManualConnectivity::default());

        Ok(Self::assemble(store, fetch, storage_probe, connectivity, DEFAULT_CONCURRENCY))
    }

    /// Opens an in-memory store, for tests and short-lived processes.
    pub async fn open_in_memory(
        fetch: Arc<dyn FetchClient>,
        storage_probe: Arc<dyn StorageProbe>,
        connectivity: Arc<dyn ConnectivitySource>,
        concurrency: usize,
    ) -> Result<Self, StoreError> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().await?);
        Ok(Self::assemble(store, fetch, storage_probe, connectivity, concurrency))
    }

    fn assemble(
        store: Arc<dyn Store>,
        fetch: Arc<dyn FetchClient>,
        storage_probe: Arc<dyn StorageProbe>,
        connectivity: Arc<dyn ConnectivitySource>,
        concurrency: usize,
    ) -> Self {
        let events = EventBus::new();
        let engine = DownloadEngine::new(
            Arc::clone(&store),
            fetch,
            Arc::clone(&storage_probe),
            connectivity,
            events.clone(),
            concurrency,
        );
        let registry = RegistryManager::new(store, events.clone(), engine.wake_handle(), storage_probe);

        Self { registry, engine, events }
    }

    /// Starts the background drain loop.
    pub async fn start(&self) {
        self.engine.start().await;
    }

    /// Stops the background drain loop and waits for it to exit.
    pub async fn stop(&self) {
        self.engine.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ManualConnectivity;
    use crate::fetch::{BodyChunk, FetchBody, FetchError, HeadInfo};
    use crate::model::RegistrationInput;
    use crate::storage_probe::{StorageEstimate, StorageProbeError};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::time::Duration;

    #[derive(Debug)]
    struct RoomyProbe;

    #[async_trait]
    impl StorageProbe for RoomyProbe {
        async fn estimate(&self) -> Result<StorageEstimate, StorageProbeError> {
            Ok(StorageEstimate {
                usage_bytes: 0,
                quota_bytes: u64::MAX,
            })
        }
    }

    #[derive(Debug)]
    struct EchoFetchClient;

    #[async_trait]
    impl FetchClient for EchoFetchClient {
        async fn head(&self, _url: &str) -> Result<HeadInfo, FetchError> {
            Ok(HeadInfo::default())
        }

        async fn get(
            &self,
            _url: &str,
            _range_start: Option<u64>,
            _range_end: Option<u64>,
        ) -> Result<FetchBody, FetchError> {
            let chunk: BodyChunk = Ok(bytes::Bytes::from_static(b"hello"));
            Ok(FetchBody {
                status: 200,
                content_length: Some(5),
                content_encoding: None,
                content_type: None,
                retry_after_secs: None,
                stream: Box::pin(stream::iter(vec![chunk])),
            })
        }
    }

    #[tokio::test]
    async fn manager_end_to_end_register_and_retrieve() {
        let manager = Manager::open_in_memory(
            Arc::new(EchoFetchClient),
            Arc::new(RoomyProbe),
            Arc::new(ManualConnectivity::default()),
            2,
        )
        .await
        .unwrap();

        manager.start().await;
        manager
            .registry
            .register_file(RegistrationInput {
                id: "a".to_string(),
                download_url: "https://example.com/a".to_string(),
                mime_type: None,
                version: 1,
                protected: false,
                priority: 10,
                ttl_seconds: 0,
                total_bytes: None,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if manager.registry.is_ready("a").await.unwrap() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        manager.stop().await;
        let (data, _mime) = manager.registry.retrieve("a").await.unwrap();
        assert_eq!(data, b"hello");
    }
}
