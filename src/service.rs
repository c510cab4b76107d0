// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The root object applications hold.
//!
//! [`OfflineStore`] is built explicitly and owns everything: storage tiers,
//! queue, cache, metadata and the sync engine. There are no globals, so two
//! stores (two tenants, or a test next to a real one) never share state.
//!
//! # Example
//!
//! ```rust,no_run
//! use offline_sync::{InMemoryRemoteStore, NetworkMonitor, OfflineConfig, OfflineStore};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let network = Arc::new(NetworkMonitor::new(false));
//! let store = OfflineStore::initialize(
//!     OfflineConfig::default(),
//!     Arc::new(InMemoryRemoteStore::new()),
//!     network.clone(),
//! )
//! .await?;
//!
//! let patients = store.gateway::<Value>("patients");
//! let record = patients.create(&json!({"name": "Ada"})).await?;
//! assert!(record.is_offline);
//!
//! network.set_connected(true);
//! store.sync_now().await?;
//! store.shutdown().await;
//! # Ok(())
//! # }
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cache::LocalCache;
use crate::config::OfflineConfig;
use crate::engine::{SyncEngine, SyncError, SyncHandle, SyncProgress, SyncResult, SyncStatus};
use crate::gateway::OfflineAwareGateway;
use crate::metadata::MetadataStore;
use crate::network::NetworkMonitor;
use crate::observers::Subscription;
use crate::queue::OperationQueue;
use crate::remote::RemoteStore;
use crate::storage::{StorageError, TieredStorage};

#[derive(Error, Debug)]
pub enum OfflineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

fn validate(config: &OfflineConfig) -> Result<(), OfflineError> {
    if config.project.is_empty() {
        return Err(OfflineError::Config("project must not be empty".into()));
    }
    if config.tenant_id.is_empty() {
        return Err(OfflineError::Config("tenant_id must not be empty".into()));
    }
    if config.tenant_field.as_deref() == Some("") {
        return Err(OfflineError::Config("tenant_field must not be empty when set".into()));
    }
    Ok(())
}

pub struct OfflineStore {
    config: OfflineConfig,
    storage: Arc<TieredStorage>,
    metadata: Arc<MetadataStore>,
    queue: Arc<OperationQueue>,
    cache: Arc<LocalCache>,
    remote: Arc<dyn RemoteStore>,
    network: Arc<NetworkMonitor>,
    engine: Arc<SyncEngine>,
    handle: Mutex<Option<SyncHandle>>,
}

impl OfflineStore {
    /// Detect the platform, open storage and load persisted state.
    /// Starts the background sync loop when `auto_sync` is set.
    pub async fn initialize(
        config: OfflineConfig,
        remote: Arc<dyn RemoteStore>,
        network: Arc<NetworkMonitor>,
    ) -> Result<Self, OfflineError> {
        validate(&config)?;

        let phase_start = Instant::now();
        let storage = TieredStorage::for_platform(&config).await?;
        crate::metrics::record_startup_phase("storage", phase_start.elapsed());

        Self::with_storage(config, Arc::new(storage), remote, network).await
    }

    /// Build on an already opened storage backend (custom tiers, tests).
    pub async fn with_storage(
        config: OfflineConfig,
        storage: Arc<TieredStorage>,
        remote: Arc<dyn RemoteStore>,
        network: Arc<NetworkMonitor>,
    ) -> Result<Self, OfflineError> {
        validate(&config)?;

        let phase_start = Instant::now();
        match storage.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "Purged expired entries"),
            Err(e) => warn!(error = %e, "Expired entry sweep failed"),
        }

        let metadata = Arc::new(MetadataStore::load(storage.clone()).await?);
        let queue = Arc::new(OperationQueue::open(storage.clone(), metadata.clone()).await?);
        let cache = Arc::new(LocalCache::new(storage.clone(), metadata.clone()));
        let engine = Arc::new(SyncEngine::new(
            &config,
            queue.clone(),
            cache.clone(),
            metadata.clone(),
            remote.clone(),
            network.clone(),
        ));
        crate::metrics::record_startup_phase("load_state", phase_start.elapsed());

        let handle = config.auto_sync.then(|| engine.start());
        info!(
            namespace = %storage.namespace(),
            tiers = ?storage.tier_names(),
            auto_sync = config.auto_sync,
            "Offline store ready"
        );

        Ok(Self {
            config,
            storage,
            metadata,
            queue,
            cache,
            remote,
            network,
            engine,
            handle: Mutex::new(handle),
        })
    }

    /// Typed CRUD for one collection of the active tenant.
    pub fn gateway<T>(&self, collection: &str) -> OfflineAwareGateway<T>
    where
        T: Serialize + DeserializeOwned,
    {
        OfflineAwareGateway::new(
            collection,
            &self.config,
            self.remote.clone(),
            self.network.clone(),
            self.queue.clone(),
            self.cache.clone(),
        )
    }

    pub async fn sync_now(&self) -> Result<SyncResult, SyncError> {
        self.engine.sync_now().await
    }

    pub async fn sync_status(&self) -> SyncStatus {
        self.engine.status().await
    }

    pub fn on_sync_progress<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        self.engine.on_sync_progress(callback)
    }

    pub fn watch_collection(&self, collection: &str) {
        self.engine.watch_collection(collection);
    }

    pub fn unwatch_collection(&self, collection: &str) {
        self.engine.unwatch_collection(collection);
    }

    /// Drop queued operations, cached records and sync metadata (logout,
    /// tenant switch). Unsynced writes are lost.
    pub async fn clear_offline_data(&self) -> Result<(), OfflineError> {
        let pending = self.queue.pending_count().await;
        if pending > 0 {
            warn!(pending, "Discarding unsynced operations");
        }
        self.queue.clear().await?;
        self.cache.clear().await?;
        self.metadata.reset().await?;
        info!("Offline data cleared");
        Ok(())
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<TieredStorage> {
        &self.storage
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Start the background loop if it isn't running.
    pub async fn start_background_sync(&self) {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().map_or(true, |h| !h.is_running()) {
            *handle = Some(self.engine.start());
        }
    }

    /// Stop the background loop. Persisted state needs no flushing: every
    /// write is already on device storage.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.shutdown().await;
        }
        info!("Offline store shut down");
    }
}
