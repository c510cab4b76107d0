//! # Offline Sync
//!
//! An offline-first data layer: reads and writes keep working while the
//! device is disconnected, writes are queued durably, and the queue is
//! reconciled with the remote store when connectivity returns.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    OfflineAwareGateway<T>                    │
//! │  • Typed create / read / search / update / delete           │
//! │  • Online: remote store first, cache refreshed              │
//! │  • Offline or remote failure: cache + operation queue       │
//! └─────────────────────────────────────────────────────────────┘
//!              │                                  │
//!              ▼                                  ▼
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │       LocalCache         │      │     OperationQueue       │
//! │  • Per collection+tenant │      │  • Ordered, durable      │
//! │  • Tombstoned deletes    │      │  • Kept for audit        │
//! └──────────────────────────┘      └──────────────────────────┘
//!              │                                  ▲
//!              │            ┌─────────────────────┘
//!              │            │   (drained on reconnect / timer)
//!              │   ┌──────────────────┐      ┌────────────────┐
//!              │   │    SyncEngine    │◀─────│ NetworkMonitor │
//!              │   └──────────────────┘      └────────────────┘
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TieredStorage                          │
//! │  • SQLite → per-key files → memory, cascading on failure    │
//! │  • Namespaced keys, TTL, tags, zstd, AES-256-GCM            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use offline_sync::{InMemoryRemoteStore, NetworkMonitor, OfflineConfig, OfflineStore};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Patient {
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = OfflineConfig {
//!         project: "labops".into(),
//!         tenant_id: "clinic-42".into(),
//!         data_dir: Some("/var/lib/labops".into()),
//!         watched_collections: vec!["patients".into()],
//!         ..Default::default()
//!     };
//!
//!     let network = Arc::new(NetworkMonitor::new(true));
//!     let store = OfflineStore::initialize(config, Arc::new(InMemoryRemoteStore::new()), network)
//!         .await
//!         .expect("Failed to initialize");
//!
//!     let patients = store.gateway::<Patient>("patients");
//!     let ada = patients.create(&Patient { name: "Ada".into() }).await.unwrap();
//!     println!("Created {} (offline: {})", ada.id, ada.is_offline);
//!
//!     store.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`service`]: [`OfflineStore`], the root object wiring everything
//! - [`gateway`]: Typed online/offline CRUD
//! - [`engine`]: The [`SyncEngine`] draining the queue
//! - [`queue`]: Durable operation log
//! - [`cache`]: Local record snapshot
//! - [`storage`]: Storage tiers and platform detection
//! - [`remote`]: The remote store trait and an in-memory implementation

pub mod config;
pub mod storage;
pub mod compression;
pub mod crypto;
pub mod resilience;
pub mod metadata;
pub mod queue;
pub mod cache;
pub mod network;
pub mod remote;
pub mod engine;
pub mod gateway;
pub mod service;
pub mod metrics;
mod observers;

pub use config::OfflineConfig;
pub use storage::{PlatformCapabilities, SetOptions, StorageError, StorageTier, StoragePlan, StoredEntry, TierKind, TieredStorage};
pub use metadata::{CollectionStats, SyncMetadata};
pub use queue::{Operation, OperationQueue, QueueEntry, QueueStats};
pub use cache::{CacheRecord, LocalCache};
pub use network::NetworkMonitor;
pub use observers::Subscription;
pub use remote::{Document, InMemoryRemoteStore, QueryFilter, RemoteError, RemoteStore};
pub use engine::{EngineState, SyncEngine, SyncError, SyncHandle, SyncProgress, SyncResult, SyncStatus};
pub use gateway::{GatewayError, OfflineAwareGateway, Record, WriteOutcome};
pub use service::{OfflineError, OfflineStore};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;

/// Wall clock in epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
