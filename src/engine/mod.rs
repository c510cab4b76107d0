// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine.
//!
//! The [`SyncEngine`] drains the operation queue into the remote store and
//! then refills the local cache for every watched collection.
//!
//! # States
//!
//! ```text
//! Idle → Syncing → Idle
//! ```
//!
//! A pass only starts when the device is online and no other pass is
//! running. Requests arriving mid-pass are dropped, not queued; whatever
//! was enqueued after the pass took its snapshot goes out with the next one.
//!
//! # Pass
//!
//! 1. Snapshot the pending entries.
//! 2. Apply them one by one, in enqueue order. A failed entry is recorded
//!    and the pass continues. Later entries for the same entity are held
//!    back for the rest of the pass so the remote never sees them out of
//!    order.
//! 3. Stamp `last_sync_time`, then refill watched collections.

mod lifecycle;
mod types;

pub use lifecycle::SyncHandle;
pub use types::{EngineState, SyncError, SyncProgress, SyncResult, SyncStatus};

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::LocalCache;
use crate::config::OfflineConfig;
use crate::metadata::MetadataStore;
use crate::network::NetworkMonitor;
use crate::observers::{Observers, Subscription};
use crate::queue::{Operation, OperationQueue, QueueEntry};
use crate::remote::{QueryFilter, RemoteError, RemoteStore};

/// Releases the single-flight flag when a pass ends, however it ends.
struct SyncGuard<'a> {
    flag: &'a AtomicBool,
    state: &'a watch::Sender<EngineState>,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.state.send_replace(EngineState::Idle);
        crate::metrics::set_engine_state("Idle");
    }
}

pub struct SyncEngine {
    pub(super) queue: Arc<OperationQueue>,
    pub(super) cache: Arc<LocalCache>,
    pub(super) metadata: Arc<MetadataStore>,
    pub(super) remote: Arc<dyn RemoteStore>,
    pub(super) network: Arc<NetworkMonitor>,

    tenant_id: String,
    tenant_field: Option<String>,
    watched: RwLock<BTreeSet<String>>,
    pub(super) sync_interval: Option<Duration>,

    syncing: AtomicBool,
    state: watch::Sender<EngineState>,
    progress: Observers<SyncProgress>,
}

impl SyncEngine {
    pub fn new(
        config: &OfflineConfig,
        queue: Arc<OperationQueue>,
        cache: Arc<LocalCache>,
        metadata: Arc<MetadataStore>,
        remote: Arc<dyn RemoteStore>,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            queue,
            cache,
            metadata,
            remote,
            network,
            tenant_id: config.tenant_id.clone(),
            tenant_field: config.tenant_field.clone(),
            watched: RwLock::new(config.watched_collections.iter().cloned().collect()),
            sync_interval: config.sync_interval(),
            syncing: AtomicBool::new(false),
            state,
            progress: Observers::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Refill `collection` from the remote after every pass.
    pub fn watch_collection(&self, collection: &str) {
        if self.watched.write().insert(collection.to_string()) {
            debug!(collection, "Watching collection");
        }
    }

    pub fn unwatch_collection(&self, collection: &str) {
        self.watched.write().remove(collection);
    }

    pub fn watched_collections(&self) -> Vec<String> {
        self.watched.read().iter().cloned().collect()
    }

    pub fn on_sync_progress<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        self.progress.subscribe(callback)
    }

    pub async fn status(&self) -> SyncStatus {
        let meta = self.metadata.snapshot().await;
        SyncStatus {
            is_offline: !self.network.is_connected(),
            pending_changes: meta.pending_changes,
            last_sync_time: meta.last_sync_time,
        }
    }

    /// Run a pass now.
    ///
    /// Fails with [`SyncError::Offline`] or [`SyncError::AlreadySyncing`]
    /// when a pass can't start; per-entry failures are reported in the
    /// [`SyncResult`], not as an error.
    pub async fn sync_now(&self) -> Result<SyncResult, SyncError> {
        if !self.network.is_connected() {
            crate::metrics::record_sync_skipped("offline");
            return Err(SyncError::Offline);
        }
        if self.syncing.swap(true, Ordering::AcqRel) {
            crate::metrics::record_sync_skipped("already_syncing");
            return Err(SyncError::AlreadySyncing);
        }
        let _guard = SyncGuard {
            flag: &self.syncing,
            state: &self.state,
        };
        self.state.send_replace(EngineState::Syncing);
        crate::metrics::set_engine_state("Syncing");

        self.run_pass().await
    }

    /// Background trigger: like [`Self::sync_now`] but a pass that can't
    /// start is silently dropped.
    pub async fn request_sync(&self) -> Option<SyncResult> {
        match self.sync_now().await {
            Ok(result) => Some(result),
            Err(SyncError::Offline) | Err(SyncError::AlreadySyncing) => {
                debug!("Sync request dropped");
                None
            }
            Err(SyncError::Storage(e)) => {
                error!(error = %e, "Sync pass aborted: device storage unavailable");
                crate::metrics::record_error("engine", "sync", "storage");
                None
            }
        }
    }

    #[tracing::instrument(skip(self), fields(total, synced, failed))]
    async fn run_pass(&self) -> Result<SyncResult, SyncError> {
        let _timer = crate::metrics::LatencyTimer::new("engine", "sync_pass");
        let started = Instant::now();

        let entries = self.queue.pending().await;
        let total = entries.len();
        tracing::Span::current().record("total", total);
        if total > 0 {
            info!(pending = total, "Sync pass started");
        }

        let mut result = SyncResult::default();
        let mut last_error = None;
        // Remote ids assigned during this pass, keyed by (collection, local id)
        let mut assigned: HashMap<(String, String), String> = HashMap::new();
        // Entities with a failed entry earlier in this pass
        let mut held: HashSet<(String, String)> = HashSet::new();

        for (idx, mut entry) in entries.into_iter().enumerate() {
            if let Some(remote_id) = assigned.get(&(entry.collection.clone(), entry.entity_id.clone())) {
                entry.entity_id = remote_id.clone();
            }
            let target = (entry.collection.clone(), entry.entity_id.clone());

            let outcome = if held.contains(&target) {
                Err(format!(
                    "held back: earlier operation on {}/{} failed",
                    entry.collection, entry.entity_id
                ))
            } else {
                self.apply(&entry).await.map_err(|e| e.to_string())
            };

            match outcome {
                Ok(remote_id) => {
                    self.queue.mark_synced(entry.id).await?;

                    // Gateway writes that queue and flag this entity wait here
                    let _gate = self.queue.write_gate().await;
                    let entity_id = match remote_id {
                        Some(remote_id) if remote_id != entry.entity_id => {
                            self.adopt_remote_id(&entry, &remote_id).await?;
                            assigned.insert(target, remote_id.clone());
                            remote_id
                        }
                        _ => entry.entity_id.clone(),
                    };
                    if !self.queue.has_pending_for(&entry.collection, &entity_id).await {
                        self.cache.set_offline(&entry.collection, &entity_id, false).await?;
                    }
                    crate::metrics::record_sync_entry(&entry.collection, &entry.operation.to_string(), true);
                    result.synced += 1;
                }
                Err(message) => {
                    warn!(
                        id = entry.id,
                        collection = %entry.collection,
                        entity_id = %entry.entity_id,
                        operation = %entry.operation,
                        error = %message,
                        "Queue entry failed, will retry next pass"
                    );
                    self.queue.record_failure(entry.id, &message).await?;
                    crate::metrics::record_sync_entry(&entry.collection, &entry.operation.to_string(), false);
                    held.insert(target);
                    result.failed += 1;
                    result.errors.push(format!(
                        "{} {}/{}: {}",
                        entry.operation, entry.collection, entry.entity_id, message
                    ));
                    last_error = Some(message);
                }
            }

            self.progress.notify(&SyncProgress {
                total,
                completed: idx + 1,
                in_progress: true,
                last_error: last_error.clone(),
            });
        }

        self.metadata.record_sync(crate::now_millis()).await?;
        self.refill_watched().await;

        result.success = result.failed == 0;
        self.progress.notify(&SyncProgress {
            total,
            completed: total,
            in_progress: false,
            last_error,
        });

        let span = tracing::Span::current();
        span.record("synced", result.synced);
        span.record("failed", result.failed);
        crate::metrics::record_sync_pass(result.synced, result.failed, started.elapsed());
        if total > 0 {
            info!(synced = result.synced, failed = result.failed, "Sync pass finished");
        }
        Ok(result)
    }

    /// One remote call per entry. Returns the assigned id for creates.
    async fn apply(&self, entry: &QueueEntry) -> Result<Option<String>, RemoteError> {
        match entry.operation {
            Operation::Create => self.remote.insert(&entry.collection, &entry.payload).await.map(Some),
            Operation::Update => self
                .remote
                .patch(&entry.collection, &entry.entity_id, &entry.payload)
                .await
                .map(|()| None),
            Operation::Delete => self
                .remote
                .remove(&entry.collection, &entry.entity_id)
                .await
                .map(|()| None),
        }
    }

    /// A create confirmed under a new id: move the cache record, keep the
    /// local id as an alias and point later queue entries at the new id.
    /// Caller holds the queue's write gate.
    async fn adopt_remote_id(&self, entry: &QueueEntry, remote_id: &str) -> Result<(), SyncError> {
        self.cache.rekey(&entry.collection, &entry.entity_id, remote_id).await?;
        let remapped = self
            .queue
            .remap_entity(&entry.collection, &entry.entity_id, remote_id)
            .await?;
        debug!(
            collection = %entry.collection,
            local_id = %entry.entity_id,
            remote_id,
            remapped,
            "Offline create confirmed"
        );
        Ok(())
    }

    fn refill_filter(&self) -> QueryFilter {
        match self.tenant_field {
            Some(ref field) => QueryFilter::new().eq(field.as_str(), self.tenant_id.as_str()),
            None => QueryFilter::new(),
        }
    }

    /// Refresh every watched collection. Failures leave the stale snapshot.
    async fn refill_watched(&self) {
        let filter = self.refill_filter();
        for collection in self.watched_collections() {
            let refilled = match self.remote.query(&collection, &filter).await {
                Ok(documents) => self
                    .cache
                    .cache(&collection, &self.tenant_id, documents)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match refilled {
                Ok(count) => {
                    debug!(collection = %collection, records = count, "Collection refilled");
                    crate::metrics::record_refill(&collection, true, count);
                }
                Err(e) => {
                    warn!(collection = %collection, error = %e, "Refill failed, keeping cached snapshot");
                    crate::metrics::record_refill(&collection, false, 0);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheRecord;
    use crate::remote::InMemoryRemoteStore;
    use crate::storage::TieredStorage;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    struct Fixture {
        engine: SyncEngine,
        remote: Arc<InMemoryRemoteStore>,
        network: Arc<NetworkMonitor>,
        queue: Arc<OperationQueue>,
        cache: Arc<LocalCache>,
    }

    async fn fixture(config: OfflineConfig) -> Fixture {
        let storage = Arc::new(TieredStorage::memory_only(config.namespace()));
        let metadata = Arc::new(MetadataStore::load(storage.clone()).await.unwrap());
        let queue = Arc::new(OperationQueue::open(storage.clone(), metadata.clone()).await.unwrap());
        let cache = Arc::new(LocalCache::new(storage, metadata.clone()));
        let remote = Arc::new(InMemoryRemoteStore::new());
        let network = Arc::new(NetworkMonitor::new(true));
        let engine = SyncEngine::new(
            &config,
            queue.clone(),
            cache.clone(),
            metadata,
            remote.clone(),
            network.clone(),
        );
        Fixture { engine, remote, network, queue, cache }
    }

    fn config() -> OfflineConfig {
        OfflineConfig {
            project: "lab".into(),
            tenant_id: "t1".into(),
            ..Default::default()
        }
    }

    async fn offline_create(f: &Fixture, collection: &str, local_id: &str, data: Value) {
        f.cache
            .upsert(CacheRecord::new(collection, "t1", local_id, data.clone()).offline())
            .await
            .unwrap();
        f.queue.enqueue(collection, local_id, Operation::Create, data).await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_and_single_flight_guards() {
        let f = fixture(config()).await;
        f.network.set_connected(false);
        assert!(matches!(f.engine.sync_now().await, Err(SyncError::Offline)));
        assert!(f.engine.request_sync().await.is_none());

        f.network.set_connected(true);
        f.engine.syncing.store(true, Ordering::SeqCst);
        assert!(matches!(f.engine.sync_now().await, Err(SyncError::AlreadySyncing)));
        f.engine.syncing.store(false, Ordering::SeqCst);

        assert!(f.engine.sync_now().await.unwrap().success);
        assert_eq!(f.engine.state(), EngineState::Idle);
        assert!(!f.engine.is_syncing());
    }

    #[tokio::test]
    async fn test_offline_create_is_rekeyed_and_followups_remapped() {
        let f = fixture(config()).await;
        offline_create(&f, "patients", "local-1", json!({"name": "A"})).await;
        f.cache.patch_one("patients", "local-1", &json!({"age": 40})).await.unwrap();
        f.queue
            .enqueue("patients", "local-1", Operation::Update, json!({"age": 40}))
            .await
            .unwrap();

        let result = f.engine.sync_now().await.unwrap();
        assert_eq!(result.synced, 2);
        assert!(result.success);

        assert_eq!(f.remote.document("patients", "srv-1"), Some(json!({"name": "A", "age": 40})));
        let record = f.cache.read_one("patients", "srv-1").await.unwrap().unwrap();
        assert!(!record.is_offline);
        assert!(f.cache.read_one("patients", "local-1").await.unwrap().is_none());
        assert_eq!(f.cache.resolve_id("patients", "local-1").await.unwrap(), "srv-1");
        assert_eq!(f.queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_failure_holds_back_later_entries_for_same_entity() {
        let f = fixture(config()).await;
        f.remote.seed("patients", "p2", json!({"v": 0}));

        // "gone" doesn't exist remotely, so its first patch fails with NotFound
        f.queue.enqueue("patients", "gone", Operation::Update, json!({"v": 1})).await.unwrap();
        f.queue.enqueue("patients", "gone", Operation::Update, json!({"v": 2})).await.unwrap();
        f.queue.enqueue("patients", "p2", Operation::Update, json!({"v": 3})).await.unwrap();

        let result = f.engine.sync_now().await.unwrap();
        assert_eq!(result.synced, 1);
        assert_eq!(result.failed, 2);
        assert!(!result.success);
        assert_eq!(result.errors.len(), 2);

        // Only the first "gone" update reached the remote
        let patches: Vec<_> = f
            .remote
            .calls()
            .into_iter()
            .filter(|c| c.operation == "patch" && c.id.as_deref() == Some("gone"))
            .collect();
        assert_eq!(patches.len(), 1);
        assert_eq!(f.remote.document("patients", "p2"), Some(json!({"v": 3})));

        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|e| e.retry_count == 1));
    }

    #[tokio::test]
    async fn test_progress_reports_every_entry_and_final() {
        let f = fixture(config()).await;
        for i in 0..3 {
            offline_create(&f, "orders", &format!("local-{}", i), json!({"n": i})).await;
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = f.engine.on_sync_progress(move |p| s.lock().push(p.clone()));

        f.engine.sync_now().await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].completed, 1);
        assert!(seen[2].in_progress);
        assert_eq!(seen[3].completed, 3);
        assert!(!seen[3].in_progress);
    }

    #[tokio::test]
    async fn test_refill_uses_tenant_filter_and_survives_failures() {
        let f = fixture(OfflineConfig {
            watched_collections: vec!["patients".into()],
            ..config()
        })
        .await;
        f.remote.seed("patients", "p1", json!({"tenantId": "t1"}));
        f.remote.seed("patients", "p2", json!({"tenantId": "t2"}));

        f.engine.sync_now().await.unwrap();
        let cached = f.cache.read("patients", "t1").await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].entity_id, "p1");

        // Refill failure keeps the stale snapshot and the pass still succeeds
        f.remote.set_failing(true);
        let result = f.engine.sync_now().await.unwrap();
        assert!(result.success);
        assert_eq!(f.cache.read("patients", "t1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_and_unwatch() {
        let f = fixture(config()).await;
        f.engine.watch_collection("orders");
        f.engine.watch_collection("patients");
        f.engine.watch_collection("orders");
        assert_eq!(f.engine.watched_collections(), vec!["orders".to_string(), "patients".to_string()]);

        f.engine.unwatch_collection("orders");
        assert_eq!(f.engine.watched_collections(), vec!["patients".to_string()]);
    }

    #[tokio::test]
    async fn test_status_reflects_network_and_queue() {
        let f = fixture(config()).await;
        f.network.set_connected(false);
        offline_create(&f, "patients", "local-1", json!({})).await;

        let status = f.engine.status().await;
        assert!(status.is_offline);
        assert_eq!(status.pending_changes, 1);
        assert!(status.last_sync_time.is_none());
    }
}
