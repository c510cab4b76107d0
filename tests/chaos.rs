//! Chaos Testing for the offline data layer
//!
//! This module tests failure scenarios using:
//! 1. **FailingTier wrappers** - storage tiers that fail on demand
//! 2. **FailingRemote wrappers** - remote calls failing at specific call counts
//! 3. **Flapping connectivity** - concurrent writers while the network toggles
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use offline_sync::storage::memory::MemoryTier;
use offline_sync::{
    Document, GatewayError, InMemoryRemoteStore, NetworkMonitor, OfflineConfig, OfflineStore, QueryFilter,
    RemoteError, RemoteStore, SetOptions, StorageError, StorageTier, StoredEntry, SyncError, TieredStorage,
};

// =============================================================================
// Failing Tier Wrapper
// =============================================================================

/// Memory tier whose writes, reads or both can be switched into failure.
pub struct FailingTier {
    inner: MemoryTier,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    write_attempts: AtomicU64,
}

impl FailingTier {
    pub fn new() -> Self {
        Self {
            inner: MemoryTier::new(),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            write_attempts: AtomicU64::new(0),
        }
    }

    pub fn failing_writes() -> Self {
        let tier = Self::new();
        tier.fail_writes.store(true, Ordering::SeqCst);
        tier
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn stored(&self) -> usize {
        self.inner.len()
    }

    fn check(flag: &AtomicBool) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            Err(StorageError::tier("failing", "injected failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageTier for FailingTier {
    fn name(&self) -> &str {
        "failing"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
        Self::check(&self.fail_reads)?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, entry: &StoredEntry) -> Result<(), StorageError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_writes)?;
        self.inner.put(key, entry).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        Self::check(&self.fail_writes)?;
        self.inner.delete(key).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Self::check(&self.fail_reads)?;
        self.inner.keys_with_prefix(prefix).await
    }
}

// =============================================================================
// Failing Remote Wrapper
// =============================================================================

/// Wraps a remote store and fails the listed call numbers (1-indexed,
/// counting every call).
pub struct FailingRemote {
    inner: InMemoryRemoteStore,
    call_count: AtomicU64,
    fail_on_calls: Vec<u64>,
}

impl FailingRemote {
    pub fn new(fail_on_calls: Vec<u64>) -> Self {
        Self {
            inner: InMemoryRemoteStore::new(),
            call_count: AtomicU64::new(0),
            fail_on_calls,
        }
    }

    fn maybe_fail(&self) -> Result<(), RemoteError> {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_calls.contains(&count) {
            Err(RemoteError::Unavailable(format!("injected failure on call {}", count)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for FailingRemote {
    async fn insert(&self, collection: &str, data: &Value) -> Result<String, RemoteError> {
        self.maybe_fail()?;
        self.inner.insert(collection, data).await
    }

    async fn patch(&self, collection: &str, id: &str, fields: &Value) -> Result<(), RemoteError> {
        self.maybe_fail()?;
        self.inner.patch(collection, id, fields).await
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.maybe_fail()?;
        self.inner.remove(collection, id).await
    }

    async fn query(&self, collection: &str, filter: &QueryFilter) -> Result<Vec<Document>, RemoteError> {
        self.maybe_fail()?;
        self.inner.query(collection, filter).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn config() -> OfflineConfig {
    OfflineConfig {
        project: "labops".into(),
        tenant_id: "clinic-1".into(),
        auto_sync: false,
        ..Default::default()
    }
}

fn tiered(tiers: Vec<Arc<dyn StorageTier>>) -> Arc<TieredStorage> {
    Arc::new(TieredStorage::new(config().namespace(), tiers).unwrap())
}

// =============================================================================
// Storage chaos
// =============================================================================

#[tokio::test]
async fn chaos_primary_tier_throws_value_still_readable() {
    let primary = Arc::new(FailingTier::failing_writes());
    let fallback = Arc::new(MemoryTier::new());
    let storage = tiered(vec![primary.clone() as Arc<dyn StorageTier>, fallback.clone()]);

    storage.set("k", &json!({"v": 1}), &SetOptions::new()).await.unwrap();

    assert_eq!(storage.get("k").await.unwrap(), Some(json!({"v": 1})));
    assert_eq!(primary.stored(), 0);
    assert_eq!(fallback.len(), 1);
    assert!(primary.write_attempts.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn chaos_offline_writes_survive_failing_primary() {
    let primary = Arc::new(FailingTier::failing_writes());
    let storage = tiered(vec![primary.clone() as Arc<dyn StorageTier>, Arc::new(MemoryTier::new())]);
    let network = Arc::new(NetworkMonitor::new(false));
    let remote = Arc::new(InMemoryRemoteStore::new());
    let store = OfflineStore::with_storage(config(), storage, remote.clone(), network.clone())
        .await
        .unwrap();

    let gateway = store.gateway::<Value>("patients");
    let record = gateway.create(&json!({"name": "Ada"})).await.unwrap();
    assert!(record.is_offline);
    assert_eq!(store.sync_status().await.pending_changes, 1);

    network.set_connected(true);
    let result = store.sync_now().await.unwrap();
    assert_eq!(result.synced, 1);
    assert_eq!(remote.len("patients"), 1);
}

#[tokio::test]
async fn chaos_all_tiers_failing_is_reported_not_panicked() {
    let a = Arc::new(FailingTier::new());
    let b = Arc::new(FailingTier::new());
    let storage = tiered(vec![a.clone() as Arc<dyn StorageTier>, b.clone()]);
    let store = OfflineStore::with_storage(
        config(),
        storage,
        Arc::new(InMemoryRemoteStore::new()),
        Arc::new(NetworkMonitor::new(false)),
    )
    .await
    .unwrap();

    a.set_fail_writes(true);
    b.set_fail_writes(true);

    let err = store
        .gateway::<Value>("patients")
        .create(&json!({"name": "Ada"}))
        .await
        .unwrap_err();
    match err {
        GatewayError::Storage(StorageError::AllTiersFailed(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.queue().all().await.is_empty());
}

#[tokio::test]
async fn chaos_newer_fallback_log_wins_after_primary_recovers() {
    let primary = Arc::new(FailingTier::new());
    let storage = tiered(vec![primary.clone() as Arc<dyn StorageTier>, Arc::new(MemoryTier::new())]);
    let network = Arc::new(NetworkMonitor::new(false));
    let remote = Arc::new(InMemoryRemoteStore::new());

    {
        let store = OfflineStore::with_storage(config(), storage.clone(), remote.clone(), network.clone())
            .await
            .unwrap();
        let gateway = store.gateway::<Value>("orders");
        gateway.create(&json!({"test": "cbc"})).await.unwrap();

        // No pause: both log copies are usually stamped in the same millisecond
        primary.set_fail_writes(true);
        gateway.create(&json!({"test": "lipid"})).await.unwrap();
        primary.set_fail_writes(false);
    }

    // Reload from the same tiers: the fallback's newer queue copy must win
    let store = OfflineStore::with_storage(config(), storage, remote.clone(), network.clone())
        .await
        .unwrap();
    assert_eq!(store.queue().pending_count().await, 2);
    assert_eq!(store.sync_status().await.pending_changes, 2);
}

#[tokio::test]
async fn chaos_remove_during_primary_outage_stays_removed() {
    let primary = Arc::new(FailingTier::new());
    let fallback = Arc::new(MemoryTier::new());
    let storage = tiered(vec![primary.clone() as Arc<dyn StorageTier>, fallback.clone()]);

    storage.set("session", &json!({"user": "ada"}), &SetOptions::new()).await.unwrap();
    primary.set_fail_writes(true);
    storage.remove("session").await.unwrap();
    primary.set_fail_writes(false);

    // The primary still holds the old copy; it must stay shadowed
    assert_eq!(primary.stored(), 1);
    assert_eq!(storage.get("session").await.unwrap(), None);
    assert!(!storage.has("session").await.unwrap());
    assert!(storage.keys().await.unwrap().is_empty());

    // Once the stale copy is gone the marker is compacted away
    primary.inner.delete(&format!("{}session", config().namespace())).await.unwrap();
    storage.purge_expired().await.unwrap();
    assert_eq!(fallback.len(), 0);
}

#[tokio::test]
async fn chaos_clear_offline_data_during_outage_does_not_come_back() {
    let primary = Arc::new(FailingTier::new());
    let tiers = vec![primary.clone() as Arc<dyn StorageTier>, Arc::new(MemoryTier::new()) as Arc<dyn StorageTier>];
    let network = Arc::new(NetworkMonitor::new(false));
    let remote = Arc::new(InMemoryRemoteStore::new());

    let local_id = {
        let store = OfflineStore::with_storage(config(), tiered(tiers.clone()), remote.clone(), network.clone())
            .await
            .unwrap();
        let record = store
            .gateway::<Value>("patients")
            .create(&json!({"name": "Ada"}))
            .await
            .unwrap();

        primary.set_fail_writes(true);
        store.clear_offline_data().await.unwrap();
        primary.set_fail_writes(false);
        record.id
    };

    let store = OfflineStore::with_storage(config(), tiered(tiers), remote.clone(), network.clone())
        .await
        .unwrap();
    assert!(store.queue().all().await.is_empty());
    assert_eq!(store.sync_status().await.pending_changes, 0);
    assert!(store.gateway::<Value>("patients").get(&local_id).await.unwrap().is_none());
    assert!(store.cache().read("patients", "clinic-1").await.unwrap().is_empty());

    network.set_connected(true);
    assert_eq!(store.sync_now().await.unwrap().synced, 0);
    assert_eq!(remote.len("patients"), 0);
}

#[tokio::test]
async fn chaos_storage_dies_mid_sync_releases_lock() {
    let primary = Arc::new(FailingTier::new());
    let storage = tiered(vec![primary.clone() as Arc<dyn StorageTier>]);
    let network = Arc::new(NetworkMonitor::new(false));
    let store = OfflineStore::with_storage(config(), storage, Arc::new(InMemoryRemoteStore::new()), network.clone())
        .await
        .unwrap();
    store.gateway::<Value>("orders").create(&json!({"test": "cbc"})).await.unwrap();

    network.set_connected(true);
    primary.set_fail_all(true);
    assert!(matches!(store.sync_now().await, Err(SyncError::Storage(_))));
    assert!(!store.engine().is_syncing());

    primary.set_fail_all(false);
    let result = store.sync_now().await.unwrap();
    assert_eq!(result.synced, 1);
}

// =============================================================================
// Remote chaos
// =============================================================================

#[tokio::test]
async fn chaos_partial_remote_failure_continues_batch() {
    // Calls 2 and 4 fail
    let remote = Arc::new(FailingRemote::new(vec![2, 4]));
    let network = Arc::new(NetworkMonitor::new(false));
    let store = OfflineStore::with_storage(
        config(),
        Arc::new(TieredStorage::memory_only(config().namespace())),
        remote.clone(),
        network.clone(),
    )
    .await
    .unwrap();

    let gateway = store.gateway::<Value>("orders");
    for n in 0..5 {
        gateway.create(&json!({"n": n})).await.unwrap();
    }

    network.set_connected(true);
    let first = store.sync_now().await.unwrap();
    assert_eq!(first.synced, 3);
    assert_eq!(first.failed, 2);
    assert_eq!(store.sync_status().await.pending_changes, 2);

    let second = store.sync_now().await.unwrap();
    assert_eq!(second.synced, 2);
    assert_eq!(second.failed, 0);
    assert_eq!(remote.inner.len("orders"), 5);

    // Nothing left flagged offline
    let cached = store.cache().read("orders", "clinic-1").await.unwrap();
    assert_eq!(cached.len(), 5);
    assert!(cached.iter().all(|r| !r.is_offline));
}

#[tokio::test]
async fn chaos_flapping_network_with_concurrent_writers() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let network = Arc::new(NetworkMonitor::new(true));
    let store = Arc::new(
        OfflineStore::with_storage(
            config(),
            Arc::new(TieredStorage::memory_only(config().namespace())),
            remote.clone(),
            network.clone(),
        )
        .await
        .unwrap(),
    );

    let mut handles = Vec::new();
    for writer in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let gateway = store.gateway::<Value>("samples");
            for n in 0..10 {
                gateway.create(&json!({"writer": writer, "n": n})).await.unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    let flapper = {
        let network = network.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                network.set_connected(i % 2 == 0);
                tokio::task::yield_now().await;
            }
            network.set_connected(true);
        })
    };

    for handle in handles {
        handle.await.unwrap();
    }
    flapper.await.unwrap();

    let queued = store.queue().pending_count().await;
    assert_eq!(store.sync_status().await.pending_changes, queued);
    assert_eq!(remote.len("samples") + queued, 40);

    // Drain; another pass may have been requested concurrently
    loop {
        match store.sync_now().await {
            Ok(_) if store.queue().pending_count().await == 0 => break,
            Ok(_) | Err(SyncError::AlreadySyncing) => tokio::task::yield_now().await,
            Err(e) => panic!("unexpected sync error: {e}"),
        }
    }
    assert_eq!(remote.len("samples"), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_offline_flags_settle_while_passes_race_writers() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let network = Arc::new(NetworkMonitor::new(true));
    let store = Arc::new(
        OfflineStore::with_storage(
            config(),
            Arc::new(TieredStorage::memory_only(config().namespace())),
            remote.clone(),
            network.clone(),
        )
        .await
        .unwrap(),
    );
    for n in 0..4 {
        remote.seed("samples", &format!("s{n}"), json!({"v": 0, "tenantId": "clinic-1"}));
    }
    store.gateway::<Value>("samples").read(|_| true).await.unwrap();
    network.set_connected(false);

    let mut handles = Vec::new();
    for n in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let gateway = store.gateway::<Value>("samples");
            for v in 1..=25 {
                gateway.update(&format!("s{n}"), &json!({"v": v})).await.unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    let syncer = {
        let store = store.clone();
        let network = network.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                network.set_connected(true);
                let _ = store.sync_now().await;
                network.set_connected(false);
                tokio::task::yield_now().await;
            }
        })
    };

    for handle in handles {
        handle.await.unwrap();
    }
    syncer.await.unwrap();

    network.set_connected(true);
    loop {
        match store.sync_now().await {
            Ok(_) if store.queue().pending_count().await == 0 => break,
            Ok(_) | Err(SyncError::AlreadySyncing) => tokio::task::yield_now().await,
            Err(e) => panic!("unexpected sync error: {e}"),
        }
    }

    // A flag set after its entry was synced would stay stuck forever
    let cached = store.cache().read("samples", "clinic-1").await.unwrap();
    assert_eq!(cached.len(), 4);
    assert!(cached.iter().all(|r| !r.is_offline), "stuck offline flags: {cached:?}");
    for n in 0..4 {
        assert_eq!(remote.document("samples", &format!("s{n}")).unwrap()["v"], 25);
    }
}
