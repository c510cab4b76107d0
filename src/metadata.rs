//! Device-wide sync bookkeeping.
//!
//! A single [`SyncMetadata`] document per device, persisted through the
//! storage backend and updated under a lock so concurrent writers (the
//! queue and the cache) never lose each other's fields.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::storage::{SetOptions, StorageError, TieredStorage};

const METADATA_KEY: &str = "sync_metadata";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    /// Last successful refill (epoch millis)
    pub last_fetch: i64,
    pub record_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// End of the last sync pass (epoch millis)
    pub last_sync_time: Option<i64>,
    /// Always equals the number of unsynced queue entries
    pub pending_changes: usize,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionStats>,
}

pub struct MetadataStore {
    storage: Arc<TieredStorage>,
    current: Mutex<SyncMetadata>,
}

impl MetadataStore {
    /// Load the persisted document, or start empty.
    pub async fn load(storage: Arc<TieredStorage>) -> Result<Self, StorageError> {
        let current = storage
            .get_json::<SyncMetadata>(METADATA_KEY)
            .await?
            .unwrap_or_default();
        Ok(Self {
            storage,
            current: Mutex::new(current),
        })
    }

    pub async fn snapshot(&self) -> SyncMetadata {
        self.current.lock().await.clone()
    }

    /// Apply `f` and persist. The in-memory copy only changes if the write succeeds.
    async fn update(&self, f: impl FnOnce(&mut SyncMetadata)) -> Result<SyncMetadata, StorageError> {
        let mut guard = self.current.lock().await;
        let mut next = guard.clone();
        f(&mut next);
        self.storage.set_json(METADATA_KEY, &next, &SetOptions::new()).await?;
        *guard = next.clone();
        Ok(next)
    }

    pub async fn set_pending_changes(&self, pending: usize) -> Result<(), StorageError> {
        self.update(|m| m.pending_changes = pending).await?;
        crate::metrics::set_pending_changes(pending);
        Ok(())
    }

    pub async fn record_sync(&self, at: i64) -> Result<(), StorageError> {
        self.update(|m| m.last_sync_time = Some(at)).await?;
        Ok(())
    }

    pub async fn record_fetch(&self, collection: &str, record_count: usize) -> Result<(), StorageError> {
        let now = crate::now_millis();
        self.update(|m| {
            m.collections.insert(
                collection.to_string(),
                CollectionStats {
                    last_fetch: now,
                    record_count,
                },
            );
        })
        .await?;
        Ok(())
    }

    /// Back to an empty document (logout / reset).
    pub async fn reset(&self) -> Result<(), StorageError> {
        let mut guard = self.current.lock().await;
        self.storage.remove(METADATA_KEY).await?;
        *guard = SyncMetadata::default();
        crate::metrics::set_pending_changes(0);
        Ok(())
    }
}
