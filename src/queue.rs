//! Durable, ordered log of writes waiting for the remote store.
//!
//! Entries are appended in call order and never reordered. They are not
//! removed when synced; `synced` flips to `true` and the entry stays for
//! audit until [`OperationQueue::purge_synced`] is called explicitly.
//!
//! The whole log is one storage document. Every mutation is a
//! read-modify-write of that document, serialized by an in-process mutex;
//! cross-process writers are not coordinated (one client process per device).
//!
//! `pending_changes` in the metadata document is a mirror of the log. The
//! log is the source of truth: a mirror write that fails is logged and
//! corrected by the next mutation or the next [`OperationQueue::open`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::metadata::MetadataStore;
use crate::storage::{StorageError, TieredStorage};

const QUEUE_KEY: &str = "offline_queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Monotonically increasing, never reused
    pub id: u64,
    pub collection: String,
    /// Target entity (the local id for offline creates)
    pub entity_id: String,
    pub operation: Operation,
    /// Full record for creates, changed fields for updates, `null` for deletes
    pub payload: Value,
    /// Epoch millis, non-decreasing across entries
    pub enqueued_at: i64,
    pub synced: bool,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Persisted form of the log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueLog {
    next_id: u64,
    last_enqueued_at: i64,
    entries: Vec<QueueEntry>,
}

impl QueueLog {
    fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.synced).count()
    }
}

/// Queue counters for observability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub synced: usize,
    /// Entries failed at least once and still pending
    pub retrying: usize,
}

pub struct OperationQueue {
    storage: Arc<TieredStorage>,
    metadata: Arc<MetadataStore>,
    log: Mutex<QueueLog>,
    /// Held by writers that pair a queue change with a cache flag change
    write_gate: Mutex<()>,
}

impl OperationQueue {
    /// Load the persisted log and re-align `pending_changes` with it.
    pub async fn open(storage: Arc<TieredStorage>, metadata: Arc<MetadataStore>) -> Result<Self, StorageError> {
        let log = storage.get_json::<QueueLog>(QUEUE_KEY).await?.unwrap_or_default();

        let pending = log.pending_count();
        if pending > 0 {
            warn!(pending, "Operation queue has entries from previous run, will sync");
        }
        let queue = Self {
            storage,
            metadata,
            log: Mutex::new(log),
            write_gate: Mutex::new(()),
        };
        queue.mirror_pending(pending).await;
        Ok(queue)
    }

    async fn mirror_pending(&self, pending: usize) {
        if let Err(e) = self.metadata.set_pending_changes(pending).await {
            warn!(pending, error = %e, "Failed to update pending_changes, queue log is authoritative");
            crate::metrics::record_error("queue", "mirror_pending", "storage");
        }
    }

    /// Apply `f` to a copy of the log, persist it, then commit and refresh
    /// `pending_changes`, all while holding the lock. Only the log write can
    /// fail the call; once it lands the mutation is committed.
    async fn mutate<R>(&self, f: impl FnOnce(&mut QueueLog) -> R) -> Result<R, StorageError> {
        let mut guard = self.log.lock().await;
        let mut next = guard.clone();
        let out = f(&mut next);

        self.storage.set_json(QUEUE_KEY, &next, &self.storage.sensitive_options()).await?;
        let pending = next.pending_count();
        *guard = next;

        self.mirror_pending(pending).await;
        Ok(out)
    }

    /// Serializes "enqueue + mark the cached record offline" against
    /// "nothing pending + clear the flag" and against id adoption.
    ///
    /// Lock order: gate first, then the log or the cache.
    pub(crate) async fn write_gate(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().await
    }

    /// Append an operation. Never inserted out of order.
    pub async fn enqueue(
        &self,
        collection: &str,
        entity_id: &str,
        operation: Operation,
        payload: Value,
    ) -> Result<QueueEntry, StorageError> {
        let entry = self
            .mutate(|log| {
                log.next_id += 1;
                // Clamp so a wall clock stepping backwards can't reorder by time
                let enqueued_at = crate::now_millis().max(log.last_enqueued_at);
                log.last_enqueued_at = enqueued_at;

                let entry = QueueEntry {
                    id: log.next_id,
                    collection: collection.to_string(),
                    entity_id: entity_id.to_string(),
                    operation,
                    payload,
                    enqueued_at,
                    synced: false,
                    retry_count: 0,
                    last_error: None,
                };
                log.entries.push(entry.clone());
                entry
            })
            .await?;

        debug!(id = entry.id, collection, entity_id, %operation, "Operation enqueued");
        crate::metrics::record_queue_operation(collection, "enqueue");
        Ok(entry)
    }

    /// Unsynced entries in enqueue order.
    pub async fn pending(&self) -> Vec<QueueEntry> {
        self.log
            .lock()
            .await
            .entries
            .iter()
            .filter(|e| !e.synced)
            .cloned()
            .collect()
    }

    /// Every entry, synced ones included.
    pub async fn all(&self) -> Vec<QueueEntry> {
        self.log.lock().await.entries.clone()
    }

    pub async fn get(&self, id: u64) -> Option<QueueEntry> {
        self.log.lock().await.entries.iter().find(|e| e.id == id).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        self.log.lock().await.pending_count()
    }

    pub async fn stats(&self) -> QueueStats {
        let log = self.log.lock().await;
        let pending = log.pending_count();
        QueueStats {
            pending,
            synced: log.entries.len() - pending,
            retrying: log.entries.iter().filter(|e| !e.synced && e.retry_count > 0).count(),
        }
    }

    /// Whether any unsynced entry targets this entity.
    pub async fn has_pending_for(&self, collection: &str, entity_id: &str) -> bool {
        self.log
            .lock()
            .await
            .entries
            .iter()
            .any(|e| !e.synced && e.collection == collection && e.entity_id == entity_id)
    }

    /// Flip `synced`. Returns `false` if the id is unknown.
    pub async fn mark_synced(&self, id: u64) -> Result<bool, StorageError> {
        let found = self
            .mutate(|log| match log.entries.iter_mut().find(|e| e.id == id) {
                Some(entry) => {
                    entry.synced = true;
                    true
                }
                None => false,
            })
            .await?;
        if found {
            crate::metrics::record_queue_operation("*", "synced");
        }
        Ok(found)
    }

    /// Count a failed attempt. Returns the new retry count, `None` if unknown.
    pub async fn record_failure(&self, id: u64, error: &str) -> Result<Option<u32>, StorageError> {
        let retry_count = self
            .mutate(|log| {
                log.entries.iter_mut().find(|e| e.id == id).map(|entry| {
                    entry.retry_count += 1;
                    entry.last_error = Some(error.to_string());
                    entry.retry_count
                })
            })
            .await?;
        crate::metrics::record_queue_operation("*", "failed");
        Ok(retry_count)
    }

    /// Point unsynced entries at `new_id` once the remote assigned a real id.
    pub async fn remap_entity(&self, collection: &str, old_id: &str, new_id: &str) -> Result<usize, StorageError> {
        let remapped = self
            .mutate(|log| {
                let mut n = 0;
                for entry in log
                    .entries
                    .iter_mut()
                    .filter(|e| !e.synced && e.collection == collection && e.entity_id == old_id)
                {
                    entry.entity_id = new_id.to_string();
                    n += 1;
                }
                n
            })
            .await?;
        if remapped > 0 {
            debug!(collection, old_id, new_id, remapped, "Remapped queued operations");
        }
        Ok(remapped)
    }

    /// Drop synced entries. Returns how many were removed.
    pub async fn purge_synced(&self) -> Result<usize, StorageError> {
        let purged = self
            .mutate(|log| {
                let before = log.entries.len();
                log.entries.retain(|e| !e.synced);
                before - log.entries.len()
            })
            .await?;
        info!(purged, "Purged synced queue entries");
        Ok(purged)
    }

    /// Drop everything, pending entries included. The id sequence keeps counting.
    pub async fn clear(&self) -> Result<(), StorageError> {
        self.mutate(|log| log.entries.clear()).await?;
        warn!("Operation queue cleared");
        Ok(())
    }
}
