//! Local snapshot of remote records for offline reads.
//!
//! Records are grouped in partitions, one per (collection, tenant), each
//! stored under `cache:<collection>:<tenant>`. Deletes are tombstones: the
//! record stays with `deleted = true` and is hidden from reads.
//!
//! When an offline create is confirmed under a remote id, the local id is
//! kept as an alias (`alias:<collection>`), so ids handed out while offline
//! keep resolving after the record moves.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::metadata::MetadataStore;
use crate::remote::{merge_fields, Document};
use crate::storage::{StorageError, TieredStorage};

const CACHE_PREFIX: &str = "cache:";
const ALIAS_PREFIX: &str = "alias:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub collection: String,
    pub tenant_id: String,
    pub entity_id: String,
    pub payload: Value,
    /// Epoch millis of the last local write
    pub last_updated: i64,
    /// Written locally and not yet confirmed by the remote store
    pub is_offline: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl CacheRecord {
    pub fn new(collection: &str, tenant_id: &str, entity_id: &str, payload: Value) -> Self {
        Self {
            collection: collection.to_string(),
            tenant_id: tenant_id.to_string(),
            entity_id: entity_id.to_string(),
            payload,
            last_updated: crate::now_millis(),
            is_offline: false,
            deleted: false,
        }
    }

    #[must_use]
    pub fn offline(mut self) -> Self {
        self.is_offline = true;
        self
    }
}

fn partition_key(collection: &str, tenant_id: &str) -> String {
    format!("{}{}:{}", CACHE_PREFIX, collection, tenant_id)
}

fn collection_prefix(collection: &str) -> String {
    format!("{}{}:", CACHE_PREFIX, collection)
}

fn alias_key(collection: &str) -> String {
    format!("{}{}", ALIAS_PREFIX, collection)
}

pub struct LocalCache {
    storage: Arc<TieredStorage>,
    metadata: Arc<MetadataStore>,
    /// Serializes partition read-modify-write
    write_lock: Mutex<()>,
}

impl LocalCache {
    pub fn new(storage: Arc<TieredStorage>, metadata: Arc<MetadataStore>) -> Self {
        Self {
            storage,
            metadata,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self, key: &str) -> Result<Vec<CacheRecord>, StorageError> {
        Ok(self.storage.get_json::<Vec<CacheRecord>>(key).await?.unwrap_or_default())
    }

    async fn save(&self, key: &str, records: &[CacheRecord]) -> Result<(), StorageError> {
        let opts = self.storage.sensitive_options().tag("cache");
        self.storage.set_json(key, records, &opts).await
    }

    /// Replace the snapshot of one partition with what the remote returned.
    ///
    /// Local writes still awaiting sync are kept: an offline record whose id
    /// is in `documents` keeps its local payload, and one missing from
    /// `documents` is carried over.
    pub async fn cache(&self, collection: &str, tenant_id: &str, documents: Vec<Document>) -> Result<usize, StorageError> {
        let key = partition_key(collection, tenant_id);
        let _guard = self.write_lock.lock().await;

        let pending: Vec<CacheRecord> = self.load(&key).await?.into_iter().filter(|r| r.is_offline).collect();
        let pending_ids: HashSet<&str> = pending.iter().map(|r| r.entity_id.as_str()).collect();

        let mut records: Vec<CacheRecord> = documents
            .into_iter()
            .filter(|doc| !pending_ids.contains(doc.id.as_str()))
            .map(|doc| CacheRecord::new(collection, tenant_id, &doc.id, doc.data))
            .collect();
        let kept = pending.len();
        records.extend(pending);

        self.save(&key, &records).await?;
        self.metadata.record_fetch(collection, records.len()).await?;

        debug!(collection, tenant_id, records = records.len(), kept_offline = kept, "Cache partition replaced");
        Ok(records.len())
    }

    /// Live records of one partition.
    pub async fn read(&self, collection: &str, tenant_id: &str) -> Result<Vec<CacheRecord>, StorageError> {
        self.read_filtered(collection, tenant_id, |_| true).await
    }

    /// Live records of one partition matching `predicate`.
    pub async fn read_filtered<P>(
        &self,
        collection: &str,
        tenant_id: &str,
        predicate: P,
    ) -> Result<Vec<CacheRecord>, StorageError>
    where
        P: Fn(&CacheRecord) -> bool,
    {
        Ok(self
            .load(&partition_key(collection, tenant_id))
            .await?
            .into_iter()
            .filter(|r| !r.deleted && predicate(r))
            .collect())
    }

    /// First live record with this id in any partition of the collection.
    pub async fn read_one(&self, collection: &str, entity_id: &str) -> Result<Option<CacheRecord>, StorageError> {
        for key in self.storage.keys_with_prefix(&collection_prefix(collection)).await? {
            if let Some(record) = self
                .load(&key)
                .await?
                .into_iter()
                .find(|r| r.entity_id == entity_id && !r.deleted)
            {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Insert or replace by id in the record's own partition.
    pub async fn upsert(&self, record: CacheRecord) -> Result<(), StorageError> {
        let key = partition_key(&record.collection, &record.tenant_id);
        let _guard = self.write_lock.lock().await;

        let mut records = self.load(&key).await?;
        match records.iter_mut().find(|r| r.entity_id == record.entity_id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        self.save(&key, &records).await
    }

    /// Locate a record across the collection's partitions and apply `f`.
    /// Returns `false` when no record matched.
    async fn modify<F>(&self, collection: &str, entity_id: &str, include_deleted: bool, f: F) -> Result<bool, StorageError>
    where
        F: FnOnce(&mut CacheRecord),
    {
        let _guard = self.write_lock.lock().await;

        for key in self.storage.keys_with_prefix(&collection_prefix(collection)).await? {
            let mut records = self.load(&key).await?;
            if let Some(record) = records
                .iter_mut()
                .find(|r| r.entity_id == entity_id && (include_deleted || !r.deleted))
            {
                f(record);
                self.save(&key, &records).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Shallow-merge `updates` into a live record's payload. `false` if absent.
    pub async fn patch_one(&self, collection: &str, entity_id: &str, updates: &Value) -> Result<bool, StorageError> {
        self.modify(collection, entity_id, false, |record| {
            merge_fields(&mut record.payload, updates);
            record.last_updated = crate::now_millis();
        })
        .await
    }

    /// Tombstone a record. `false` if absent.
    pub async fn mark_deleted(&self, collection: &str, entity_id: &str) -> Result<bool, StorageError> {
        self.modify(collection, entity_id, true, |record| {
            record.deleted = true;
            record.last_updated = crate::now_millis();
        })
        .await
    }

    pub async fn set_offline(&self, collection: &str, entity_id: &str, is_offline: bool) -> Result<bool, StorageError> {
        self.modify(collection, entity_id, true, |record| record.is_offline = is_offline)
            .await
    }

    /// Move a record to the id the remote store assigned and remember the
    /// old id as an alias of the new one.
    pub async fn rekey(&self, collection: &str, old_id: &str, new_id: &str) -> Result<bool, StorageError> {
        let moved = self
            .modify(collection, old_id, true, |record| record.entity_id = new_id.to_string())
            .await?;

        let _guard = self.write_lock.lock().await;
        let key = alias_key(collection);
        let mut aliases = self.load_aliases(&key).await?;
        aliases.insert(old_id.to_string(), new_id.to_string());
        self.storage
            .set_json(&key, &aliases, &self.storage.sensitive_options().tag("cache"))
            .await?;
        Ok(moved)
    }

    async fn load_aliases(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        Ok(self.storage.get_json::<HashMap<String, String>>(key).await?.unwrap_or_default())
    }

    /// The current id of an entity: the remote id if `entity_id` is a local
    /// id that has since been confirmed, otherwise `entity_id` itself.
    pub async fn resolve_id(&self, collection: &str, entity_id: &str) -> Result<String, StorageError> {
        Ok(self
            .load_aliases(&alias_key(collection))
            .await?
            .remove(entity_id)
            .unwrap_or_else(|| entity_id.to_string()))
    }

    /// Drop every partition and id alias. Returns how many partitions were removed.
    pub async fn clear(&self) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock().await;
        let removed = self.storage.clear_prefix(CACHE_PREFIX).await?;
        self.storage.clear_prefix(ALIAS_PREFIX).await?;
        info!(partitions = removed, "Local cache cleared");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn cache() -> (LocalCache, Arc<MetadataStore>) {
        let storage = Arc::new(TieredStorage::memory_only("lab_t1_"));
        let metadata = Arc::new(MetadataStore::load(storage.clone()).await.unwrap());
        (LocalCache::new(storage, metadata.clone()), metadata)
    }

    fn doc(id: &str, data: Value) -> Document {
        Document { id: id.to_string(), data }
    }

    #[tokio::test]
    async fn test_cache_replaces_snapshot_and_records_fetch() {
        let (c, meta) = cache().await;
        c.cache("patients", "t1", vec![doc("p1", json!({"n": 1})), doc("p2", json!({"n": 2}))])
            .await
            .unwrap();
        c.cache("patients", "t1", vec![doc("p3", json!({"n": 3}))]).await.unwrap();

        let ids: Vec<String> = c.read("patients", "t1").await.unwrap().into_iter().map(|r| r.entity_id).collect();
        assert_eq!(ids, vec!["p3".to_string()]);
        assert_eq!(meta.snapshot().await.collections["patients"].record_count, 1);
    }

    #[tokio::test]
    async fn test_cache_keeps_unsynced_offline_records() {
        let (c, _) = cache().await;
        c.upsert(CacheRecord::new("patients", "t1", "local-1", json!({"n": "mine"})).offline())
            .await
            .unwrap();
        c.upsert(CacheRecord::new("patients", "t1", "p1", json!({"n": "edited"})).offline())
            .await
            .unwrap();

        c.cache("patients", "t1", vec![doc("p1", json!({"n": "server"})), doc("p2", json!({}))])
            .await
            .unwrap();

        let records = c.read("patients", "t1").await.unwrap();
        assert_eq!(records.len(), 3);
        let p1 = records.iter().find(|r| r.entity_id == "p1").unwrap();
        assert_eq!(p1.payload, json!({"n": "edited"}));
        assert!(records.iter().any(|r| r.entity_id == "local-1" && r.is_offline));
    }

    #[tokio::test]
    async fn test_partitions_are_isolated_by_tenant() {
        let (c, _) = cache().await;
        c.cache("orders", "t1", vec![doc("o1", json!({}))]).await.unwrap();
        c.cache("orders", "t2", vec![doc("o2", json!({}))]).await.unwrap();

        assert_eq!(c.read("orders", "t1").await.unwrap().len(), 1);
        assert_eq!(c.read("orders", "t2").await.unwrap()[0].entity_id, "o2");
        // read_one spans partitions
        assert!(c.read_one("orders", "o2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_read_filtered_and_tombstones() {
        let (c, _) = cache().await;
        c.cache(
            "patients",
            "t1",
            vec![
                doc("p1", json!({"ward": 3})),
                doc("p2", json!({"ward": 3})),
                doc("p3", json!({"ward": 4})),
            ],
        )
        .await
        .unwrap();

        assert!(c.mark_deleted("patients", "p2").await.unwrap());

        let ward3 = c
            .read_filtered("patients", "t1", |r| r.payload["ward"] == 3)
            .await
            .unwrap();
        assert_eq!(ward3.len(), 1);
        assert_eq!(ward3[0].entity_id, "p1");
        assert!(c.read_one("patients", "p2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_patch_one_merges_or_reports_absent() {
        let (c, _) = cache().await;
        c.cache("patients", "t1", vec![doc("p1", json!({"name": "A", "age": 30}))])
            .await
            .unwrap();

        assert!(c.patch_one("patients", "p1", &json!({"age": 31})).await.unwrap());
        assert!(!c.patch_one("patients", "missing", &json!({"age": 1})).await.unwrap());

        let p1 = c.read_one("patients", "p1").await.unwrap().unwrap();
        assert_eq!(p1.payload, json!({"name": "A", "age": 31}));
    }

    #[tokio::test]
    async fn test_rekey_and_set_offline() {
        let (c, _) = cache().await;
        c.upsert(CacheRecord::new("patients", "t1", "local-1", json!({})).offline())
            .await
            .unwrap();

        assert!(c.rekey("patients", "local-1", "srv-1").await.unwrap());
        assert!(c.set_offline("patients", "srv-1", false).await.unwrap());

        assert!(c.read_one("patients", "local-1").await.unwrap().is_none());
        let record = c.read_one("patients", "srv-1").await.unwrap().unwrap();
        assert!(!record.is_offline);
    }

    #[tokio::test]
    async fn test_rekey_keeps_local_id_resolvable() {
        let (c, _) = cache().await;
        c.upsert(CacheRecord::new("patients", "t1", "local-1", json!({})).offline())
            .await
            .unwrap();
        c.rekey("patients", "local-1", "srv-1").await.unwrap();

        assert_eq!(c.resolve_id("patients", "local-1").await.unwrap(), "srv-1");
        assert_eq!(c.resolve_id("patients", "srv-1").await.unwrap(), "srv-1");
        // Aliases are per collection
        assert_eq!(c.resolve_id("orders", "local-1").await.unwrap(), "local-1");

        c.clear().await.unwrap();
        assert_eq!(c.resolve_id("patients", "local-1").await.unwrap(), "local-1");
    }

    #[tokio::test]
    async fn test_clear_drops_all_partitions() {
        let (c, _) = cache().await;
        c.cache("a", "t1", vec![doc("1", json!({}))]).await.unwrap();
        c.cache("b", "t1", vec![doc("2", json!({}))]).await.unwrap();

        assert_eq!(c.clear().await.unwrap(), 2);
        assert!(c.read("a", "t1").await.unwrap().is_empty());
    }
}
