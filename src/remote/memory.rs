//! In-process remote store for demos and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{merge_fields, Document, QueryFilter, RemoteError, RemoteStore};

/// One call as the remote store saw it, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub operation: &'static str,
    pub collection: String,
    pub id: Option<String>,
    pub data: Value,
}

/// Collections of documents keyed by id, with switchable failure injection.
///
/// Ids are assigned as `srv-<n>`; an id carried in the inserted data is
/// ignored, like a server that owns its key space.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    calls: Mutex<Vec<RemoteCall>>,
    next_id: AtomicU64,
    failing: AtomicBool,
}

impl InMemoryRemoteStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with [`RemoteError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Put a document in place without logging a call.
    pub fn seed(&self, collection: &str, id: &str, data: Value) {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), data);
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.collections.lock().get(collection)?.get(id).cloned()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections.lock().get(collection).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Every call received so far, failed ones included.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    fn log(&self, operation: &'static str, collection: &str, id: Option<&str>, data: &Value) -> Result<(), RemoteError> {
        self.calls.lock().push(RemoteCall {
            operation,
            collection: collection.to_string(),
            id: id.map(str::to_string),
            data: data.clone(),
        });
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn insert(&self, collection: &str, data: &Value) -> Result<String, RemoteError> {
        self.log("insert", collection, None, data)?;
        if !data.is_object() {
            return Err(RemoteError::Rejected("document must be a JSON object".into()));
        }

        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.seed(collection, &id, data.clone());
        Ok(id)
    }

    async fn patch(&self, collection: &str, id: &str, fields: &Value) -> Result<(), RemoteError> {
        self.log("patch", collection, Some(id), fields)?;

        let mut collections = self.collections.lock();
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        merge_fields(doc, fields);
        Ok(())
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.log("remove", collection, Some(id), &Value::Null)?;
        // Idempotent: a retried delete whose first ack was lost still succeeds
        if let Some(docs) = self.collections.lock().get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn query(&self, collection: &str, filter: &QueryFilter) -> Result<Vec<Document>, RemoteError> {
        self.log("query", collection, None, &Value::Null)?;

        let collections = self.collections.lock();
        let docs = collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, data)| filter.matches(data))
                    .map(|(id, data)| Document {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_server_ids() {
        let remote = InMemoryRemoteStore::new();
        let a = remote.insert("patients", &json!({"name": "A"})).await.unwrap();
        let b = remote.insert("patients", &json!({"name": "B"})).await.unwrap();

        assert_eq!(a, "srv-1");
        assert_eq!(b, "srv-2");
        assert_eq!(remote.len("patients"), 2);
    }

    #[tokio::test]
    async fn test_patch_merges_and_reports_missing() {
        let remote = InMemoryRemoteStore::new();
        remote.seed("patients", "p1", json!({"name": "A", "age": 30}));

        remote.patch("patients", "p1", &json!({"age": 31})).await.unwrap();
        assert_eq!(remote.document("patients", "p1"), Some(json!({"name": "A", "age": 31})));

        let err = remote.patch("patients", "nope", &json!({})).await.unwrap_err();
        assert!(matches!(err, RemoteError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_query_filters() {
        let remote = InMemoryRemoteStore::new();
        remote.seed("patients", "p1", json!({"tenantId": "t1"}));
        remote.seed("patients", "p2", json!({"tenantId": "t2"}));

        let docs = remote
            .query("patients", &QueryFilter::new().eq("tenantId", "t1"))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "p1");
        assert!(remote.query("orders", &QueryFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_injection_still_logs_calls() {
        let remote = InMemoryRemoteStore::new();
        remote.set_failing(true);

        let err = remote.insert("patients", &json!({})).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable(_)));
        assert!(remote.is_empty("patients"));
        assert_eq!(remote.calls().len(), 1);

        remote.set_failing(false);
        remote.insert("patients", &json!({})).await.unwrap();
        assert_eq!(remote.len("patients"), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let remote = InMemoryRemoteStore::new();
        remote.seed("orders", "o1", json!({}));
        remote.remove("orders", "o1").await.unwrap();
        remote.remove("orders", "o1").await.unwrap();
        assert!(remote.is_empty("orders"));
    }
}
