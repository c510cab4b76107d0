//! The remote store collaborator.
//!
//! Transport, auth and server-side validation belong to the implementor;
//! this crate only needs the four calls below. Remote failures are never
//! retried inside a call: the sync engine records them on the queue entry.

mod memory;

pub use memory::{InMemoryRemoteStore, RemoteCall};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),
    #[error("Document {collection}/{id} not found")]
    NotFound { collection: String, id: String },
    #[error("Rejected by remote store: {0}")]
    Rejected(String),
}

/// A record as the remote store returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

/// Top-level field equality filter. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    equals: BTreeMap<String, Value>,
}

impl QueryFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.equals.iter()
    }

    pub fn matches(&self, data: &Value) -> bool {
        self.equals
            .iter()
            .all(|(field, expected)| data.get(field) == Some(expected))
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a document. Returns the id the remote assigned.
    async fn insert(&self, collection: &str, data: &Value) -> Result<String, RemoteError>;

    /// Shallow-merge `fields` into an existing document.
    async fn patch(&self, collection: &str, id: &str, fields: &Value) -> Result<(), RemoteError>;

    async fn remove(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

    async fn query(&self, collection: &str, filter: &QueryFilter) -> Result<Vec<Document>, RemoteError>;
}

/// Shallow merge of two JSON objects: keys in `changes` overwrite `target`.
/// Anything but an object on either side is a no-op.
pub(crate) fn merge_fields(target: &mut Value, changes: &Value) {
    if let (Some(target), Some(changes)) = (target.as_object_mut(), changes.as_object()) {
        for (key, value) in changes {
            target.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_all_fields() {
        let filter = QueryFilter::new().eq("tenantId", "t1").eq("status", "active");

        assert!(filter.matches(&json!({"tenantId": "t1", "status": "active", "name": "A"})));
        assert!(!filter.matches(&json!({"tenantId": "t1", "status": "closed"})));
        assert!(!filter.matches(&json!({"status": "active"})));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = QueryFilter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&json!({"anything": 1})));
    }

    #[test]
    fn test_merge_fields_overwrites_and_adds() {
        let mut target = json!({"name": "A", "age": 30});
        merge_fields(&mut target, &json!({"age": 31, "ward": 3}));
        assert_eq!(target, json!({"name": "A", "age": 31, "ward": 3}));
    }

    #[test]
    fn test_merge_fields_ignores_non_objects() {
        let mut target = json!({"name": "A"});
        merge_fields(&mut target, &json!(null));
        assert_eq!(target, json!({"name": "A"}));
    }
}
