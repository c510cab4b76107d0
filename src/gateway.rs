//! Typed CRUD that works the same online and offline.
//!
//! Each call tries the remote store when the device is believed online and
//! falls back to the local cache and the operation queue otherwise, or when
//! the remote call fails. Falling back is never reported as an error; only
//! an invalid payload or exhausted device storage is.
//!
//! The entity id travels beside the payload, never inside it: the configured
//! id field is stripped from outgoing payloads and filled in from the
//! record id when decoding. Ids returned by an offline create stay valid
//! after sync assigns the remote id.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheRecord, LocalCache};
use crate::config::OfflineConfig;
use crate::network::NetworkMonitor;
use crate::queue::{Operation, OperationQueue};
use crate::remote::{Document, QueryFilter, RemoteStore};
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A record with its id and sync state.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<T> {
    pub id: String,
    pub data: T,
    /// Local write not yet confirmed by the remote store
    pub is_offline: bool,
}

/// Where a write ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Confirmed by the remote store
    Applied,
    /// Queued for the next sync pass
    Queued,
}

pub struct OfflineAwareGateway<T> {
    collection: String,
    tenant_id: String,
    tenant_field: Option<String>,
    id_field: String,
    remote: Arc<dyn RemoteStore>,
    network: Arc<NetworkMonitor>,
    queue: Arc<OperationQueue>,
    cache: Arc<LocalCache>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> OfflineAwareGateway<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(
        collection: &str,
        config: &OfflineConfig,
        remote: Arc<dyn RemoteStore>,
        network: Arc<NetworkMonitor>,
        queue: Arc<OperationQueue>,
        cache: Arc<LocalCache>,
    ) -> Self {
        Self {
            collection: collection.to_string(),
            tenant_id: config.tenant_id.clone(),
            tenant_field: config.tenant_field.clone(),
            id_field: config.id_field.clone(),
            remote,
            network,
            queue,
            cache,
            _marker: PhantomData,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Serialize `data`, require a JSON object.
    fn to_object<S: Serialize + ?Sized>(data: &S) -> Result<Value, GatewayError> {
        let value = serde_json::to_value(data)?;
        if !value.is_object() {
            return Err(GatewayError::InvalidPayload(format!(
                "expected a JSON object, got {}",
                type_name(&value)
            )));
        }
        Ok(value)
    }

    /// Serialized payload bound for the remote, without the id field.
    fn outgoing<S: Serialize + ?Sized>(&self, data: &S) -> Result<Value, GatewayError> {
        let mut payload = Self::to_object(data)?;
        if let Some(object) = payload.as_object_mut() {
            object.remove(&self.id_field);
        }
        Ok(payload)
    }

    fn with_id(&self, mut payload: Value, id: &str) -> Value {
        if let Some(object) = payload.as_object_mut() {
            object.insert(self.id_field.clone(), Value::String(id.to_string()));
        }
        payload
    }

    /// Stamp the tenant field on new records so tenant-filtered refills find them.
    fn with_tenant(&self, mut payload: Value) -> Value {
        if let (Some(field), Some(object)) = (self.tenant_field.as_ref(), payload.as_object_mut()) {
            object
                .entry(field.clone())
                .or_insert_with(|| Value::String(self.tenant_id.clone()));
        }
        payload
    }

    fn tenant_filter(&self, filter: QueryFilter) -> QueryFilter {
        match self.tenant_field {
            Some(ref field) => filter.eq(field.as_str(), self.tenant_id.as_str()),
            None => filter,
        }
    }

    fn decode(&self, record: CacheRecord) -> Option<Record<T>> {
        match serde_json::from_value(self.with_id(record.payload, &record.entity_id)) {
            Ok(data) => Some(Record {
                id: record.entity_id,
                data,
                is_offline: record.is_offline,
            }),
            Err(e) => {
                warn!(collection = %self.collection, id = %record.entity_id, error = %e, "Skipping undecodable cached record");
                None
            }
        }
    }

    pub async fn create(&self, data: &T) -> Result<Record<T>, GatewayError> {
        let payload = self.with_tenant(self.outgoing(data)?);

        if self.network.is_connected() {
            match self.remote.insert(&self.collection, &payload).await {
                Ok(id) => {
                    self.cache
                        .upsert(CacheRecord::new(&self.collection, &self.tenant_id, &id, payload.clone()))
                        .await?;
                    crate::metrics::record_gateway_call(&self.collection, "create", "online");
                    return Ok(Record {
                        data: serde_json::from_value(self.with_id(payload, &id))?,
                        id,
                        is_offline: false,
                    });
                }
                Err(e) => {
                    warn!(collection = %self.collection, error = %e, "Remote create failed, queueing");
                }
            }
        }

        let id = format!("local-{}", Uuid::new_v4());
        {
            let _gate = self.queue.write_gate().await;
            self.queue
                .enqueue(&self.collection, &id, Operation::Create, payload.clone())
                .await?;
            self.cache
                .upsert(CacheRecord::new(&self.collection, &self.tenant_id, &id, payload.clone()).offline())
                .await?;
        }
        crate::metrics::record_gateway_call(&self.collection, "create", "offline");
        debug!(collection = %self.collection, id = %id, "Created offline");

        Ok(Record {
            data: serde_json::from_value(self.with_id(payload, &id))?,
            id,
            is_offline: true,
        })
    }

    /// Records matching `predicate`. Online, the partition is refreshed from
    /// the remote first; local writes awaiting sync are always included.
    pub async fn read<P>(&self, predicate: P) -> Result<Vec<Record<T>>, GatewayError>
    where
        P: Fn(&T) -> bool,
    {
        if self.network.is_connected() {
            match self.remote.query(&self.collection, &self.tenant_filter(QueryFilter::new())).await {
                Ok(documents) => {
                    self.cache.cache(&self.collection, &self.tenant_id, documents).await?;
                    crate::metrics::record_gateway_call(&self.collection, "read", "online");
                }
                Err(e) => {
                    warn!(collection = %self.collection, error = %e, "Remote read failed, serving cache");
                    crate::metrics::record_gateway_call(&self.collection, "read", "offline");
                }
            }
        } else {
            crate::metrics::record_gateway_call(&self.collection, "read", "offline");
        }

        Ok(self
            .cache
            .read(&self.collection, &self.tenant_id)
            .await?
            .into_iter()
            .filter_map(|record| self.decode(record))
            .filter(|record| predicate(&record.data))
            .collect())
    }

    /// Records whose fields equal `filter`'s. Online results are merged into
    /// the cache without replacing the rest of the partition.
    pub async fn search(&self, filter: &QueryFilter) -> Result<Vec<Record<T>>, GatewayError> {
        if self.network.is_connected() {
            match self.remote.query(&self.collection, &self.tenant_filter(filter.clone())).await {
                Ok(documents) => {
                    self.merge_into_cache(documents).await?;
                    crate::metrics::record_gateway_call(&self.collection, "search", "online");
                }
                Err(e) => {
                    warn!(collection = %self.collection, error = %e, "Remote search failed, serving cache");
                    crate::metrics::record_gateway_call(&self.collection, "search", "offline");
                }
            }
        } else {
            crate::metrics::record_gateway_call(&self.collection, "search", "offline");
        }

        Ok(self
            .cache
            .read_filtered(&self.collection, &self.tenant_id, |record| filter.matches(&record.payload))
            .await?
            .into_iter()
            .filter_map(|record| self.decode(record))
            .collect())
    }

    async fn merge_into_cache(&self, documents: Vec<Document>) -> Result<(), StorageError> {
        for doc in documents {
            let pending = self
                .cache
                .read_one(&self.collection, &doc.id)
                .await?
                .is_some_and(|cached| cached.is_offline);
            if !pending {
                self.cache
                    .upsert(CacheRecord::new(&self.collection, &self.tenant_id, &doc.id, doc.data))
                    .await?;
            }
        }
        Ok(())
    }

    /// Cached lookup by id. Local ids of synced creates still resolve.
    pub async fn get(&self, id: &str) -> Result<Option<Record<T>>, GatewayError> {
        let id = self.cache.resolve_id(&self.collection, id).await?;
        Ok(self
            .cache
            .read_one(&self.collection, &id)
            .await?
            .and_then(|record| self.decode(record)))
    }

    /// Apply changed fields. The cache is patched immediately either way.
    pub async fn update<C>(&self, id: &str, changes: &C) -> Result<WriteOutcome, GatewayError>
    where
        C: Serialize + ?Sized,
    {
        let changes = self.outgoing(changes)?;
        let id = {
            let _gate = self.queue.write_gate().await;
            let id = self.cache.resolve_id(&self.collection, id).await?;
            self.cache.patch_one(&self.collection, &id, &changes).await?;
            id
        };

        if self.can_write_through(&id).await {
            match self.remote.patch(&self.collection, &id, &changes).await {
                Ok(()) => {
                    crate::metrics::record_gateway_call(&self.collection, "update", "online");
                    return Ok(WriteOutcome::Applied);
                }
                Err(e) => {
                    warn!(collection = %self.collection, id = %id, error = %e, "Remote update failed, queueing");
                }
            }
        }

        self.enqueue_offline(&id, Operation::Update, changes).await?;
        crate::metrics::record_gateway_call(&self.collection, "update", "offline");
        Ok(WriteOutcome::Queued)
    }

    /// Tombstone locally and remove remotely (now or on the next pass).
    pub async fn delete(&self, id: &str) -> Result<WriteOutcome, GatewayError> {
        let id = {
            let _gate = self.queue.write_gate().await;
            let id = self.cache.resolve_id(&self.collection, id).await?;
            self.cache.mark_deleted(&self.collection, &id).await?;
            id
        };

        if self.can_write_through(&id).await {
            match self.remote.remove(&self.collection, &id).await {
                Ok(()) => {
                    crate::metrics::record_gateway_call(&self.collection, "delete", "online");
                    return Ok(WriteOutcome::Applied);
                }
                Err(e) => {
                    warn!(collection = %self.collection, id = %id, error = %e, "Remote delete failed, queueing");
                }
            }
        }

        self.enqueue_offline(&id, Operation::Delete, Value::Null).await?;
        crate::metrics::record_gateway_call(&self.collection, "delete", "offline");
        Ok(WriteOutcome::Queued)
    }

    /// Queue a change and flag the cached record, as one step with respect
    /// to the sync engine clearing that flag.
    async fn enqueue_offline(&self, id: &str, operation: Operation, payload: Value) -> Result<(), StorageError> {
        let _gate = self.queue.write_gate().await;
        // The create behind a local id may have been confirmed since the lookup
        let id = self.cache.resolve_id(&self.collection, id).await?;
        self.queue.enqueue(&self.collection, &id, operation, payload).await?;
        self.cache.set_offline(&self.collection, &id, true).await?;
        Ok(())
    }

    /// Online, and nothing queued for this entity that must reach the
    /// remote first.
    async fn can_write_through(&self, id: &str) -> bool {
        self.network.is_connected() && !self.queue.has_pending_for(&self.collection, id).await
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
