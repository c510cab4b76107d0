use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{tier} tier failed: {message}")]
    Tier { tier: String, message: String },
    #[error("all storage tiers failed: {}", describe_failures(.0))]
    AllTiersFailed(Vec<StorageError>),
    #[error("no storage tiers configured")]
    NoTiers,
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn tier(tier: &str, message: impl std::fmt::Display) -> Self {
        Self::Tier {
            tier: tier.to_string(),
            message: message.to_string(),
        }
    }
}

fn describe_failures(errors: &[StorageError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Options for a single `set` call.
///
/// ```
/// use offline_sync::SetOptions;
/// use std::time::Duration;
///
/// let opts = SetOptions::new()
///     .with_ttl(Duration::from_secs(60))
///     .compressed()
///     .tag("patients");
/// assert!(opts.compress);
/// assert_eq!(opts.tags, vec!["patients".to_string()]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub encrypt: bool,
    pub compress: bool,
    pub tags: Vec<String>,
}

impl SetOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }

    #[must_use]
    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// The envelope every tier persists.
///
/// `data` holds the (possibly compressed, then encrypted) JSON bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    /// Write time (epoch millis), newest copy wins across tiers
    pub stored_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub encrypted: bool,
    /// Removal marker. Shadows older copies left in tiers that missed the delete.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl StoredEntry {
    /// Tombstone written by a remove, stamped at `stored_at`.
    #[must_use]
    pub fn tombstone(stored_at: i64) -> Self {
        Self {
            data: Vec::new(),
            stored_at,
            expires_at: None,
            tags: Vec::new(),
            compressed: false,
            encrypted: false,
            deleted: true,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_millis)
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// One storage medium in the fallback chain.
///
/// Tiers see fully-qualified (namespaced) keys; namespacing, TTL and
/// encoding are handled by [`super::TieredStorage`].
#[async_trait]
pub trait StorageTier: Send + Sync {
    /// Short label used in logs and metrics (e.g. `sqlite`, `file`, `memory`).
    fn name(&self) -> &str;

    /// Whether the tier survives a process restart.
    fn is_persistent(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StorageError>;
    async fn put(&self, key: &str, entry: &StoredEntry) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, prefix included.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}
