//! The storage backend callers see: one key/value API over an ordered
//! chain of tiers.
//!
//! - **Writes** go to the first tier that accepts them (primary, then
//!   fallbacks). Only when every tier fails does `set` return an error.
//! - **Reads** consult every tier and return the newest live envelope, so a
//!   value that landed in a fallback tier is never shadowed by an older
//!   copy in the primary.
//! - **Removes** delete from every tier. If some tier misses the delete,
//!   the others get a tombstone so the stale copy can't come back once that
//!   tier recovers.
//! - **Stamps** (`stored_at`) strictly increase per backend, so the newest
//!   copy is well defined even for writes in the same millisecond.
//! - **Keys** are namespaced `<project>_<tenant>_<key>`; callers only ever
//!   see the unprefixed key.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::traits::{SetOptions, StorageError, StorageTier, StoredEntry};
use crate::compression;
use crate::crypto::Cipher;

pub struct TieredStorage {
    tiers: Vec<Arc<dyn StorageTier>>,
    namespace: String,
    cipher: Option<Cipher>,
    last_stamp: AtomicI64,
}

impl TieredStorage {
    /// Build from an ordered tier list (primary first).
    pub fn new(namespace: impl Into<String>, tiers: Vec<Arc<dyn StorageTier>>) -> Result<Self, StorageError> {
        if tiers.is_empty() {
            return Err(StorageError::NoTiers);
        }
        Ok(Self {
            tiers,
            namespace: namespace.into(),
            cipher: None,
            last_stamp: AtomicI64::new(0),
        })
    }

    /// Single volatile tier. Handy for tests and for devices without storage.
    #[must_use]
    pub fn memory_only(namespace: impl Into<String>) -> Self {
        Self {
            tiers: vec![Arc::new(super::memory::MemoryTier::new())],
            namespace: namespace.into(),
            cipher: None,
            last_stamp: AtomicI64::new(0),
        }
    }

    #[must_use]
    pub fn with_cipher(mut self, cipher: Cipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    /// Options for records holding user data: encrypted whenever a key is configured.
    #[must_use]
    pub fn sensitive_options(&self) -> SetOptions {
        let opts = SetOptions::new().compressed();
        if self.has_cipher() {
            opts.encrypted()
        } else {
            opts
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// Whether anything written here can survive a restart.
    pub fn is_persistent(&self) -> bool {
        self.tiers.iter().any(|t| t.is_persistent())
    }

    /// Wall clock, bumped past the previous stamp when it hasn't moved.
    fn next_stamp(&self) -> i64 {
        let now = crate::now_millis();
        let prev = match self
            .last_stamp
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(now.max(last + 1)))
        {
            Ok(prev) | Err(prev) => prev,
        };
        now.max(prev + 1)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn encode(&self, value: &Value, opts: &SetOptions) -> Result<StoredEntry, StorageError> {
        let mut data = serde_json::to_vec(value)?;

        let mut compressed = false;
        if opts.compress {
            let (packed, did_compress) =
                compression::compress_bytes(&data).map_err(|e| StorageError::Compression(e.to_string()))?;
            data = packed;
            compressed = did_compress;
        }

        if opts.encrypt {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or_else(|| StorageError::Encryption("encryption requested but no key configured".into()))?;
            data = cipher.encrypt(&data)?;
        }

        let stored_at = self.next_stamp();
        Ok(StoredEntry {
            data,
            stored_at,
            expires_at: opts
                .ttl
                .map(|ttl| stored_at.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))),
            tags: opts.tags.clone(),
            compressed,
            encrypted: opts.encrypt,
            deleted: false,
        })
    }

    fn decode(&self, entry: &StoredEntry) -> Result<Value, StorageError> {
        let mut data = entry.data.clone();

        if entry.encrypted {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or_else(|| StorageError::Encryption("entry is encrypted but no key configured".into()))?;
            data = cipher.decrypt(&data)?;
        }
        if entry.compressed {
            data = compression::decompress_bytes(&data).map_err(|e| StorageError::Compression(e.to_string()))?;
        }

        Ok(serde_json::from_slice(&data)?)
    }

    /// Store a JSON value, cascading through tiers until one accepts it.
    #[tracing::instrument(skip(self, value, opts), fields(tier))]
    pub async fn set(&self, key: &str, value: &Value, opts: &SetOptions) -> Result<(), StorageError> {
        let entry = self.encode(value, opts)?;
        let full_key = self.full_key(key);
        let mut failures = Vec::new();

        for (idx, tier) in self.tiers.iter().enumerate() {
            match tier.put(&full_key, &entry).await {
                Ok(()) => {
                    tracing::Span::current().record("tier", tier.name());
                    if idx > 0 {
                        warn!(key, tier = tier.name(), skipped = idx, "Stored in fallback tier");
                        crate::metrics::record_tier_fallback(tier.name());
                    }
                    crate::metrics::record_operation(tier.name(), "set", "success");
                    crate::metrics::record_bytes_written(tier.name(), entry.data.len());
                    return Ok(());
                }
                Err(e) => {
                    warn!(key, tier = tier.name(), error = %e, "Tier write failed, trying next");
                    crate::metrics::record_operation(tier.name(), "set", "error");
                    failures.push(e);
                }
            }
        }

        crate::metrics::record_error("storage", "set", "all_tiers_failed");
        Err(StorageError::AllTiersFailed(failures))
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        opts: &SetOptions,
    ) -> Result<(), StorageError> {
        let value = serde_json::to_value(value)?;
        self.set(key, &value, opts).await
    }

    /// Newest envelope across tiers, tombstones included. Expired copies
    /// are dropped lazily.
    async fn newest_entry(&self, full_key: &str) -> Result<Option<StoredEntry>, StorageError> {
        let now = crate::now_millis();
        let mut newest: Option<StoredEntry> = None;
        let mut failures = Vec::new();

        for tier in &self.tiers {
            match tier.get(full_key).await {
                Ok(Some(entry)) if entry.is_expired(now) => {
                    debug!(key = full_key, tier = tier.name(), "Dropping expired entry");
                    if let Err(e) = tier.delete(full_key).await {
                        debug!(error = %e, "Failed to drop expired entry");
                    }
                }
                Ok(Some(entry)) => {
                    if newest.as_ref().map_or(true, |n| entry.stored_at > n.stored_at) {
                        newest = Some(entry);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = full_key, tier = tier.name(), error = %e, "Tier read failed");
                    crate::metrics::record_operation(tier.name(), "get", "error");
                    failures.push(e);
                }
            }
        }

        if failures.len() == self.tiers.len() {
            return Err(StorageError::AllTiersFailed(failures));
        }
        Ok(newest)
    }

    /// Newest envelope unless it is a tombstone.
    async fn newest_live(&self, full_key: &str) -> Result<Option<StoredEntry>, StorageError> {
        Ok(self.newest_entry(full_key).await?.filter(|entry| !entry.deleted))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match self.newest_live(&self.full_key(key)).await? {
            Some(entry) => Ok(Some(self.decode(&entry)?)),
            None => Ok(None),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.newest_live(&self.full_key(key)).await?.is_some())
    }

    /// Remove from every tier.
    ///
    /// Tiers that miss the delete are shadowed by a tombstone in the tiers
    /// that took it. Fails when no tier could delete or shadow the key.
    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.remove_full_key(&self.full_key(key)).await
    }

    async fn remove_full_key(&self, full_key: &str) -> Result<(), StorageError> {
        let mut failures = Vec::new();
        let mut cleared = Vec::new();
        for tier in &self.tiers {
            match tier.delete(full_key).await {
                Ok(()) => cleared.push(tier),
                Err(e) => {
                    warn!(key = full_key, tier = tier.name(), error = %e, "Tier delete failed");
                    crate::metrics::record_operation(tier.name(), "delete", "error");
                    failures.push(e);
                }
            }
        }
        if failures.is_empty() {
            return Ok(());
        }

        let tombstone = StoredEntry::tombstone(self.next_stamp());
        let mut shadowed = false;
        for tier in cleared {
            match tier.put(full_key, &tombstone).await {
                Ok(()) => shadowed = true,
                Err(e) => warn!(key = full_key, tier = tier.name(), error = %e, "Tombstone write failed"),
            }
        }
        if !shadowed {
            crate::metrics::record_error("storage", "remove", "all_tiers_failed");
            return Err(StorageError::AllTiersFailed(failures));
        }
        debug!(key = full_key, missed = failures.len(), "Removal shadowed by tombstone");
        Ok(())
    }

    /// Namespaced full keys present in any tier (expired included).
    async fn raw_keys(&self, prefix: &str) -> Result<BTreeSet<String>, StorageError> {
        let full_prefix = self.full_key(prefix);
        let mut keys = BTreeSet::new();
        let mut failures = Vec::new();

        for tier in &self.tiers {
            match tier.keys_with_prefix(&full_prefix).await {
                Ok(found) => keys.extend(found),
                Err(e) => {
                    warn!(tier = tier.name(), error = %e, "Tier key scan failed");
                    failures.push(e);
                }
            }
        }
        if failures.len() == self.tiers.len() {
            return Err(StorageError::AllTiersFailed(failures));
        }
        Ok(keys)
    }

    /// Live keys of this namespace starting with `prefix` (unprefixed, sorted).
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut live = Vec::new();
        for full_key in self.raw_keys(prefix).await? {
            if self.newest_live(&full_key).await?.is_some() {
                live.push(full_key[self.namespace.len()..].to_string());
            }
        }
        Ok(live)
    }

    /// All live keys of this namespace (unprefixed, sorted).
    pub async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.keys_with_prefix("").await
    }

    /// Remove every entry carrying `tag`. Returns how many were removed.
    pub async fn remove_by_tag(&self, tag: &str) -> Result<usize, StorageError> {
        let mut removed = 0;
        for full_key in self.raw_keys("").await? {
            if let Some(entry) = self.newest_live(&full_key).await? {
                if entry.has_tag(tag) {
                    self.remove_full_key(&full_key).await?;
                    removed += 1;
                }
            }
        }
        debug!(tag, removed, "Removed entries by tag");
        Ok(removed)
    }

    /// Sweep expired copies out of every tier, and drop tombstones once no
    /// tier holds a live copy they shadow. Returns how many copies went.
    pub async fn purge_expired(&self) -> Result<usize, StorageError> {
        let now = crate::now_millis();
        let mut purged = 0;
        for full_key in self.raw_keys("").await? {
            let mut copies = Vec::with_capacity(self.tiers.len());
            let mut all_readable = true;
            for tier in &self.tiers {
                match tier.get(&full_key).await {
                    Ok(Some(entry)) if entry.is_expired(now) => {
                        if tier.delete(&full_key).await.is_ok() {
                            purged += 1;
                        }
                    }
                    Ok(Some(entry)) => copies.push((tier, entry.deleted)),
                    Ok(None) => {}
                    Err(_) => all_readable = false,
                }
            }

            // A tombstone may only go once nothing it shadows is left
            if all_readable && !copies.is_empty() && copies.iter().all(|(_, deleted)| *deleted) {
                for (tier, _) in copies {
                    if tier.delete(&full_key).await.is_ok() {
                        purged += 1;
                    }
                }
            }
        }
        Ok(purged)
    }

    /// Remove every key with the given prefix in this namespace. Returns
    /// how many live keys were removed.
    pub async fn clear_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let mut removed = 0;
        for full_key in self.raw_keys(prefix).await? {
            if self.newest_live(&full_key).await?.is_some() {
                removed += 1;
            }
            self.remove_full_key(&full_key).await?;
        }
        Ok(removed)
    }
}
