use async_trait::async_trait;
use dashmap::DashMap;
use super::traits::{StorageError, StorageTier, StoredEntry};

/// Volatile last-resort tier. Lost on restart.
pub struct MemoryTier {
    data: DashMap<String, StoredEntry>,
}

impl MemoryTier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageTier for MemoryTier {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, key: &str, entry: &StoredEntry) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .data
            .iter()
            .filter(|r| r.key().starts_with(prefix))
            .map(|r| r.key().clone())
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.contains_key(key))
    }
}
