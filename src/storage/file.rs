//! Per-key file tier (mobile file/secure storage analogue).
//!
//! Each key becomes one JSON envelope file whose name is the hex-encoded
//! key, so arbitrary key characters never touch the filesystem. Writes go
//! to a temp file first and are renamed into place.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::traits::{StorageError, StorageTier, StoredEntry};

const TIER: &str = "file";
const EXTENSION: &str = "json";

pub struct FileTier {
    dir: PathBuf,
}

impl FileTier {
    /// Create the tier, creating `dir` if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::tier(TIER, format!("cannot create {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", hex::encode(key), EXTENSION))
    }

    fn key_from_path(path: &Path) -> Option<String> {
        if path.extension()?.to_str()? != EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[async_trait]
impl StorageTier for FileTier {
    fn name(&self) -> &str {
        TIER
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::tier(TIER, e)),
        }
    }

    async fn put(&self, key: &str, entry: &StoredEntry) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec(entry)?;

        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StorageError::tier(TIER, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::tier(TIER, e))?;

        debug!(key, bytes = bytes.len(), "File tier put");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::tier(TIER, e)),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut dir = fs::read_dir(&self.dir)
            .await
            .map_err(|e| StorageError::tier(TIER, e))?;

        while let Some(dirent) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::tier(TIER, e))?
        {
            if let Some(key) = Self::key_from_path(&dirent.path()) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        fs::try_exists(self.path_for(key))
            .await
            .map_err(|e| StorageError::tier(TIER, e))
    }
}
