// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite storage tier (primary persistent tier on capable devices).
//!
//! One row per namespaced key:
//! ```sql
//! CREATE TABLE kv_entries (
//!   key TEXT PRIMARY KEY,
//!   data BLOB NOT NULL,        -- encoded envelope payload
//!   stored_at INTEGER NOT NULL,
//!   expires_at INTEGER,        -- NULL = no TTL
//!   tags TEXT NOT NULL,        -- JSON array
//!   compressed INTEGER NOT NULL,
//!   encrypted INTEGER NOT NULL,
//!   deleted INTEGER NOT NULL   -- tombstone marker
//! )
//! ```
//!
//! Goes through sqlx's `Any` driver like the rest of our SQL code, so
//! booleans are stored as INTEGER and tags as JSON text.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::path::Path;
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{StorageError, StorageTier, StoredEntry};
use crate::resilience::retry::{retry, RetryConfig};

const TIER: &str = "sqlite";

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqliteTier {
    pool: AnyPool,
    path: String,
}

impl SqliteTier {
    /// Open (or create) the SQLite file with startup-mode retry.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        install_drivers();

        let path_str = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path_str);

        let pool = retry("sqlite_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&url)
                .await
                .map_err(|e| StorageError::tier(TIER, e))
        })
        .await?;

        let tier = Self { pool, path: path_str };
        tier.enable_wal_mode().await?;
        tier.init_schema().await?;

        info!(path = %tier.path, "SQLite storage tier ready");
        Ok(tier)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// WAL journal: readers don't block the single writer.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::tier(TIER, format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::tier(TIER, format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                stored_at INTEGER NOT NULL,
                expires_at INTEGER,
                tags TEXT NOT NULL DEFAULT '[]',
                compressed INTEGER NOT NULL DEFAULT 0,
                encrypted INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0
            )
        "#;

        retry("sqlite_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::tier(TIER, e))
        })
        .await?;

        Ok(())
    }
}

#[async_trait]
impl StorageTier for SqliteTier {
    fn name(&self) -> &str {
        TIER
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
        let row = sqlx::query(
            "SELECT data, stored_at, expires_at, tags, compressed, encrypted, deleted FROM kv_entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::tier(TIER, e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let data: Vec<u8> = row.try_get("data").map_err(|e| StorageError::tier(TIER, e))?;
        let stored_at: i64 = row.try_get("stored_at").unwrap_or(0);
        let expires_at: Option<i64> = row.try_get("expires_at").unwrap_or(None);

        // TEXT may come back as bytes through the Any driver
        let tags_json: String = row
            .try_get::<String, _>("tags")
            .ok()
            .or_else(|| {
                row.try_get::<Vec<u8>, _>("tags")
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
            .unwrap_or_else(|| "[]".to_string());
        let tags: Vec<String> = serde_json::from_str(&tags_json)?;

        let compressed: i64 = row.try_get("compressed").unwrap_or(0);
        let encrypted: i64 = row.try_get("encrypted").unwrap_or(0);
        let deleted: i64 = row.try_get("deleted").unwrap_or(0);

        Ok(Some(StoredEntry {
            data,
            stored_at,
            expires_at,
            tags,
            compressed: compressed != 0,
            encrypted: encrypted != 0,
            deleted: deleted != 0,
        }))
    }

    async fn put(&self, key: &str, entry: &StoredEntry) -> Result<(), StorageError> {
        let tags_json = serde_json::to_string(&entry.tags)?;

        sqlx::query(
            "INSERT INTO kv_entries (key, data, stored_at, expires_at, tags, compressed, encrypted, deleted)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                data = excluded.data,
                stored_at = excluded.stored_at,
                expires_at = excluded.expires_at,
                tags = excluded.tags,
                compressed = excluded.compressed,
                encrypted = excluded.encrypted,
                deleted = excluded.deleted",
        )
        .bind(key)
        .bind(entry.data.clone())
        .bind(entry.stored_at)
        .bind(entry.expires_at)
        .bind(tags_json)
        .bind(i64::from(entry.compressed))
        .bind(i64::from(entry.encrypted))
        .bind(i64::from(entry.deleted))
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::tier(TIER, e))?;

        debug!(key, bytes = entry.data.len(), "SQLite put");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::tier(TIER, e))?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // substr instead of LIKE: namespaces contain '_' which LIKE treats as a wildcard
        let rows = sqlx::query("SELECT key FROM kv_entries WHERE substr(key, 1, length(?)) = ?")
            .bind(prefix)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::tier(TIER, e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("key")
                    .or_else(|_| {
                        row.try_get::<Vec<u8>, _>("key")
                            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
                    })
                    .map_err(|e| StorageError::tier(TIER, e))
            })
            .collect()
    }
}
