//! Platform capability detection and tier selection.
//!
//! Which tiers a device gets is decided exactly once, at startup:
//! [`PlatformCapabilities::detect`] probes the device, [`StoragePlan`]
//! turns the result into an ordered tier list, and [`StoragePlan::build`]
//! opens the tiers. Nothing else in the crate branches on platform.

use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use super::file::FileTier;
use super::memory::MemoryTier;
use super::sql::SqliteTier;
use super::tiered::TieredStorage;
use super::traits::{StorageError, StorageTier};
use crate::config::OfflineConfig;
use crate::crypto::Cipher;

/// What the current device can persist to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlatformCapabilities {
    /// The configured data directory exists (or was created) and accepts writes
    pub writable_data_dir: bool,
    /// Embedded database storage is usable
    pub sqlite: bool,
    /// Plain per-key file storage is usable
    pub file_storage: bool,
}

impl PlatformCapabilities {
    /// Probe the device according to `config`.
    pub async fn detect(config: &OfflineConfig) -> Self {
        let Some(ref dir) = config.data_dir else {
            info!("No data directory configured - volatile storage only");
            return Self::default();
        };

        let writable = match fs::create_dir_all(dir).await {
            Ok(()) => {
                let probe = dir.join(".offline_probe");
                let ok = fs::write(&probe, b"ok").await.is_ok();
                let _ = fs::remove_file(&probe).await;
                ok
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Data directory not usable");
                false
            }
        };

        Self {
            writable_data_dir: writable,
            sqlite: writable && config.enable_sqlite,
            file_storage: writable && config.enable_file_storage,
        }
    }
}

/// A tier implementation the plan can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
    Sqlite,
    File,
    Memory,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::File => write!(f, "file"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Ordered tier selection. Memory is always last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePlan {
    pub tiers: Vec<TierKind>,
}

impl StoragePlan {
    #[must_use]
    pub fn from_capabilities(caps: PlatformCapabilities) -> Self {
        let mut tiers = Vec::with_capacity(3);
        if caps.sqlite {
            tiers.push(TierKind::Sqlite);
        }
        if caps.file_storage {
            tiers.push(TierKind::File);
        }
        tiers.push(TierKind::Memory);
        Self { tiers }
    }

    /// Open every planned tier. A tier that fails to open is skipped with a
    /// warning; the memory tier cannot fail, so this always yields storage.
    pub async fn build(&self, config: &OfflineConfig) -> Result<TieredStorage, StorageError> {
        let mut opened: Vec<Arc<dyn StorageTier>> = Vec::with_capacity(self.tiers.len());

        for kind in &self.tiers {
            let tier: Result<Arc<dyn StorageTier>, StorageError> = match kind {
                TierKind::Sqlite => match config.sqlite_path() {
                    Some(path) => SqliteTier::open(path).await.map(|t| Arc::new(t) as Arc<dyn StorageTier>),
                    None => continue,
                },
                TierKind::File => match config.file_store_dir() {
                    Some(dir) => FileTier::open(dir).await.map(|t| Arc::new(t) as Arc<dyn StorageTier>),
                    None => continue,
                },
                TierKind::Memory => Ok(Arc::new(MemoryTier::new())),
            };

            match tier {
                Ok(tier) => opened.push(tier),
                Err(e) => {
                    warn!(tier = %kind, error = %e, "Storage tier unavailable, skipping");
                    crate::metrics::record_error(&kind.to_string(), "open", "unavailable");
                }
            }
        }

        let mut storage = TieredStorage::new(config.namespace(), opened)?;
        if let Some(ref passphrase) = config.encryption_key {
            storage = storage.with_cipher(Cipher::from_passphrase(passphrase));
        }

        if config.data_dir.is_some() && !storage.is_persistent() {
            warn!("No persistent storage tier opened, queued writes will not survive a restart");
        }
        info!(
            tiers = ?storage.tier_names(),
            persistent = storage.is_persistent(),
            namespace = %storage.namespace(),
            "Storage backend ready"
        );
        Ok(storage)
    }
}

impl TieredStorage {
    /// Detect capabilities, plan and open tiers for `config`.
    pub async fn for_platform(config: &OfflineConfig) -> Result<Self, StorageError> {
        let caps = PlatformCapabilities::detect(config).await;
        StoragePlan::from_capabilities(caps).build(config).await
    }
}
