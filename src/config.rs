//! Configuration for the offline data layer.
//!
//! # Example
//!
//! ```
//! use offline_sync::OfflineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = OfflineConfig::default();
//! assert_eq!(config.sync_interval_secs, 300);
//!
//! // Lab deployment for one tenant
//! let config = OfflineConfig {
//!     project: "labops".into(),
//!     tenant_id: "clinic-42".into(),
//!     data_dir: Some("/var/lib/labops".into()),
//!     watched_collections: vec!["patients".into(), "orders".into()],
//!     ..Default::default()
//! };
//! assert_eq!(config.namespace(), "labops_clinic-42_");
//! ```

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the offline data layer.
///
/// All fields have defaults. A real deployment sets at least `project`,
/// `tenant_id` and `data_dir`; without a data directory only the volatile
/// in-memory tier is available.
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineConfig {
    /// Project name, first half of the storage key namespace
    #[serde(default = "default_project")]
    pub project: String,

    /// Active tenant on this device, second half of the namespace
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,

    /// Directory for persistent tiers (SQLite file, per-key files)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Use the SQLite tier when a data directory is available
    #[serde(default = "default_true")]
    pub enable_sqlite: bool,

    /// Use the per-key file tier when a data directory is available
    #[serde(default = "default_true")]
    pub enable_file_storage: bool,

    /// SQLite file name inside `data_dir`
    #[serde(default = "default_sqlite_file")]
    pub sqlite_file: String,

    /// Safety-net sync interval in seconds (0 = disabled)
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Start the background sync loop on initialize
    #[serde(default = "default_true")]
    pub auto_sync: bool,

    /// Collections refilled from the remote store after every sync pass
    #[serde(default)]
    pub watched_collections: Vec<String>,

    /// Remote field carrying the tenant id (None = remote is single-tenant)
    #[serde(default = "default_tenant_field")]
    pub tenant_field: Option<String>,

    /// Payload field carrying the entity id
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Passphrase for encrypted storage entries
    #[serde(default)]
    pub encryption_key: Option<String>,
}

fn default_project() -> String { "offline".to_string() }
fn default_tenant_id() -> String { "default".to_string() }
fn default_true() -> bool { true }
fn default_sqlite_file() -> String { "offline.db".to_string() }
fn default_sync_interval_secs() -> u64 { 300 } // 5 minutes
fn default_tenant_field() -> Option<String> { Some("tenantId".to_string()) }
fn default_id_field() -> String { "id".to_string() }

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            tenant_id: default_tenant_id(),
            data_dir: None,
            enable_sqlite: default_true(),
            enable_file_storage: default_true(),
            sqlite_file: default_sqlite_file(),
            sync_interval_secs: default_sync_interval_secs(),
            auto_sync: default_true(),
            watched_collections: Vec::new(),
            tenant_field: default_tenant_field(),
            id_field: default_id_field(),
            encryption_key: None,
        }
    }
}

impl OfflineConfig {
    /// Key prefix isolating this project+tenant inside shared device storage.
    #[must_use]
    pub fn namespace(&self) -> String {
        format!("{}_{}_", self.project, self.tenant_id)
    }

    /// Periodic sync interval, `None` when disabled.
    #[must_use]
    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }

    #[must_use]
    pub fn sqlite_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(&self.sqlite_file))
    }

    #[must_use]
    pub fn file_store_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("kv"))
    }
}
