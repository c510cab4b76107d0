//! Public types for the sync engine.

use thiserror::Error;

use crate::storage::StorageError;

/// Engine state.
///
/// Use [`super::SyncEngine::state()`] to check the current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No pass running
    Idle,
    /// Draining the queue and refilling the cache
    Syncing,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Syncing => write!(f, "Syncing"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Device is offline")]
    Offline,
    #[error("A sync pass is already running")]
    AlreadySyncing,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// No entry failed
    pub success: bool,
    pub synced: usize,
    pub failed: usize,
    /// One message per failed entry
    pub errors: Vec<String>,
}

/// Sent to progress observers after every entry and once at the end of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    pub total: usize,
    pub completed: usize,
    /// `false` only on the final notification of a pass
    pub in_progress: bool,
    pub last_error: Option<String>,
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub is_offline: bool,
    pub pending_changes: usize,
    pub last_sync_time: Option<i64>,
}
