//! Persistence for sync state.
//!
//! Keeps the last attempt, last success and last error across restarts so the
//! conflict baseline (`last_success_at`) survives. Stored in
//! `.sync/sync_state.json` within the vault directory.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use sync_core::status::SyncState;
use tracing::warn;

/// Persisted subset of `SyncState`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSyncState {
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
    #[serde(default)]
    pub last_success_at: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PersistedSyncState {
    pub fn from_state(state: &SyncState) -> Self {
        Self {
            last_attempt_at: state.last_attempt_at,
            last_success_at: state.last_success_at,
            last_error: state.last_error.clone(),
        }
    }

    /// Seed for a fresh scheduler.
    pub fn to_state(&self) -> SyncState {
        SyncState {
            last_attempt_at: self.last_attempt_at,
            last_success_at: self.last_success_at,
            last_error: self.last_error.clone(),
            ..SyncState::default()
        }
    }
}

/// Storage for sync state.
pub struct SyncStateStorage {
    path: PathBuf,
    state: PersistedSyncState,
}

impl SyncStateStorage {
    /// Open storage in the vault, loading any existing state.
    ///
    /// A corrupt file is logged and replaced on the next save.
    pub fn new(vault_path: &Path) -> Self {
        let path = vault_path.join(".sync").join("sync_state.json");
        let mut storage = Self {
            path,
            state: PersistedSyncState::default(),
        };

        match storage.load() {
            Ok(loaded) => storage.state = loaded,
            Err(e) => warn!("Ignoring unreadable sync state: {}", e),
        }
        storage
    }

    pub fn load(&self) -> Result<PersistedSyncState> {
        if !self.path.exists() {
            return Ok(PersistedSyncState::default());
        }

        let contents = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(&self.state)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }

    /// Record the scheduler's state, writing only when it changed.
    pub fn update(&mut self, state: &SyncState) -> Result<()> {
        let next = PersistedSyncState::from_state(state);
        if next == self.state {
            return Ok(());
        }
        self.state = next;
        self.save()
    }

    pub fn state(&self) -> &PersistedSyncState {
        &self.state
    }
}
