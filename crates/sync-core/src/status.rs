//! Observable sync status.

use serde::{Deserialize, Serialize};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Synced,
    Error,
    Offline,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }
}

/// Read-only snapshot of the scheduler, for presentation layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Local mutations not yet covered by a completed cycle
    #[serde(default)]
    pub dirty: bool,
}

/// What asked for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncTrigger {
    Manual,
    Timer,
    Debounce,
    ConnectivityRegained,
    VisibilityRegained,
}

/// What a trigger did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new cycle was started
    Started,
    /// A cycle was in flight; one follow-up run is queued
    Queued,
    /// Ignored (scheduler stopped)
    Skipped,
}
