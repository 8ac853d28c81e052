//! sync-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod connectivity;
pub mod daemon;
pub mod native_fs;
pub mod persistence;
pub mod watcher;

pub use config::{Args, ConfigError, DaemonConfig};
pub use connectivity::DirectoryReachability;
pub use daemon::{Daemon, DaemonScheduler};
pub use native_fs::NativeFs;
pub use persistence::{PersistedSyncState, SyncStateStorage};
pub use watcher::{FileEvent, FileEventKind, FileWatcher};
