//! sync-core: offline-first vault synchronization.
//!
//! This crate provides:
//! - The replicated vault model and its versioned JSON codec
//! - A deterministic merge engine with tombstone-based deletion
//! - Conflict detection and idempotent conflict artifacts
//! - A derived task index kept in step with document content
//! - `SyncCycle` and `SyncScheduler`, which run merge/push cycles against
//!   `LocalStore` and `RemoteStore` collaborators
//! - FileSystem trait abstraction and file-backed stores

pub mod clock;
pub mod codec;
pub mod conflict;
pub mod cycle;
pub mod events;
pub mod fs;
pub mod merge;
pub mod model;
pub mod scheduler;
pub mod settings;
pub mod status;
pub mod store;
pub mod tasks;

pub use codec::CodecError;
pub use conflict::{ConflictEntry, ConflictKey};
pub use cycle::{CreatedConflict, CycleError, CycleReport, SyncCycle};
pub use events::{EventBus, Subscription, SyncEvent};
pub use fs::{FileSystem, FsError, InMemoryFs};
pub use merge::{merge, MergeOutcome};
pub use model::{
    ContentBlock, Document, DocumentKind, Schema, TaskIndexRow, TaskPriority, TaskStatus,
    Tombstone, VaultSnapshot, View,
};
pub use scheduler::SyncScheduler;
pub use settings::SyncSettings;
pub use status::{SyncState, SyncStatus, SyncTrigger, TriggerOutcome};
pub use store::{
    AlwaysOnline, Connectivity, FsLocalStore, FsRemoteStore, LocalStore, RemoteBlob,
    RemoteStore, StoreError, TransportError,
};
pub use tasks::{FsTaskIndex, TaskIndexStore, TaskIndexer, TaskOverride};
