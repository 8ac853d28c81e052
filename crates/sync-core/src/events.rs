//! Sync event bus.
//!
//! `SyncEvent` reports status changes and the effects of completed cycles.
//! `EventBus` fans events out to callbacks; dropping the returned
//! `Subscription` unsubscribes.

use crate::status::SyncStatus;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the sync scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Scheduler moved to a new status.
    StatusChanged {
        status: SyncStatus,
        /// Classified error message when `status` is `error`.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Milliseconds since Unix epoch.
        timestamp: i64,
    },
    /// A cycle finished successfully.
    CycleCompleted {
        pushed: bool,
        #[serde(rename = "conflictsCreated")]
        conflicts_created: usize,
        #[serde(rename = "updatedDocuments")]
        updated_documents: usize,
        #[serde(rename = "removedDocuments")]
        removed_documents: usize,
        timestamp: i64,
    },
    /// A document was added or replaced by a merge.
    DocumentUpdated {
        id: String,
        timestamp: i64,
    },
    /// A document disappeared from the local replica after a merge.
    DocumentRemoved {
        id: String,
        timestamp: i64,
    },
    /// A conflict artifact was materialized.
    ConflictCreated {
        #[serde(rename = "conflictId")]
        conflict_id: String,
        #[serde(rename = "originalId")]
        original_id: String,
        timestamp: i64,
    },
}

/// Keeps a callback registered; dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Fan-out of sync events. Wrap in `Arc` to subscribe.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: a subscription may be dropped from inside a callback
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Deliver `event` to every subscriber, outside the lock.
    pub fn emit(&self, event: SyncEvent) {
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
