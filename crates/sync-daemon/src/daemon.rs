//! Daemon state: stores, scheduler, task index and persisted sync state for
//! one vault, plus the handlers the main loop dispatches to.

use anyhow::Result;
use std::sync::Arc;
use sync_core::clock::now_millis;
use sync_core::merge::document_changes;
use sync_core::status::SyncStatus;
use sync_core::store::{FsLocalStore, FsRemoteStore, LocalStore};
use sync_core::tasks::{FsTaskIndex, TaskIndexer};
use sync_core::{Connectivity, Subscription, SyncCycle, SyncEvent, SyncScheduler, VaultSnapshot};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::connectivity::DirectoryReachability;
use crate::native_fs::NativeFs;
use crate::persistence::SyncStateStorage;

pub type DaemonScheduler =
    SyncScheduler<FsLocalStore<NativeFs>, FsRemoteStore<NativeFs>, DirectoryReachability>;

pub struct Daemon {
    local: Arc<FsLocalStore<NativeFs>>,
    reachability: Arc<DirectoryReachability>,
    scheduler: DaemonScheduler,
    indexer: TaskIndexer<FsTaskIndex<NativeFs>>,
    state_storage: SyncStateStorage,
    /// Replica contents as of the last task reindex
    known: VaultSnapshot,
    /// Last reachability result, to detect the offline -> online edge
    online: bool,
    events_rx: mpsc::UnboundedReceiver<SyncEvent>,
    _subscription: Subscription,
}

impl Daemon {
    /// Build every component and bring the task index up to date.
    ///
    /// The scheduler is not started; call `start` for that.
    pub async fn open(config: &DaemonConfig) -> Result<Self> {
        let vault_fs = NativeFs::new(config.vault.clone());
        let local = Arc::new(FsLocalStore::new(vault_fs.clone()));
        let remote = Arc::new(FsRemoteStore::new(
            NativeFs::new(config.remote_dir.clone()),
            config.remote_file.clone(),
        ));
        let reachability = Arc::new(DirectoryReachability::new(config.remote_dir.clone()));

        let state_storage = SyncStateStorage::new(&config.vault);
        let initial = state_storage.state().to_state();
        if let Some(at) = initial.last_success_at {
            info!("Last successful sync at {}", at);
        }

        let cycle = SyncCycle::new(Arc::clone(&local), remote, Arc::clone(&reachability));
        let scheduler = SyncScheduler::new(cycle, config.settings.clone(), initial);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let subscription = scheduler.subscribe(move |event| {
            // Receiver gone means the daemon is shutting down.
            let _ = events_tx.send(event);
        });

        let mut daemon = Self {
            local,
            online: reachability.is_online().await,
            reachability,
            scheduler,
            indexer: TaskIndexer::new(FsTaskIndex::new(vault_fs)),
            state_storage,
            known: VaultSnapshot::new(),
            events_rx,
            _subscription: subscription,
        };
        daemon.rebuild_index().await?;
        Ok(daemon)
    }

    /// Start automatic triggers and run the initial sync.
    pub fn start(&self) {
        self.scheduler.start();
        self.scheduler.sync_now();
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.scheduler.stop();
        self.scheduler.wait_idle().await;
        self.process_pending_events().await?;
        self.state_storage.update(&self.scheduler.state())
    }

    pub fn scheduler(&self) -> &DaemonScheduler {
        &self.scheduler
    }

    pub fn local(&self) -> &Arc<FsLocalStore<NativeFs>> {
        &self.local
    }

    pub fn indexer(&self) -> &TaskIndexer<FsTaskIndex<NativeFs>> {
        &self.indexer
    }

    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events_rx.recv().await
    }

    /// Handle every event already queued by the scheduler.
    pub async fn process_pending_events(&mut self) -> Result<()> {
        while let Ok(event) = self.events_rx.try_recv() {
            self.on_sync_event(event).await?;
        }
        Ok(())
    }

    pub async fn on_sync_event(&mut self, event: SyncEvent) -> Result<()> {
        match event {
            SyncEvent::CycleCompleted { .. } => {
                self.refresh_index().await?;
            }
            SyncEvent::StatusChanged { status, .. } if status != SyncStatus::Syncing => {
                debug!("Sync status: {}", status.as_str());
                self.state_storage.update(&self.scheduler.state())?;
            }
            SyncEvent::ConflictCreated {
                conflict_id,
                original_id,
                ..
            } => {
                info!("Conflict recorded for {} as {}", original_id, conflict_id);
            }
            other => debug!("Sync event: {:?}", other),
        }
        Ok(())
    }

    /// The replica file changed on disk. Reindex and mark dirty unless it
    /// was our own write.
    ///
    /// Events during a cycle are dropped: the cycle rewrites the replica
    /// itself, and `CycleCompleted` reindexes whatever it left behind. A
    /// finished cycle's events are queued before it leaves flight, so they
    /// are handled first to account for its write.
    pub async fn on_replica_changed(&mut self) -> Result<()> {
        if self.scheduler.is_in_flight() {
            debug!("Replica changed during a sync cycle, deferring to its completion");
            return Ok(());
        }
        self.process_pending_events().await?;
        if self.refresh_index().await? {
            self.scheduler.mark_dirty();
        }
        Ok(())
    }

    /// Poll remote reachability and trigger a sync when it comes back.
    pub async fn poll_connectivity(&mut self) {
        let online = self.reachability.is_online().await;
        if online && !self.online {
            info!("Remote reachable again");
            self.scheduler.on_connectivity_regained();
        } else if !online && self.online {
            warn!("Remote unreachable");
        }
        self.online = online;
    }

    async fn rebuild_index(&mut self) -> Result<()> {
        let snapshot = self.local.read_snapshot().await?;
        self.indexer.reindex_all(&snapshot, now_millis()).await?;
        self.known = snapshot;
        Ok(())
    }

    /// Reindex documents that changed since the last refresh. Returns whether
    /// the replica differed from what was last indexed.
    async fn refresh_index(&mut self) -> Result<bool> {
        let current = self.local.read_snapshot().await?;
        if current == self.known {
            return Ok(false);
        }

        let (updated, removed) = document_changes(&self.known, &current);
        let structure_changed = current.schemas != self.known.schemas
            || updated
                .iter()
                .chain(removed.iter())
                .any(|id| self.is_container(id, &current));

        let now = now_millis();
        let summary = if structure_changed {
            // Project/area resolution may have moved for any document.
            self.indexer.reindex_all(&current, now).await?
        } else {
            self.indexer
                .reindex_changes(&current, &updated, &removed, now)
                .await?
        };
        debug!(
            "Task index refreshed: {} upserted, {} deleted",
            summary.upserted, summary.deleted
        );

        self.known = current;
        Ok(true)
    }

    fn is_container(&self, id: &str, current: &VaultSnapshot) -> bool {
        [self.known.document(id), current.document(id)]
            .into_iter()
            .flatten()
            .any(|doc| doc.is_container())
    }
}
