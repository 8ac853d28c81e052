//! Sync scheduler.
//!
//! Owns the orchestrator state machine and decides when cycles run:
//! - manual and connectivity/visibility triggers start a cycle immediately
//! - the periodic timer runs while auto-sync is enabled
//! - `mark_dirty` arms a debounce timer that fires once the replica has been
//!   quiet for the debounce period, if it is still dirty by then
//!
//! At most one cycle is in flight. A trigger arriving meanwhile sets a
//! pending flag, and the running loop performs exactly one more cycle when it
//! finishes.

use crate::clock::now_millis;
use crate::cycle::{CycleError, CycleReport, SyncCycle};
use crate::events::{EventBus, Subscription, SyncEvent};
use crate::settings::SyncSettings;
use crate::status::{SyncState, SyncStatus, SyncTrigger, TriggerOutcome};
use crate::store::{Connectivity, LocalStore, RemoteStore};

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

struct Inner {
    settings: SyncSettings,
    state: SyncState,
    /// Automatic triggers are honoured only while started
    started: bool,
    in_flight: bool,
    pending: bool,
    /// Bumped on every `mark_dirty`; a cycle only clears `dirty` if no
    /// mutation landed after it began
    dirty_generation: u64,
    timer: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
}

struct Shared<L, R, C> {
    cycle: SyncCycle<L, R, C>,
    events: Arc<EventBus>,
    inner: Mutex<Inner>,
    idle: Notify,
}

/// Drives sync cycles for one vault.
pub struct SyncScheduler<L, R, C>
where
    L: LocalStore + 'static,
    R: RemoteStore + 'static,
    C: Connectivity + 'static,
{
    shared: Arc<Shared<L, R, C>>,
}

impl<L, R, C> SyncScheduler<L, R, C>
where
    L: LocalStore + 'static,
    R: RemoteStore + 'static,
    C: Connectivity + 'static,
{
    /// `initial` seeds the observable state, typically reloaded from disk so
    /// the conflict baseline survives restarts.
    pub fn new(cycle: SyncCycle<L, R, C>, settings: SyncSettings, initial: SyncState) -> Self {
        let state = SyncState {
            status: SyncStatus::Idle,
            ..initial
        };
        Self {
            shared: Arc::new(Shared {
                cycle,
                events: Arc::new(EventBus::new()),
                inner: Mutex::new(Inner {
                    settings,
                    state,
                    started: false,
                    in_flight: false,
                    pending: false,
                    dirty_generation: 0,
                    timer: None,
                    debounce: None,
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Enable automatic triggers and arm the periodic timer.
    pub fn start(&self) {
        let mut inner = self.shared.lock();
        if inner.started {
            return;
        }
        inner.started = true;
        Shared::rearm_timer(&self.shared, &mut inner);
        info!(
            "Sync scheduler started (auto-sync: {}, interval: {:?})",
            inner.settings.auto_sync,
            inner.settings.interval()
        );
    }

    /// Stop scheduling new cycles. A cycle already in flight runs to completion.
    pub fn stop(&self) {
        let mut inner = self.shared.lock();
        inner.started = false;
        inner.pending = false;
        abort(&mut inner.timer);
        abort(&mut inner.debounce);
        info!("Sync scheduler stopped");
    }

    pub fn set_auto_sync(&self, enabled: bool) {
        let mut inner = self.shared.lock();
        inner.settings.auto_sync = enabled;
        if !enabled {
            abort(&mut inner.debounce);
        }
        Shared::rearm_timer(&self.shared, &mut inner);
        debug!("Auto-sync {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Change the periodic interval (clamped) and restart the timer.
    pub fn set_interval(&self, interval: Duration) {
        let mut inner = self.shared.lock();
        inner.settings.set_interval(interval);
        Shared::rearm_timer(&self.shared, &mut inner);
    }

    pub fn settings(&self) -> SyncSettings {
        self.shared.lock().settings.clone()
    }

    pub fn trigger(&self, trigger: SyncTrigger) -> TriggerOutcome {
        Shared::trigger(&self.shared, trigger)
    }

    /// Run a cycle now, bypassing the debounce.
    pub fn sync_now(&self) -> TriggerOutcome {
        self.trigger(SyncTrigger::Manual)
    }

    pub fn on_connectivity_regained(&self) -> TriggerOutcome {
        self.trigger(SyncTrigger::ConnectivityRegained)
    }

    pub fn on_visibility_regained(&self) -> TriggerOutcome {
        self.trigger(SyncTrigger::VisibilityRegained)
    }

    /// Record a local mutation and (re)arm the debounce timer.
    pub fn mark_dirty(&self) {
        let mut inner = self.shared.lock();
        inner.state.dirty = true;
        inner.dirty_generation += 1;
        abort(&mut inner.debounce);

        if !inner.started || !inner.settings.auto_sync {
            return;
        }
        let quiet = inner.settings.debounce;
        let shared = Arc::clone(&self.shared);
        inner.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            Shared::trigger(&shared, SyncTrigger::Debounce);
        }));
    }

    pub fn state(&self) -> SyncState {
        self.shared.lock().state.clone()
    }

    pub fn is_in_flight(&self) -> bool {
        self.shared.lock().in_flight
    }

    /// Wait until no cycle is in flight or queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if !self.shared.lock().in_flight {
                return;
            }
            notified.await;
        }
    }

    pub fn subscribe(&self, callback: impl Fn(SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.shared.events.subscribe(callback)
    }
}

impl<L, R, C> Drop for SyncScheduler<L, R, C>
where
    L: LocalStore + 'static,
    R: RemoteStore + 'static,
    C: Connectivity + 'static,
{
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        abort(&mut inner.timer);
        abort(&mut inner.debounce);
    }
}

fn abort(handle: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = handle.take() {
        handle.abort();
    }
}

impl<L, R, C> Shared<L, R, C>
where
    L: LocalStore + 'static,
    R: RemoteStore + 'static,
    C: Connectivity + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rearm_timer(this: &Arc<Self>, inner: &mut Inner) {
        abort(&mut inner.timer);
        if !inner.started || !inner.settings.auto_sync {
            return;
        }
        let period = inner.settings.interval();
        let shared = Arc::clone(this);
        inner.timer = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                Shared::trigger(&shared, SyncTrigger::Timer);
            }
        }));
    }

    fn trigger(this: &Arc<Self>, trigger: SyncTrigger) -> TriggerOutcome {
        let mut inner = this.lock();

        let allowed = match trigger {
            SyncTrigger::Manual => true,
            SyncTrigger::Timer => inner.started && inner.settings.auto_sync,
            // A debounce only follows up on mutations not yet synced.
            SyncTrigger::Debounce => {
                inner.started && inner.settings.auto_sync && inner.state.dirty
            }
            SyncTrigger::ConnectivityRegained | SyncTrigger::VisibilityRegained => inner.started,
        };
        if !allowed {
            debug!("Ignoring {:?} trigger", trigger);
            return TriggerOutcome::Skipped;
        }

        // Any cycle that starts from here covers the pending debounce.
        if trigger != SyncTrigger::Debounce {
            abort(&mut inner.debounce);
        }

        if inner.in_flight {
            debug!("Cycle in flight, queueing {:?} trigger", trigger);
            inner.pending = true;
            return TriggerOutcome::Queued;
        }

        debug!("Starting cycle ({:?})", trigger);
        inner.in_flight = true;
        drop(inner);

        let shared = Arc::clone(this);
        tokio::spawn(async move { shared.run_loop().await });
        TriggerOutcome::Started
    }

    /// Run cycles until no follow-up is pending.
    async fn run_loop(self: Arc<Self>) {
        loop {
            let started_at = now_millis();
            let (baseline, generation) = {
                let mut inner = self.lock();
                inner.state.status = SyncStatus::Syncing;
                inner.state.last_attempt_at = Some(started_at);
                (inner.state.last_success_at, inner.dirty_generation)
            };
            self.events.emit(SyncEvent::StatusChanged {
                status: SyncStatus::Syncing,
                error: None,
                timestamp: started_at,
            });

            let result = self.cycle.run(baseline).await;
            self.finish(result, started_at, generation);

            let again = {
                let mut inner = self.lock();
                if inner.pending {
                    inner.pending = false;
                    true
                } else {
                    inner.in_flight = false;
                    false
                }
            };
            if !again {
                self.idle.notify_waiters();
                return;
            }
            debug!("Running queued follow-up cycle");
        }
    }

    fn finish(&self, result: Result<CycleReport, CycleError>, started_at: i64, generation: u64) {
        let now = now_millis();
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            match &result {
                Ok(report) => {
                    inner.state.status = SyncStatus::Synced;
                    // The cycle's start is the last point both replicas agreed on.
                    inner.state.last_success_at = Some(started_at);
                    inner.state.last_error = None;
                    if inner.dirty_generation == generation {
                        inner.state.dirty = false;
                    }
                    events.extend(report_events(report));
                }
                Err(CycleError::Offline) => {
                    info!("Offline, sync skipped");
                    inner.state.status = SyncStatus::Offline;
                }
                Err(e) => {
                    error!("Sync cycle failed: {}", e);
                    inner.state.status = SyncStatus::Error;
                    inner.state.last_error = Some(e.to_string());
                }
            }
            let error = match &result {
                Err(CycleError::Offline) | Ok(_) => None,
                Err(e) => Some(e.to_string()),
            };
            events.push(SyncEvent::StatusChanged {
                status: inner.state.status,
                error,
                timestamp: now,
            });
        }
        for event in events {
            self.events.emit(event);
        }
    }
}

fn report_events(report: &CycleReport) -> Vec<SyncEvent> {
    let now = report.completed_at;
    let mut events: Vec<SyncEvent> = report
        .updated_documents
        .iter()
        .map(|id| SyncEvent::DocumentUpdated {
            id: id.clone(),
            timestamp: now,
        })
        .collect();
    events.extend(report.removed_documents.iter().map(|id| SyncEvent::DocumentRemoved {
        id: id.clone(),
        timestamp: now,
    }));
    events.extend(
        report
            .conflicts_created
            .iter()
            .map(|c| SyncEvent::ConflictCreated {
                conflict_id: c.id.clone(),
                original_id: c.original_id.clone(),
                timestamp: now,
            }),
    );
    events.push(SyncEvent::CycleCompleted {
        pushed: report.pushed,
        conflicts_created: report.conflicts_created.len(),
        updated_documents: report.updated_documents.len(),
        removed_documents: report.removed_documents.len(),
        timestamp: now,
    });
    events
}
