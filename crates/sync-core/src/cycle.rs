//! One sync cycle: read both replicas, merge, materialize conflicts, apply
//! locally, then push if the remote is behind.
//!
//! The merged snapshot is applied locally before the push. A failed push
//! leaves the local replica ahead, and the next cycle sees
//! `local_contributed` again and retries it.

use crate::clock::now_millis;
use crate::codec::{self, CodecError};
use crate::conflict::{find_conflicts, materialized_keys, synthesize, CONFLICT_OF_PROP};
use crate::merge::{document_changes, merge, MergeOutcome};
use crate::store::{Connectivity, LocalStore, RemoteStore, StoreError, TransportError};

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Offline")]
    Offline,

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, CycleError>;

/// A conflict artifact written during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedConflict {
    pub id: String,
    pub original_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pushed: bool,
    pub conflicts_created: Vec<CreatedConflict>,
    /// Documents added or replaced relative to the pre-merge local replica
    pub updated_documents: Vec<String>,
    /// Documents that were live locally before the merge and are gone now
    pub removed_documents: Vec<String>,
    /// Revision tag of the remote blob as read at the start of the cycle
    pub remote_revision: Option<String>,
    pub completed_at: i64,
}

/// The collaborators one cycle runs against.
pub struct SyncCycle<L, R, C> {
    local: Arc<L>,
    remote: Arc<R>,
    connectivity: Arc<C>,
}

impl<L, R, C> Clone for SyncCycle<L, R, C> {
    fn clone(&self) -> Self {
        Self {
            local: Arc::clone(&self.local),
            remote: Arc::clone(&self.remote),
            connectivity: Arc::clone(&self.connectivity),
        }
    }
}

impl<L, R, C> SyncCycle<L, R, C>
where
    L: LocalStore,
    R: RemoteStore,
    C: Connectivity,
{
    pub fn new(local: Arc<L>, remote: Arc<R>, connectivity: Arc<C>) -> Self {
        Self {
            local,
            remote,
            connectivity,
        }
    }

    /// Run a full cycle. `last_successful_sync_at` is the conflict baseline.
    pub async fn run(&self, last_successful_sync_at: Option<i64>) -> Result<CycleReport> {
        if !self.connectivity.is_online().await {
            debug!("Connectivity precheck failed, skipping cycle");
            return Err(CycleError::Offline);
        }

        let local = self.local.read_snapshot().await?;
        let blob = self.remote.read().await.inspect_err(|e| {
            warn!("Remote read failed: {}", e);
        })?;
        let remote = codec::decode_or_empty(blob.text.as_deref());

        let MergeOutcome {
            mut merged,
            local_contributed,
        } = merge(&local, &remote);

        let now = now_millis();
        let entries = find_conflicts(&local, &remote, last_successful_sync_at);
        let artifacts: Vec<_> = synthesize(&entries, &materialized_keys(&merged), now)
            .into_iter()
            .filter(|doc| !merged.is_tombstoned(&doc.id))
            .collect();

        let conflicts_created: Vec<CreatedConflict> = artifacts
            .iter()
            .map(|doc| CreatedConflict {
                id: doc.id.clone(),
                original_id: doc.prop_str(CONFLICT_OF_PROP).unwrap_or_default().to_string(),
            })
            .collect();
        for doc in artifacts {
            merged.insert_document(doc);
        }

        self.local.apply_snapshot(&merged).await?;
        let (updated_documents, removed_documents) = document_changes(&local, &merged);

        let pushed = local_contributed || !conflicts_created.is_empty();
        if pushed {
            let text = codec::encode(&merged, now)?;
            self.remote.write(&text).await.inspect_err(|e| {
                warn!("Push failed, local replica is ahead until the next cycle: {}", e);
            })?;
        }

        info!(
            "Sync cycle complete: {} updated, {} removed, {} conflicts, pushed: {}",
            updated_documents.len(),
            removed_documents.len(),
            conflicts_created.len(),
            pushed
        );

        Ok(CycleReport {
            pushed,
            conflicts_created,
            updated_documents,
            removed_documents,
            remote_revision: blob.revision,
            completed_at: now_millis(),
        })
    }
}
