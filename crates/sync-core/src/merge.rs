//! Merge engine: deterministic per-collection reconciliation of two replicas.
//!
//! Every collection is merged over the union of ids present on either side.
//! For each id a single winner is picked by a total ordering; on a full tie
//! the remote entry wins so that both replicas converge on the same bytes.
//!
//! | Collection | Order                                   |
//! |------------|-----------------------------------------|
//! | Tombstones | `rev`, then `deleted_at`                |
//! | Documents  | `rev`, then `updated_at` (tombstoned ids excluded) |
//! | Views      | `updated_at`, then `created_at`         |
//! | Schemas    | `updated_at`, then `version`            |
//!
//! `local_contributed` is set when the local side wins any entry, which is the
//! only signal used to decide whether the merged snapshot must be pushed.

use crate::model::{Document, Schema, Tombstone, VaultSnapshot, View};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Result of merging a local and a remote snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub merged: VaultSnapshot,
    /// True iff the local replica won at least one entry.
    pub local_contributed: bool,
}

pub(crate) fn compare_tombstones(a: &Tombstone, b: &Tombstone) -> Ordering {
    a.rev.cmp(&b.rev).then(a.deleted_at.cmp(&b.deleted_at))
}

pub(crate) fn compare_documents(a: &Document, b: &Document) -> Ordering {
    a.rev.cmp(&b.rev).then(a.updated_at.cmp(&b.updated_at))
}

pub(crate) fn compare_views(a: &View, b: &View) -> Ordering {
    a.updated_at
        .cmp(&b.updated_at)
        .then(a.created_at.cmp(&b.created_at))
}

pub(crate) fn compare_schemas(a: &Schema, b: &Schema) -> Ordering {
    a.updated_at
        .cmp(&b.updated_at)
        .then(a.version.cmp(&b.version))
}

/// Merge two snapshots. Pure: no I/O, total over well-formed input.
pub fn merge(local: &VaultSnapshot, remote: &VaultSnapshot) -> MergeOutcome {
    let mut local_contributed = false;

    let tombstones = merge_collection(
        &local.tombstones,
        &remote.tombstones,
        compare_tombstones,
        &mut local_contributed,
    );

    let live_local = without_tombstoned(&local.documents, &tombstones);
    let live_remote = without_tombstoned(&remote.documents, &tombstones);
    let documents = merge_collection(
        &live_local,
        &live_remote,
        compare_documents,
        &mut local_contributed,
    );

    let views = merge_collection(
        &local.views,
        &remote.views,
        compare_views,
        &mut local_contributed,
    );
    let schemas = merge_collection(
        &local.schemas,
        &remote.schemas,
        compare_schemas,
        &mut local_contributed,
    );

    debug!(
        "Merged snapshot: {} documents, {} tombstones, {} views, {} schemas (local contributed: {})",
        documents.len(),
        tombstones.len(),
        views.len(),
        schemas.len(),
        local_contributed
    );

    MergeOutcome {
        merged: VaultSnapshot {
            documents,
            tombstones,
            views,
            schemas,
        },
        local_contributed,
    }
}

fn without_tombstoned(
    documents: &BTreeMap<String, Document>,
    tombstones: &BTreeMap<String, Tombstone>,
) -> BTreeMap<String, Document> {
    documents
        .iter()
        .filter(|(id, _)| !tombstones.contains_key(*id))
        .map(|(id, doc)| (id.clone(), doc.clone()))
        .collect()
}

/// Pick a winner per id. Local wins only when strictly greater.
fn merge_collection<T: Clone>(
    local: &BTreeMap<String, T>,
    remote: &BTreeMap<String, T>,
    order: impl Fn(&T, &T) -> Ordering,
    local_contributed: &mut bool,
) -> BTreeMap<String, T> {
    let ids: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
    let mut merged = BTreeMap::new();

    for id in ids {
        let winner = match (local.get(id), remote.get(id)) {
            (Some(l), Some(r)) => {
                if order(l, r) == Ordering::Greater {
                    *local_contributed = true;
                    l
                } else {
                    r
                }
            }
            (Some(l), None) => {
                *local_contributed = true;
                l
            }
            (None, Some(r)) => r,
            (None, None) => continue,
        };
        merged.insert(id.clone(), winner.clone());
    }

    merged
}

/// Ids whose document in `after` differs from `before`, and ids that were
/// live in `before` but are gone from `after`.
///
/// Used after a merge to tell the task index which documents changed.
pub fn document_changes(before: &VaultSnapshot, after: &VaultSnapshot) -> (Vec<String>, Vec<String>) {
    let updated = after
        .documents
        .iter()
        .filter(|(id, doc)| before.documents.get(*id) != Some(*doc))
        .map(|(id, _)| id.clone())
        .collect();
    let removed = before
        .documents
        .keys()
        .filter(|id| !after.documents.contains_key(*id))
        .cloned()
        .collect();
    (updated, removed)
}
