//! Conflict detection and conflict artifact synthesis.
//!
//! A document is in conflict when both replicas changed it since they last
//! agreed (both `updated_at` values are after the last successful sync) and
//! the two versions differ in something a user would notice. The merge engine
//! still picks a winner; the conflict artifact is an extra leaf document
//! that records both versions for manual review.
//!
//! Artifacts carry provenance properties. Re-running sync scans the merged
//! snapshot for existing artifacts and skips any conflict whose provenance key
//! is already materialized, so an interrupted sync never duplicates them.

use crate::model::{ContentBlock, Document, DocumentKind, VaultSnapshot};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;
use uuid::Uuid;

/// Marker property identifying a synthesized conflict document.
pub const CONFLICT_MARKER_PROP: &str = "syntheticConflict";
pub const CONFLICT_OF_PROP: &str = "conflictOf";
pub const CONFLICT_LOCAL_UPDATED_PROP: &str = "conflictLocalUpdatedAt";
pub const CONFLICT_REMOTE_UPDATED_PROP: &str = "conflictRemoteUpdatedAt";
pub const CONFLICT_LOCAL_REV_PROP: &str = "conflictLocalRev";
pub const CONFLICT_REMOTE_REV_PROP: &str = "conflictRemoteRev";

/// Tag added to every conflict document.
pub const CONFLICT_TAG: &str = "sync-conflict";

/// Namespace for deterministic conflict document ids.
const CONFLICT_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_3c2e_94a0_4d57_b0c8_2f41_7e9d_5a13);

/// A document edited concurrently on both replicas.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictEntry {
    pub local: Document,
    pub remote: Document,
}

impl ConflictEntry {
    pub fn document_id(&self) -> &str {
        &self.local.id
    }

    pub fn key(&self) -> ConflictKey {
        ConflictKey {
            original_id: self.local.id.clone(),
            local_updated_at: self.local.updated_at,
            remote_updated_at: self.remote.updated_at,
        }
    }
}

/// Provenance key of a materialized conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConflictKey {
    pub original_id: String,
    pub local_updated_at: i64,
    pub remote_updated_at: i64,
}

impl ConflictKey {
    /// The same conflict as seen from the other replica.
    pub fn mirrored(&self) -> Self {
        Self {
            original_id: self.original_id.clone(),
            local_updated_at: self.remote_updated_at,
            remote_updated_at: self.local_updated_at,
        }
    }

    /// Id of the artifact for this conflict. Independent of orientation, so
    /// replicas that both synthesize it before seeing each other's push
    /// produce the same document id.
    fn artifact_id(&self) -> String {
        let low = self.local_updated_at.min(self.remote_updated_at);
        let high = self.local_updated_at.max(self.remote_updated_at);
        let name = format!("{}:{}:{}", self.original_id, low, high);
        Uuid::new_v5(&CONFLICT_NAMESPACE, name.as_bytes()).to_string()
    }
}

pub fn is_conflict_artifact(doc: &Document) -> bool {
    doc.props
        .get(CONFLICT_MARKER_PROP)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Find documents both replicas changed since `last_successful_sync_at` in a
/// meaningful way. A replica that never synced uses 0 as its baseline.
pub fn find_conflicts(
    local: &VaultSnapshot,
    remote: &VaultSnapshot,
    last_successful_sync_at: Option<i64>,
) -> Vec<ConflictEntry> {
    let since = last_successful_sync_at.unwrap_or(0);

    local
        .documents
        .iter()
        .filter_map(|(id, local_doc)| {
            let remote_doc = remote.documents.get(id)?;
            if local_doc.updated_at <= since || remote_doc.updated_at <= since {
                return None;
            }
            if is_conflict_artifact(local_doc) || is_conflict_artifact(remote_doc) {
                return None;
            }
            if !documents_differ(local_doc, remote_doc) {
                return None;
            }
            debug!(
                "Concurrent edit on {} (local rev {} @ {}, remote rev {} @ {})",
                id, local_doc.rev, local_doc.updated_at, remote_doc.rev, remote_doc.updated_at
            );
            Some(ConflictEntry {
                local: local_doc.clone(),
                remote: remote_doc.clone(),
            })
        })
        .collect()
}

/// Provenance keys of every conflict artifact already in `snapshot`.
pub fn materialized_keys(snapshot: &VaultSnapshot) -> HashSet<ConflictKey> {
    snapshot
        .documents
        .values()
        .filter(|doc| is_conflict_artifact(doc))
        .filter_map(|doc| {
            Some(ConflictKey {
                original_id: doc.prop_str(CONFLICT_OF_PROP)?.to_string(),
                local_updated_at: doc.props.get(CONFLICT_LOCAL_UPDATED_PROP)?.as_i64()?,
                remote_updated_at: doc.props.get(CONFLICT_REMOTE_UPDATED_PROP)?.as_i64()?,
            })
        })
        .collect()
}

/// Build one conflict document per entry whose key is not yet materialized.
///
/// Entries sharing a key within the same batch produce a single document. A
/// key also counts as materialized when the other replica recorded it with
/// local and remote swapped.
pub fn synthesize(
    entries: &[ConflictEntry],
    existing: &HashSet<ConflictKey>,
    now: i64,
) -> Vec<Document> {
    let mut seen = existing.clone();
    let mut docs = Vec::new();

    for entry in entries {
        let key = entry.key();
        if seen.contains(&key.mirrored()) || !seen.insert(key.clone()) {
            debug!("Conflict for {} already materialized, skipping", key.original_id);
            continue;
        }
        docs.push(conflict_document(entry, &key, now));
    }

    docs
}

fn conflict_document(entry: &ConflictEntry, key: &ConflictKey, now: i64) -> Document {
    let title = if entry.local.title.trim().is_empty() {
        "Untitled".to_string()
    } else {
        entry.local.title.trim().to_string()
    };

    let mut doc = Document::leaf(key.artifact_id(), format!("{} (conflict)", title), now);
    doc.parent_id = entry.local.parent_id.clone();
    doc.tags.insert(CONFLICT_TAG.to_string());
    doc.props.insert(CONFLICT_MARKER_PROP.into(), Value::Bool(true));
    doc.props
        .insert(CONFLICT_OF_PROP.into(), Value::String(key.original_id.clone()));
    doc.props
        .insert(CONFLICT_LOCAL_UPDATED_PROP.into(), json!(entry.local.updated_at));
    doc.props
        .insert(CONFLICT_REMOTE_UPDATED_PROP.into(), json!(entry.remote.updated_at));
    doc.props
        .insert(CONFLICT_LOCAL_REV_PROP.into(), json!(entry.local.rev));
    doc.props
        .insert(CONFLICT_REMOTE_REV_PROP.into(), json!(entry.remote.rev));

    doc.content = vec![
        ContentBlock::new(
            "conflict-summary",
            "paragraph",
            format!(
                "\"{}\" was edited on this device and on the remote replica since the last sync. \
                 The newer revision was kept; both versions are recorded below.",
                title
            ),
        ),
        ContentBlock::new(
            "conflict-local-heading",
            "heading",
            format!(
                "Local version (rev {}, updated {})",
                entry.local.rev, entry.local.updated_at
            ),
        ),
        ContentBlock::new("conflict-local", "code", render(&entry.local))
            .with_attr("language", "json"),
        ContentBlock::new(
            "conflict-remote-heading",
            "heading",
            format!(
                "Remote version (rev {}, updated {})",
                entry.remote.rev, entry.remote.updated_at
            ),
        ),
        ContentBlock::new("conflict-remote", "code", render(&entry.remote))
            .with_attr("language", "json"),
    ];

    doc
}

fn render(doc: &Document) -> String {
    serde_json::to_string_pretty(&Canonical::of(doc)).unwrap_or_default()
}

/// Structural comparison ignoring `rev` and timestamps.
pub fn documents_differ(a: &Document, b: &Document) -> bool {
    Canonical::of(a) != Canonical::of(b)
}

/// The user-visible shape of a document, normalized for comparison.
#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct Canonical {
    kind: DocumentKind,
    title: String,
    parent_id: Option<String>,
    favorite: bool,
    tags: BTreeSet<String>,
    props: Map<String, Value>,
    content: Vec<CanonicalBlock>,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalBlock {
    id: String,
    kind: String,
    text: String,
    attrs: Map<String, Value>,
}

impl Canonical {
    fn of(doc: &Document) -> Self {
        let content = match doc.kind {
            DocumentKind::Container => Vec::new(),
            _ => doc
                .content
                .iter()
                .map(|block| CanonicalBlock {
                    id: block.id.clone(),
                    kind: block.kind.trim().to_ascii_lowercase(),
                    text: normalize_text(&block.text),
                    attrs: normalize_props(&block.attrs),
                })
                .collect(),
        };

        Self {
            kind: doc.kind.clone(),
            title: doc.title.trim().to_string(),
            parent_id: doc.parent_id.clone().filter(|p| !p.is_empty()),
            favorite: doc.favorite,
            tags: doc
                .tags
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            props: normalize_props(&doc.props),
            content,
        }
    }
}

fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").trim_end().to_string()
}

/// Drop null-valued keys recursively; maps are ordered, so key order is irrelevant.
fn normalize_props(props: &BTreeMap<String, Value>) -> Map<String, Value> {
    props
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), normalize_value(v)))
        .collect()
}

fn normalize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), normalize_value(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
        Value::String(s) => Value::String(s.replace("\r\n", "\n")),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge;

    const LAST_SYNC: i64 = 1_000;

    fn note(id: &str, rev: u64, updated_at: i64, title: &str) -> Document {
        let mut d = Document::leaf(id, title, 0);
        d.rev = rev;
        d.updated_at = updated_at;
        d.content.push(ContentBlock::new("b1", "paragraph", "body"));
        d
    }

    fn pair(local: Document, remote: Document) -> (VaultSnapshot, VaultSnapshot) {
        (
            VaultSnapshot::new().with_document(local),
            VaultSnapshot::new().with_document(remote),
        )
    }

    #[test]
    fn test_concurrent_title_edit_is_conflict() {
        let (local, remote) = pair(note("n1", 3, 1_500, "A"), note("n1", 3, 1_600, "B"));
        let conflicts = find_conflicts(&local, &remote, Some(LAST_SYNC));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].document_id(), "n1");
    }

    #[test]
    fn test_stale_side_is_not_conflict() {
        let (local, remote) = pair(note("n1", 2, 900, "A"), note("n1", 3, 1_600, "B"));
        assert!(find_conflicts(&local, &remote, Some(LAST_SYNC)).is_empty());
    }

    #[test]
    fn test_rev_and_timestamp_only_difference_is_not_conflict() {
        let (local, remote) = pair(note("n1", 3, 1_500, "Same"), note("n1", 7, 1_900, "Same"));
        assert!(find_conflicts(&local, &remote, Some(LAST_SYNC)).is_empty());
    }

    #[test]
    fn test_tag_order_and_null_props_are_not_meaningful() {
        let mut a = note("n1", 1, 1_500, "T");
        a.tags = ["x", "y"].iter().map(|s| s.to_string()).collect();
        a.props.insert("color".into(), json!("red"));
        a.props.insert("gone".into(), Value::Null);
        let mut b = note("n1", 1, 1_600, "T");
        b.tags = ["y", "x"].iter().map(|s| s.to_string()).collect();
        b.props.insert("color".into(), json!("red"));

        assert!(!documents_differ(&a, &b));
    }

    #[test]
    fn test_content_changes_are_meaningful() {
        let a = note("n1", 1, 1_500, "T");
        let mut b = a.clone();
        b.content[0].text = "edited".into();
        assert!(documents_differ(&a, &b));

        let mut reordered = a.clone();
        reordered.content.push(ContentBlock::new("b2", "paragraph", "second"));
        let mut swapped = reordered.clone();
        swapped.content.reverse();
        assert!(documents_differ(&reordered, &swapped));

        let mut crlf = a.clone();
        crlf.content[0].text = "body  \r\n".into();
        assert!(!documents_differ(&a, &crlf));
    }

    #[test]
    fn test_container_content_is_ignored() {
        let mut a = Document::container("c1", "Folder", 0);
        let mut b = a.clone();
        a.content.push(ContentBlock::new("x", "paragraph", "stray"));
        b.favorite = false;
        assert!(!documents_differ(&a, &b));
    }

    #[test]
    fn test_synthesized_document_records_provenance() {
        let (local, remote) = pair(note("n1", 3, 1_500, "A"), note("n1", 4, 1_600, "B"));
        let entries = find_conflicts(&local, &remote, Some(LAST_SYNC));
        let docs = synthesize(&entries, &HashSet::new(), 2_000);

        assert_eq!(docs.len(), 1);
        let artifact = &docs[0];
        assert!(is_conflict_artifact(artifact));
        assert_ne!(artifact.id, "n1");
        assert_eq!(artifact.kind, DocumentKind::Leaf);
        assert_eq!(artifact.prop_str(CONFLICT_OF_PROP), Some("n1"));
        assert_eq!(artifact.props[CONFLICT_LOCAL_UPDATED_PROP], json!(1_500));
        assert_eq!(artifact.props[CONFLICT_REMOTE_UPDATED_PROP], json!(1_600));
        assert_eq!(artifact.props[CONFLICT_LOCAL_REV_PROP], json!(3));
        assert_eq!(artifact.props[CONFLICT_REMOTE_REV_PROP], json!(4));
        assert!(artifact.tags.contains(CONFLICT_TAG));
        assert!(artifact.content.iter().any(|b| b.text.contains("\"title\": \"B\"")));
    }

    #[test]
    fn test_synthesis_is_idempotent_across_reruns() {
        let (local, remote) = pair(note("n1", 3, 1_500, "A"), note("n1", 3, 1_600, "B"));

        let entries = find_conflicts(&local, &remote, Some(LAST_SYNC));
        let mut merged = merge(&local, &remote).merged;
        for doc in synthesize(&entries, &materialized_keys(&merged), 2_000) {
            merged.insert_document(doc);
        }

        // Retry after an interrupted push: same concurrent edit, same merged set.
        let entries = find_conflicts(&local, &remote, Some(LAST_SYNC));
        let again = synthesize(&entries, &materialized_keys(&merged), 3_000);
        assert!(again.is_empty());

        let artifacts = merged.documents.values().filter(|d| is_conflict_artifact(d)).count();
        assert_eq!(artifacts, 1);
    }

    #[test]
    fn test_duplicate_entries_in_one_batch_synthesize_once() {
        let entry = ConflictEntry {
            local: note("n1", 1, 1_500, "A"),
            remote: note("n1", 1, 1_600, "B"),
        };
        let docs = synthesize(&[entry.clone(), entry], &HashSet::new(), 2_000);
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn test_other_replicas_view_of_a_conflict_is_not_synthesized_again() {
        let ours = ConflictEntry {
            local: note("n1", 2, 1_500, "A"),
            remote: note("n1", 2, 1_600, "B"),
        };
        let theirs = ConflictEntry {
            local: ours.remote.clone(),
            remote: ours.local.clone(),
        };

        let artifact = synthesize(&[ours], &HashSet::new(), 2_000).remove(0);
        let merged = VaultSnapshot::new().with_document(artifact);
        assert!(synthesize(&[theirs], &materialized_keys(&merged), 3_000).is_empty());
    }

    #[test]
    fn test_replicas_synthesizing_independently_share_artifact_id() {
        let ours = ConflictEntry {
            local: note("n1", 2, 1_500, "A"),
            remote: note("n1", 2, 1_600, "B"),
        };
        let theirs = ConflictEntry {
            local: ours.remote.clone(),
            remote: ours.local.clone(),
        };

        let a = synthesize(&[ours], &HashSet::new(), 2_000).remove(0);
        let b = synthesize(&[theirs], &HashSet::new(), 2_100).remove(0);
        assert_eq!(a.id, b.id);

        // Both pushes meet in a merge and collapse to one artifact.
        let merged = merge(
            &VaultSnapshot::new().with_document(a),
            &VaultSnapshot::new().with_document(b),
        )
        .merged;
        assert_eq!(merged.documents.values().filter(|d| is_conflict_artifact(d)).count(), 1);
    }

    #[test]
    fn test_artifact_ids_are_deterministic() {
        let entry = ConflictEntry {
            local: note("n1", 1, 1_500, "A"),
            remote: note("n1", 1, 1_600, "B"),
        };
        let first = synthesize(std::slice::from_ref(&entry), &HashSet::new(), 2_000);
        let second = synthesize(std::slice::from_ref(&entry), &HashSet::new(), 9_000);
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn test_conflict_artifacts_are_never_conflicts_themselves() {
        let entry = ConflictEntry {
            local: note("n1", 1, 1_500, "A"),
            remote: note("n1", 1, 1_600, "B"),
        };
        let artifact = synthesize(&[entry], &HashSet::new(), 2_000).remove(0);
        let mut edited = artifact.clone();
        edited.title = "renamed".into();
        edited.updated_at = 2_500;

        let (local, remote) = pair(artifact, edited);
        assert!(find_conflicts(&local, &remote, Some(LAST_SYNC)).is_empty());
    }
}
