//! Versioned JSON encoding of a vault snapshot.
//!
//! The same envelope is used for the remote blob and the on-disk local replica:
//!
//! ```json
//! { "schemaVersion": 1, "lastWriteAt": 0, "documents": [], "tombstones": [], "views": [], "schemas": [] }
//! ```

use crate::merge::{compare_documents, compare_schemas, compare_tombstones, compare_views};
use crate::model::{Document, Schema, Tombstone, VaultSnapshot, View, SNAPSHOT_SCHEMA_VERSION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    schema_version: u32,
    last_write_at: i64,
    documents: Vec<&'a Document>,
    tombstones: Vec<&'a Tombstone>,
    views: Vec<&'a View>,
    schemas: Vec<&'a Schema>,
}

/// Envelope as read. Entries stay raw so one unreadable entry cannot take the
/// rest of the snapshot down with it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    documents: Vec<Value>,
    #[serde(default)]
    tombstones: Vec<Value>,
    #[serde(default)]
    views: Vec<Value>,
    #[serde(default)]
    schemas: Vec<Value>,
}

/// Serialize a snapshot, stamping `lastWriteAt` with `now`.
pub fn encode(snapshot: &VaultSnapshot, now: i64) -> Result<String> {
    let envelope = Envelope {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        last_write_at: now,
        documents: snapshot.documents.values().collect(),
        tombstones: snapshot.tombstones.values().collect(),
        views: snapshot.views.values().collect(),
        schemas: snapshot.schemas.values().collect(),
    };
    serde_json::to_string(&envelope).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Parse an encoded snapshot.
///
/// Entries that cannot be read are skipped with a warning. Duplicate ids
/// collapse to the entry the merge engine would pick, and documents shadowed
/// by a tombstone are dropped.
pub fn decode(text: &str) -> Result<VaultSnapshot> {
    let envelope: RawEnvelope =
        serde_json::from_str(text).map_err(|e| CodecError::Deserialization(e.to_string()))?;

    if envelope.schema_version > SNAPSHOT_SCHEMA_VERSION {
        warn!(
            "Snapshot schema version {} is newer than supported {}; unknown fields are ignored",
            envelope.schema_version, SNAPSHOT_SCHEMA_VERSION
        );
    }

    let tombstones: Vec<Tombstone> = entries(envelope.tombstones, "tombstone");
    let documents: Vec<Document> = entries(envelope.documents, "document");
    let views: Vec<View> = entries(envelope.views, "view");
    let schemas: Vec<Schema> = entries(envelope.schemas, "schema");

    let tombstones = collect(tombstones, |t| t.id.clone(), compare_tombstones);
    let mut documents = collect(documents, |d| d.id.clone(), compare_documents);
    documents.retain(|id, _| !tombstones.contains_key(id));

    Ok(VaultSnapshot {
        documents,
        tombstones,
        views: collect(views, |v| v.id.clone(), compare_views),
        schemas: collect(schemas, |s| s.id.clone(), compare_schemas),
    })
}

fn entries<T: DeserializeOwned>(raw: Vec<Value>, what: &str) -> Vec<T> {
    raw.into_iter()
        .filter_map(|value| {
            let id = value.get("id").and_then(Value::as_str).unwrap_or("?").to_string();
            serde_json::from_value(value)
                .inspect_err(|e| warn!("Skipping unreadable {} {}: {}", what, id, e))
                .ok()
        })
        .collect()
}

/// Parse a remote blob, substituting an empty snapshot when it is missing or
/// malformed so a bad blob never fails the cycle.
pub fn decode_or_empty(text: Option<&str>) -> VaultSnapshot {
    match text {
        None => VaultSnapshot::new(),
        Some(t) if t.trim().is_empty() => VaultSnapshot::new(),
        Some(t) => decode(t).unwrap_or_else(|e| {
            warn!("Ignoring malformed remote snapshot: {}", e);
            VaultSnapshot::new()
        }),
    }
}

fn collect<T>(
    items: Vec<T>,
    id: impl Fn(&T) -> String,
    order: impl Fn(&T, &T) -> Ordering,
) -> BTreeMap<String, T> {
    let mut map: BTreeMap<String, T> = BTreeMap::new();
    for item in items {
        let key = id(&item);
        match map.get(&key) {
            Some(existing) if order(existing, &item) != Ordering::Less => {}
            _ => {
                map.insert(key, item);
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentBlock, DocumentKind};

    fn sample() -> VaultSnapshot {
        let mut doc = Document::leaf("n1", "Groceries", 10);
        doc.content.push(ContentBlock::task("b1", "Milk"));
        VaultSnapshot::new()
            .with_document(doc)
            .with_tombstone(Tombstone {
                id: "n2".into(),
                rev: 3,
                deleted_at: 20,
            })
    }

    #[test]
    fn test_encode_writes_versioned_envelope() {
        let text = encode(&sample(), 1234).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["schemaVersion"], SNAPSHOT_SCHEMA_VERSION);
        assert_eq!(value["lastWriteAt"], 1234);
        assert_eq!(value["documents"][0]["id"], "n1");
        assert_eq!(value["tombstones"][0]["rev"], 3);
        assert!(value["views"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_decode_restores_encoded_snapshot() {
        let text = encode(&sample(), 1).unwrap();
        assert_eq!(decode(&text).unwrap(), sample());
    }

    #[test]
    fn test_missing_or_malformed_blob_is_empty() {
        assert!(decode_or_empty(None).is_empty());
        assert!(decode_or_empty(Some("   ")).is_empty());
        assert!(decode_or_empty(Some("{not json")).is_empty());
        assert!(decode_or_empty(Some("\"just a string\"")).is_empty());
    }

    #[test]
    fn test_missing_collections_default_to_empty() {
        let snapshot = decode(r#"{"schemaVersion":1}"#).unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_newer_schema_version_is_accepted() {
        let text = r#"{"schemaVersion":99,"futureField":true,"documents":[
            {"id":"n1","kind":"leaf","rev":1,"createdAt":0,"updatedAt":0,"extra":"x"}]}"#;
        let snapshot = decode(text).unwrap();
        assert!(snapshot.document("n1").is_some());
    }

    #[test]
    fn test_unreadable_entries_are_skipped_individually() {
        let text = r#"{"schemaVersion":1,
            "documents":[
                {"id":"keep","kind":"leaf","rev":1,"createdAt":0,"updatedAt":1},
                {"id":"broken","kind":"leaf","createdAt":0,"updatedAt":1}],
            "tombstones":[{"id":"t1","rev":"two"}],
            "views":[{"id":"v1","createdAt":0,"updatedAt":0}]}"#;
        let snapshot = decode(text).unwrap();
        assert!(snapshot.document("keep").is_some());
        assert!(snapshot.document("broken").is_none());
        assert!(snapshot.tombstones.is_empty());
        assert_eq!(snapshot.views.len(), 1);
    }

    #[test]
    fn test_unknown_document_kind_round_trips() {
        let text = r#"{"schemaVersion":2,"documents":[
            {"id":"c","kind":"canvas","rev":1,"createdAt":0,"updatedAt":1}]}"#;
        let snapshot = decode(text).unwrap();
        let canvas = snapshot.document("c").unwrap();
        assert_eq!(canvas.kind, DocumentKind::Other("canvas".into()));
        assert!(!canvas.is_container());

        let value: serde_json::Value =
            serde_json::from_str(&encode(&snapshot, 5).unwrap()).unwrap();
        assert_eq!(value["documents"][0]["kind"], "canvas");
    }

    #[test]
    fn test_decode_normalizes_duplicates_and_shadowed_documents() {
        let text = r#"{"schemaVersion":1,
            "documents":[
                {"id":"n1","kind":"leaf","title":"old","rev":1,"createdAt":0,"updatedAt":5},
                {"id":"n1","kind":"leaf","title":"new","rev":2,"createdAt":0,"updatedAt":1},
                {"id":"n2","kind":"leaf","title":"dead","rev":1,"createdAt":0,"updatedAt":1}],
            "tombstones":[{"id":"n2","rev":2,"deletedAt":3}]}"#;
        let snapshot = decode(text).unwrap();
        assert_eq!(snapshot.document("n1").unwrap().title, "new");
        assert!(snapshot.document("n2").is_none());
        assert!(snapshot.is_tombstoned("n2"));
    }
}
