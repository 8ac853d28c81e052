//! Replicated vault data model.
//!
//! A vault snapshot is the tuple (documents, tombstones, views, schemas)
//! exchanged between the local replica and the remote blob. Documents and
//! tombstones are versioned by a per-document `rev` counter; views and schemas
//! only carry timestamps.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Wire format version written into every encoded snapshot.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Content block type that carries a task.
pub const TASK_BLOCK_KIND: &str = "task";

/// Property on a container document naming the schema it is classified by.
pub const SCHEMA_PROP: &str = "schemaId";

/// Whether a document groups other documents or holds content.
///
/// Kinds introduced by newer clients are kept verbatim in `Other` so they
/// round-trip through this replica unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DocumentKind {
    Container,
    Leaf,
    Other(String),
}

impl DocumentKind {
    pub fn as_str(&self) -> &str {
        match self {
            DocumentKind::Container => "container",
            DocumentKind::Leaf => "leaf",
            DocumentKind::Other(kind) => kind,
        }
    }
}

impl From<String> for DocumentKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "container" => DocumentKind::Container,
            "leaf" => DocumentKind::Leaf,
            _ => DocumentKind::Other(kind),
        }
    }
}

impl From<DocumentKind> for String {
    fn from(kind: DocumentKind) -> Self {
        match kind {
            DocumentKind::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

/// A typed block of leaf document content.
///
/// `kind` stays a free-form string so block types introduced by newer clients
/// survive a round trip through older replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlock {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
}

impl ContentBlock {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            text: text.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Convenience constructor for a task block.
    pub fn task(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, TASK_BLOCK_KIND, text)
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn is_task(&self) -> bool {
        self.kind == TASK_BLOCK_KIND
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        self.attrs.get(key).and_then(Value::as_bool)
    }
}

/// The primary replicated unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub kind: DocumentKind,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub favorite: bool,
    /// Opaque key/value properties.
    #[serde(default)]
    pub props: BTreeMap<String, Value>,
    /// Ordered content, leaf documents only.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    pub rev: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    fn new(id: impl Into<String>, kind: DocumentKind, title: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            parent_id: None,
            tags: BTreeSet::new(),
            favorite: false,
            props: BTreeMap::new(),
            content: Vec::new(),
            rev: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn leaf(id: impl Into<String>, title: impl Into<String>, now: i64) -> Self {
        Self::new(id, DocumentKind::Leaf, title, now)
    }

    pub fn container(id: impl Into<String>, title: impl Into<String>, now: i64) -> Self {
        Self::new(id, DocumentKind::Container, title, now)
    }

    /// Record a local mutation: bump `rev` and stamp `updated_at`.
    ///
    /// `updated_at` never moves backwards even if the wall clock does.
    pub fn touch(&mut self, now: i64) {
        self.rev += 1;
        self.updated_at = self.updated_at.max(now);
    }

    /// Tombstone superseding this document.
    pub fn tombstone(&self, now: i64) -> Tombstone {
        Tombstone {
            id: self.id.clone(),
            rev: self.rev + 1,
            deleted_at: now,
        }
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn is_container(&self) -> bool {
        self.kind == DocumentKind::Container
    }
}

/// Permanent deletion marker for a document id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub id: String,
    pub rev: u64,
    pub deleted_at: i64,
}

/// Saved view definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct View {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub definition: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Container-level schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Explicit classification tag ("project", "area"). Older schemas lack it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub fields: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// The replicated state of a vault.
///
/// Collections are keyed by id so that iteration order, equality and encoding
/// are deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VaultSnapshot {
    pub documents: BTreeMap<String, Document>,
    pub tombstones: BTreeMap<String, Tombstone>,
    pub views: BTreeMap<String, View>,
    pub schemas: BTreeMap<String, Schema>,
}

impl VaultSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
            && self.tombstones.is_empty()
            && self.views.is_empty()
            && self.schemas.is_empty()
    }

    pub fn with_document(mut self, doc: Document) -> Self {
        self.insert_document(doc);
        self
    }

    pub fn with_tombstone(mut self, tombstone: Tombstone) -> Self {
        self.insert_tombstone(tombstone);
        self
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schemas.insert(schema.id.clone(), schema);
        self
    }

    pub fn with_view(mut self, view: View) -> Self {
        self.views.insert(view.id.clone(), view);
        self
    }

    pub fn insert_document(&mut self, doc: Document) {
        self.documents.insert(doc.id.clone(), doc);
    }

    /// Insert a tombstone and drop the live document it shadows.
    pub fn insert_tombstone(&mut self, tombstone: Tombstone) {
        self.documents.remove(&tombstone.id);
        self.tombstones.insert(tombstone.id.clone(), tombstone);
    }

    pub fn document(&self, id: &str) -> Option<&Document> {
        self.documents.get(id)
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains_key(id)
    }
}

/// Workflow state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    #[default]
    Todo,
    Doing,
    Waiting,
    Done,
}

impl TaskStatus {
    /// Lenient parse of a block-declared status.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "todo" | "open" => Some(Self::Todo),
            "doing" | "in_progress" | "in-progress" | "started" => Some(Self::Doing),
            "waiting" | "blocked" => Some(Self::Waiting),
            "done" | "complete" | "completed" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl TaskPriority {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" | "p3" => Some(Self::Low),
            "medium" | "normal" | "p2" => Some(Self::Medium),
            "high" | "urgent" | "p1" => Some(Self::High),
            _ => None,
        }
    }
}

/// Values a task block declared at its last derivation.
///
/// Comparing these against the block's current attributes tells whether the
/// document changed a field or whether a persisted row value is an
/// out-of-band override that must be kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredTaskState {
    #[serde(default)]
    pub checked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<bool>,
}

/// Derived projection of one task-bearing content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIndexRow {
    pub task_id: String,
    pub source_document_id: String,
    pub block_id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_day: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_day: Option<NaiveDate>,
    #[serde(default)]
    pub is_next_action: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
    #[serde(default)]
    pub declared: DeclaredTaskState,
    pub source_hash: String,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_bumps_rev_and_never_rewinds_updated_at() {
        let mut doc = Document::leaf("n1", "Note", 1_000);
        doc.touch(2_000);
        assert_eq!(doc.rev, 2);
        assert_eq!(doc.updated_at, 2_000);

        doc.touch(500);
        assert_eq!(doc.rev, 3);
        assert_eq!(doc.updated_at, 2_000);
    }

    #[test]
    fn test_tombstone_supersedes_document_rev() {
        let doc = Document::leaf("n1", "Note", 1_000);
        let tomb = doc.tombstone(3_000);
        assert_eq!(tomb.rev, doc.rev + 1);
        assert_eq!(tomb.deleted_at, 3_000);
    }

    #[test]
    fn test_insert_tombstone_removes_live_document() {
        let doc = Document::leaf("n1", "Note", 1_000);
        let tomb = doc.tombstone(2_000);
        let snapshot = VaultSnapshot::new().with_document(doc).with_tombstone(tomb);

        assert!(snapshot.document("n1").is_none());
        assert!(snapshot.is_tombstoned("n1"));
    }

    #[test]
    fn test_document_wire_format_is_camel_case() {
        let mut doc = Document::leaf("n1", "Note", 1_000);
        doc.parent_id = Some("p1".into());
        doc.content.push(ContentBlock::task("b1", "Buy milk").with_attr("checked", true));

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["parentId"], "p1");
        assert_eq!(json["updatedAt"], 1_000);
        assert_eq!(json["kind"], "leaf");
        assert_eq!(json["content"][0]["type"], "task");
        assert_eq!(json["content"][0]["attrs"]["checked"], true);
    }

    #[test]
    fn test_unknown_block_kind_survives_round_trip() {
        let json = r#"{"id":"b9","type":"kanban","text":"x","attrs":{"lane":2}}"#;
        let block: ContentBlock = serde_json::from_str(json).unwrap();
        assert!(!block.is_task());
        let back = serde_json::to_string(&block).unwrap();
        assert!(back.contains("\"type\":\"kanban\""));
        assert!(back.contains("\"lane\":2"));
    }

    #[test]
    fn test_status_parse_is_lenient() {
        assert_eq!(TaskStatus::parse(" In-Progress "), Some(TaskStatus::Doing));
        assert_eq!(TaskStatus::parse("completed"), Some(TaskStatus::Done));
        assert_eq!(TaskStatus::parse("someday"), None);
        assert_eq!(TaskPriority::parse("P1"), Some(TaskPriority::High));
    }
}
