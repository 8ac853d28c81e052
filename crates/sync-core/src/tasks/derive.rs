//! Deriving task rows from document content.

use super::classify::{classify_schema, SchemaClass};
use crate::model::{
    ContentBlock, DeclaredTaskState, Document, Schema, TaskIndexRow, TaskPriority, TaskStatus,
    VaultSnapshot, SCHEMA_PROP,
};

use chrono::NaiveDate;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Block attributes read during derivation.
pub const ATTR_CHECKED: &str = "checked";
pub const ATTR_STATUS: &str = "status";
pub const ATTR_PRIORITY: &str = "priority";
pub const ATTR_SCHEDULED: &str = "scheduled";
pub const ATTR_DUE: &str = "due";
pub const ATTR_NEXT_ACTION: &str = "nextAction";

/// Document properties that pin a project or area explicitly.
pub const PROJECT_PROP: &str = "projectId";
pub const AREA_PROP: &str = "areaId";

/// Read access to the documents and schemas needed to resolve ancestry.
pub struct DerivationContext<'a> {
    documents: &'a BTreeMap<String, Document>,
    schemas: &'a BTreeMap<String, Schema>,
}

impl<'a> DerivationContext<'a> {
    pub fn new(
        documents: &'a BTreeMap<String, Document>,
        schemas: &'a BTreeMap<String, Schema>,
    ) -> Self {
        Self { documents, schemas }
    }

    pub fn from_snapshot(snapshot: &'a VaultSnapshot) -> Self {
        Self::new(&snapshot.documents, &snapshot.schemas)
    }

    /// Explicit property first, then the nearest ancestor container whose
    /// schema classifies as `class`.
    fn resolve(&self, doc: &Document, prop: &str, class: SchemaClass) -> Option<String> {
        if let Some(explicit) = doc.prop_str(prop) {
            return Some(explicit.to_string());
        }

        let mut visited = HashSet::from([doc.id.as_str()]);
        let mut next = doc.parent_id.as_deref();
        while let Some(id) = next {
            if !visited.insert(id) {
                debug!("Parent cycle at {} while resolving {}", id, doc.id);
                return None;
            }
            let ancestor = self.documents.get(id)?;
            if ancestor.is_container() && self.container_class(ancestor) == Some(class) {
                return Some(ancestor.id.clone());
            }
            next = ancestor.parent_id.as_deref();
        }
        None
    }

    fn container_class(&self, container: &Document) -> Option<SchemaClass> {
        let schema_id = container.prop_str(SCHEMA_PROP)?;
        classify_schema(self.schemas.get(schema_id)?)
    }
}

/// Stable id of the task carried by `block_id` in `document_id`.
pub fn task_id(document_id: &str, block_id: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", document_id, block_id).as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(32);
    id
}

/// Hash over every row field except `source_hash` and `updated_at`.
pub fn source_hash(row: &TaskIndexRow) -> String {
    let material = json!({
        "taskId": row.task_id,
        "sourceDocumentId": row.source_document_id,
        "blockId": row.block_id,
        "title": row.title,
        "status": row.status,
        "priority": row.priority,
        "scheduledDay": row.scheduled_day,
        "dueDay": row.due_day,
        "isNextAction": row.is_next_action,
        "projectId": row.project_id,
        "areaId": row.area_id,
        "declared": row.declared,
    });
    hex::encode(Sha256::digest(material.to_string().as_bytes()))
}

/// Derive one row per task block of `doc`.
///
/// `existing` holds the persisted rows for this document. A persisted
/// status, priority or next-action value is kept unless the block changed
/// its own declaration of that field since the row was derived; a checked
/// block is always `done`.
pub fn derive_rows(
    doc: &Document,
    existing: &[TaskIndexRow],
    ctx: &DerivationContext<'_>,
) -> Vec<TaskIndexRow> {
    if doc.is_container() {
        return Vec::new();
    }

    let persisted: HashMap<&str, &TaskIndexRow> =
        existing.iter().map(|r| (r.task_id.as_str(), r)).collect();
    let project_id = ctx.resolve(doc, PROJECT_PROP, SchemaClass::Project);
    let area_id = ctx.resolve(doc, AREA_PROP, SchemaClass::Area);

    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for block in doc.content.iter().filter(|b| b.is_task()) {
        if !seen.insert(block.id.as_str()) {
            debug!("Duplicate task block {} in {}, keeping first", block.id, doc.id);
            continue;
        }

        let id = task_id(&doc.id, &block.id);
        let declared = declared_state(block);
        let previous = persisted.get(id.as_str()).copied();

        let mut row = TaskIndexRow {
            source_document_id: doc.id.clone(),
            block_id: block.id.clone(),
            title: block_title(block),
            status: resolve_status(&declared, previous),
            priority: resolve_priority(&declared, previous),
            scheduled_day: block_day(block, ATTR_SCHEDULED),
            due_day: block_day(block, ATTR_DUE),
            is_next_action: resolve_next_action(&declared, previous),
            project_id: project_id.clone(),
            area_id: area_id.clone(),
            declared,
            source_hash: String::new(),
            updated_at: previous.map_or(doc.updated_at, |p| p.updated_at),
            task_id: id,
        };
        row.source_hash = source_hash(&row);
        rows.push(row);
    }
    rows
}

fn declared_state(block: &ContentBlock) -> DeclaredTaskState {
    DeclaredTaskState {
        checked: block.attr_bool(ATTR_CHECKED).unwrap_or(false),
        status: block.attr_str(ATTR_STATUS).and_then(TaskStatus::parse),
        priority: block.attr_str(ATTR_PRIORITY).and_then(TaskPriority::parse),
        next_action: block.attr_bool(ATTR_NEXT_ACTION),
    }
}

fn resolve_status(declared: &DeclaredTaskState, previous: Option<&TaskIndexRow>) -> TaskStatus {
    if declared.checked {
        return TaskStatus::Done;
    }
    match previous {
        None => declared.status.unwrap_or_default(),
        // Unchecked since last derivation: the block reopened the task.
        Some(row) if row.declared.checked => declared.status.unwrap_or_default(),
        Some(row) if row.declared.status != declared.status => {
            declared.status.unwrap_or(row.status)
        }
        Some(row) => row.status,
    }
}

fn resolve_priority(
    declared: &DeclaredTaskState,
    previous: Option<&TaskIndexRow>,
) -> Option<TaskPriority> {
    match previous {
        None => declared.priority,
        Some(row) if row.declared.priority == declared.priority => row.priority,
        Some(row) => declared.priority.or(row.priority),
    }
}

fn resolve_next_action(declared: &DeclaredTaskState, previous: Option<&TaskIndexRow>) -> bool {
    match previous {
        None => declared.next_action.unwrap_or(false),
        Some(row) if row.declared.next_action == declared.next_action => row.is_next_action,
        Some(row) => declared.next_action.unwrap_or(row.is_next_action),
    }
}

fn block_title(block: &ContentBlock) -> String {
    block.text.lines().next().unwrap_or("").trim().to_string()
}

fn block_day(block: &ContentBlock, key: &str) -> Option<NaiveDate> {
    let raw = block.attr_str(key)?;
    // Accept full timestamps by keeping the date part.
    let day = raw.trim().get(..10).unwrap_or(raw.trim());
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentBlock;

    fn project_schema() -> Schema {
        Schema {
            id: "schema-projects".into(),
            name: "Projects".into(),
            kind: None,
            version: 1,
            fields: json!([]),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn vault() -> VaultSnapshot {
        let mut project = Document::container("p1", "Launch", 0);
        project.props.insert(SCHEMA_PROP.into(), json!("schema-projects"));

        let mut folder = Document::container("f1", "Notes", 0);
        folder.parent_id = Some("p1".into());

        let mut note = Document::leaf("n1", "Plan", 10);
        note.parent_id = Some("f1".into());
        note.content = vec![
            ContentBlock::new("b0", "paragraph", "intro"),
            ContentBlock::task("b1", "Write brief\nwith details")
                .with_attr(ATTR_PRIORITY, "high")
                .with_attr(ATTR_DUE, "2026-03-01"),
            ContentBlock::task("b2", "Ship it").with_attr(ATTR_CHECKED, true),
        ];

        VaultSnapshot::new()
            .with_schema(project_schema())
            .with_document(project)
            .with_document(folder)
            .with_document(note)
    }

    #[test]
    fn test_task_id_is_stable_and_distinct() {
        assert_eq!(task_id("n1", "b1"), task_id("n1", "b1"));
        assert_ne!(task_id("n1", "b1"), task_id("n1", "b2"));
        assert_eq!(task_id("n1", "b1").len(), 32);
    }

    #[test]
    fn test_derives_only_task_blocks() {
        let snapshot = vault();
        let ctx = DerivationContext::from_snapshot(&snapshot);
        let rows = derive_rows(snapshot.document("n1").unwrap(), &[], &ctx);

        assert_eq!(rows.len(), 2);
        let first = &rows[0];
        assert_eq!(first.title, "Write brief");
        assert_eq!(first.status, TaskStatus::Todo);
        assert_eq!(first.priority, Some(TaskPriority::High));
        assert_eq!(first.due_day, NaiveDate::from_ymd_opt(2026, 3, 1));
        assert_eq!(rows[1].status, TaskStatus::Done);
    }

    #[test]
    fn test_project_resolved_through_ancestors() {
        let snapshot = vault();
        let ctx = DerivationContext::from_snapshot(&snapshot);
        let rows = derive_rows(snapshot.document("n1").unwrap(), &[], &ctx);
        assert_eq!(rows[0].project_id.as_deref(), Some("p1"));
        assert_eq!(rows[0].area_id, None);
    }

    #[test]
    fn test_explicit_project_prop_wins() {
        let mut snapshot = vault();
        let mut note = snapshot.document("n1").unwrap().clone();
        note.props.insert(PROJECT_PROP.into(), json!("p-explicit"));
        snapshot.insert_document(note);

        let ctx = DerivationContext::from_snapshot(&snapshot);
        let rows = derive_rows(snapshot.document("n1").unwrap(), &[], &ctx);
        assert_eq!(rows[0].project_id.as_deref(), Some("p-explicit"));
    }

    #[test]
    fn test_parent_cycle_does_not_hang() {
        let mut a = Document::container("a", "A", 0);
        a.parent_id = Some("b".into());
        let mut b = Document::container("b", "B", 0);
        b.parent_id = Some("a".into());
        let mut note = Document::leaf("n", "N", 0);
        note.parent_id = Some("a".into());
        note.content.push(ContentBlock::task("t", "x"));
        let snapshot = VaultSnapshot::new()
            .with_document(a)
            .with_document(b)
            .with_document(note);

        let ctx = DerivationContext::from_snapshot(&snapshot);
        let rows = derive_rows(snapshot.document("n").unwrap(), &[], &ctx);
        assert_eq!(rows[0].project_id, None);
    }

    #[test]
    fn test_persisted_override_survives_unchanged_block() {
        let snapshot = vault();
        let ctx = DerivationContext::from_snapshot(&snapshot);
        let doc = snapshot.document("n1").unwrap();

        let mut persisted = derive_rows(doc, &[], &ctx);
        persisted[0].status = TaskStatus::Doing;
        persisted[0].priority = Some(TaskPriority::Low);

        let rows = derive_rows(doc, &persisted, &ctx);
        assert_eq!(rows[0].status, TaskStatus::Doing);
        assert_eq!(rows[0].priority, Some(TaskPriority::Low));
    }

    #[test]
    fn test_changed_declaration_replaces_override() {
        let snapshot = vault();
        let ctx = DerivationContext::from_snapshot(&snapshot);
        let mut doc = snapshot.document("n1").unwrap().clone();

        let mut persisted = derive_rows(&doc, &[], &ctx);
        persisted[0].priority = Some(TaskPriority::Low);
        persisted[0].status = TaskStatus::Doing;

        doc.content[1] = doc.content[1]
            .clone()
            .with_attr(ATTR_PRIORITY, "medium")
            .with_attr(ATTR_STATUS, "waiting");
        let rows = derive_rows(&doc, &persisted, &ctx);
        assert_eq!(rows[0].priority, Some(TaskPriority::Medium));
        assert_eq!(rows[0].status, TaskStatus::Waiting);
    }

    #[test]
    fn test_checked_block_forces_done_over_override() {
        let snapshot = vault();
        let ctx = DerivationContext::from_snapshot(&snapshot);
        let mut doc = snapshot.document("n1").unwrap().clone();

        let mut persisted = derive_rows(&doc, &[], &ctx);
        persisted[1].status = TaskStatus::Doing;
        let rows = derive_rows(&doc, &persisted, &ctx);
        assert_eq!(rows[1].status, TaskStatus::Done);

        // Unchecking reopens the task.
        doc.content[2] = doc.content[2].clone().with_attr(ATTR_CHECKED, false);
        let reopened = derive_rows(&doc, &rows, &ctx);
        assert_eq!(reopened[1].status, TaskStatus::Todo);
    }

    #[test]
    fn test_source_hash_ignores_updated_at() {
        let snapshot = vault();
        let ctx = DerivationContext::from_snapshot(&snapshot);
        let mut row = derive_rows(snapshot.document("n1").unwrap(), &[], &ctx).remove(0);
        let hash = row.source_hash.clone();

        row.updated_at += 1_000;
        assert_eq!(source_hash(&row), hash);
        row.title.push('!');
        assert_ne!(source_hash(&row), hash);
    }
}
