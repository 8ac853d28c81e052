//! Task index persistence and incremental reindexing.

use super::derive::{derive_rows, source_hash, DerivationContext};
use super::diff::{diff, TaskIndexDiff};
use crate::fs::{FileSystem, FsError};
use crate::model::{Document, TaskIndexRow, TaskPriority, TaskStatus, VaultSnapshot};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Task index file, relative to the vault root.
pub const TASK_INDEX_FILE: &str = ".sync/tasks.json";

#[derive(Debug, Error)]
pub enum TaskIndexError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Task not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, TaskIndexError>;

#[async_trait]
pub trait TaskIndexStore: Send + Sync {
    async fn rows_for_document(&self, document_id: &str) -> Result<Vec<TaskIndexRow>>;

    async fn row(&self, task_id: &str) -> Result<Option<TaskIndexRow>>;

    async fn all_rows(&self) -> Result<Vec<TaskIndexRow>>;

    async fn put_row(&self, row: TaskIndexRow) -> Result<()>;

    /// Apply every delete and upsert for one document in a single write.
    async fn apply_document(&self, document_id: &str, changes: &TaskIndexDiff) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskIndexFile {
    #[serde(default)]
    rows: Vec<TaskIndexRow>,
}

/// Task index persisted as one JSON file.
pub struct FsTaskIndex<F: FileSystem> {
    fs: F,
    write_lock: Mutex<()>,
}

impl<F: FileSystem> FsTaskIndex<F> {
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, TaskIndexRow>> {
        if !self.fs.exists(TASK_INDEX_FILE).await? {
            return Ok(BTreeMap::new());
        }
        let bytes = self.fs.read(TASK_INDEX_FILE).await?;
        let file: TaskIndexFile = serde_json::from_slice(&bytes)
            .map_err(|e| TaskIndexError::Serialization(e.to_string()))?;
        Ok(file
            .rows
            .into_iter()
            .map(|r| (r.task_id.clone(), r))
            .collect())
    }

    async fn save(&self, rows: BTreeMap<String, TaskIndexRow>) -> Result<()> {
        let file = TaskIndexFile {
            rows: rows.into_values().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| TaskIndexError::Serialization(e.to_string()))?;
        self.fs.write(TASK_INDEX_FILE, &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl<F: FileSystem> TaskIndexStore for FsTaskIndex<F> {
    async fn rows_for_document(&self, document_id: &str) -> Result<Vec<TaskIndexRow>> {
        Ok(self
            .load()
            .await?
            .into_values()
            .filter(|r| r.source_document_id == document_id)
            .collect())
    }

    async fn row(&self, task_id: &str) -> Result<Option<TaskIndexRow>> {
        Ok(self.load().await?.remove(task_id))
    }

    async fn all_rows(&self) -> Result<Vec<TaskIndexRow>> {
        Ok(self.load().await?.into_values().collect())
    }

    async fn put_row(&self, row: TaskIndexRow) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut rows = self.load().await?;
        rows.insert(row.task_id.clone(), row);
        self.save(rows).await
    }

    async fn apply_document(&self, document_id: &str, changes: &TaskIndexDiff) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut rows = self.load().await?;
        for id in &changes.to_delete_ids {
            if rows.get(id).is_some_and(|r| r.source_document_id == document_id) {
                rows.remove(id);
            }
        }
        for row in &changes.to_upsert {
            rows.insert(row.task_id.clone(), row.clone());
        }
        self.save(rows).await
    }
}

/// Direct edit of a task row that bypasses the source document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOverride {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub is_next_action: Option<bool>,
}

/// Counts from a batch reindex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReindexSummary {
    pub upserted: usize,
    pub deleted: usize,
}

impl ReindexSummary {
    fn add(&mut self, changes: &TaskIndexDiff) {
        self.upserted += changes.to_upsert.len();
        self.deleted += changes.to_delete_ids.len();
    }
}

/// Keeps a `TaskIndexStore` in step with document content.
///
/// Every read-derive-apply sequence runs under one lock, so reindexing from a
/// local edit and from a sync cycle never interleave.
pub struct TaskIndexer<S: TaskIndexStore> {
    store: S,
    lock: Mutex<()>,
}

impl<S: TaskIndexStore> TaskIndexer<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn reindex_document(
        &self,
        doc: &Document,
        ctx: &DerivationContext<'_>,
        now: i64,
    ) -> Result<TaskIndexDiff> {
        let _guard = self.lock.lock().await;
        self.reindex_locked(doc, ctx, now).await
    }

    async fn reindex_locked(
        &self,
        doc: &Document,
        ctx: &DerivationContext<'_>,
        now: i64,
    ) -> Result<TaskIndexDiff> {
        let existing = self.store.rows_for_document(&doc.id).await?;
        let derived = derive_rows(doc, &existing, ctx);
        let changes = diff(&existing, derived, now);
        if !changes.is_empty() {
            debug!(
                "Reindexed {}: {} upserted, {} deleted",
                doc.id,
                changes.to_upsert.len(),
                changes.to_delete_ids.len()
            );
            self.store.apply_document(&doc.id, &changes).await?;
        }
        Ok(changes)
    }

    /// Drop every row owned by a deleted document.
    pub async fn remove_document(&self, document_id: &str) -> Result<usize> {
        let _guard = self.lock.lock().await;
        self.remove_locked(document_id).await
    }

    async fn remove_locked(&self, document_id: &str) -> Result<usize> {
        let existing = self.store.rows_for_document(document_id).await?;
        let changes = TaskIndexDiff {
            to_upsert: Vec::new(),
            to_delete_ids: existing.into_iter().map(|r| r.task_id).collect(),
        };
        self.store.apply_document(document_id, &changes).await?;
        Ok(changes.to_delete_ids.len())
    }

    /// Reindex the given documents against `snapshot`.
    ///
    /// Ids in `updated` that are no longer live in `snapshot` are treated as
    /// removed.
    pub async fn reindex_changes(
        &self,
        snapshot: &VaultSnapshot,
        updated: &[String],
        removed: &[String],
        now: i64,
    ) -> Result<ReindexSummary> {
        let _guard = self.lock.lock().await;
        let ctx = DerivationContext::from_snapshot(snapshot);
        let mut summary = ReindexSummary::default();

        for id in updated {
            match snapshot.document(id) {
                Some(doc) => summary.add(&self.reindex_locked(doc, &ctx, now).await?),
                None => summary.deleted += self.remove_locked(id).await?,
            }
        }
        for id in removed {
            summary.deleted += self.remove_locked(id).await?;
        }
        Ok(summary)
    }

    /// Reindex every live document and drop rows of documents that are gone.
    pub async fn reindex_all(&self, snapshot: &VaultSnapshot, now: i64) -> Result<ReindexSummary> {
        let indexed: BTreeSet<String> = self
            .store
            .all_rows()
            .await?
            .into_iter()
            .map(|r| r.source_document_id)
            .collect();
        let updated: Vec<String> = snapshot.documents.keys().cloned().collect();
        let removed: Vec<String> = indexed
            .into_iter()
            .filter(|id| !snapshot.documents.contains_key(id))
            .collect();

        let summary = self.reindex_changes(snapshot, &updated, &removed, now).await?;
        info!(
            "Task index rebuilt: {} upserted, {} deleted",
            summary.upserted, summary.deleted
        );
        Ok(summary)
    }

    /// Apply an out-of-band edit to one row.
    pub async fn update_task(
        &self,
        task_id: &str,
        edit: TaskOverride,
        now: i64,
    ) -> Result<TaskIndexRow> {
        let _guard = self.lock.lock().await;
        let mut row = self
            .store
            .row(task_id)
            .await?
            .ok_or_else(|| TaskIndexError::NotFound(task_id.to_string()))?;

        if let Some(status) = edit.status {
            row.status = status;
        }
        if let Some(priority) = edit.priority {
            row.priority = Some(priority);
        }
        if let Some(next) = edit.is_next_action {
            row.is_next_action = next;
        }
        row.source_hash = source_hash(&row);
        row.updated_at = now;

        self.store.put_row(row.clone()).await?;
        debug!("Task {} updated out of band", task_id);
        Ok(row)
    }
}
