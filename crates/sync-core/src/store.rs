//! Local and remote replica stores.
//!
//! The sync cycle talks to two collaborators:
//! - `LocalStore`: the on-device replica, read and applied as whole snapshots
//! - `RemoteStore`: an opaque text blob with an advisory revision tag
//!
//! `FsLocalStore` and `FsRemoteStore` implement both on top of `FileSystem`.

use crate::clock::now_millis;
use crate::codec::{self, CodecError};
use crate::fs::{FileSystem, FsError};
use crate::merge::{compare_documents, compare_schemas, compare_tombstones, compare_views};
use crate::model::{Document, Tombstone, VaultSnapshot};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Local replica file, relative to the vault root.
pub const REPLICA_FILE: &str = ".sync/replica.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Document was deleted: {0}")]
    Deleted(String),

    #[error("Parent of {0} would form a cycle")]
    ParentCycle(String),
}

/// Classified failure talking to the remote replica.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl From<FsError> for TransportError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound(path) => TransportError::NotFound(path),
            FsError::PermissionDenied(path) => TransportError::Unauthorized(path),
            FsError::Io(msg) => TransportError::Network(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Contents of the remote replica.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteBlob {
    /// Serialized snapshot; `None` when nothing was ever pushed
    pub text: Option<String>,
    /// Advisory revision marker (not used for conditional writes)
    pub revision: Option<String>,
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Read a consistent snapshot of all collections.
    async fn read_snapshot(&self) -> Result<VaultSnapshot>;

    /// Apply a snapshot as one atomic transaction.
    ///
    /// Tombstones are upserted first, then tombstoned documents deleted, then
    /// documents, views and schemas upserted.
    async fn apply_snapshot(&self, snapshot: &VaultSnapshot) -> Result<()>;
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn read(&self) -> std::result::Result<RemoteBlob, TransportError>;

    async fn write(&self, text: &str) -> std::result::Result<(), TransportError>;
}

/// Precheck run before any remote call.
#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Connectivity that never reports offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

#[async_trait]
impl Connectivity for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

/// Local replica persisted as a single JSON file.
pub struct FsLocalStore<F: FileSystem> {
    fs: F,
    /// Serializes read-modify-write transactions
    write_lock: Mutex<()>,
}

impl<F: FileSystem> FsLocalStore<F> {
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<VaultSnapshot> {
        if !self.fs.exists(REPLICA_FILE).await? {
            return Ok(VaultSnapshot::new());
        }
        let bytes = self.fs.read(REPLICA_FILE).await?;
        Ok(codec::decode(&String::from_utf8_lossy(&bytes))?)
    }

    async fn save(&self, snapshot: &VaultSnapshot) -> Result<()> {
        let text = codec::encode(snapshot, now_millis())?;
        self.fs.write(REPLICA_FILE, text.as_bytes()).await?;
        Ok(())
    }

    /// Save a locally edited document.
    ///
    /// An existing document gets `rev = stored.rev + 1`; a new one keeps its
    /// own `rev`. `updated_at` is stamped with `now` and never moves backwards.
    pub async fn upsert_document(&self, mut doc: Document, now: i64) -> Result<Document> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.load().await?;

        if snapshot.is_tombstoned(&doc.id) {
            return Err(StoreError::Deleted(doc.id));
        }
        if parent_forms_cycle(&snapshot, &doc) {
            return Err(StoreError::ParentCycle(doc.id));
        }
        match snapshot.documents.get(&doc.id) {
            Some(stored) => {
                doc.rev = stored.rev;
                doc.updated_at = stored.updated_at;
                doc.touch(now);
            }
            None => {
                doc.rev = doc.rev.max(1);
                doc.updated_at = doc.updated_at.max(now);
            }
        }

        snapshot.insert_document(doc.clone());
        self.save(&snapshot).await?;
        debug!("Saved document {} at rev {}", doc.id, doc.rev);
        Ok(doc)
    }

    /// Delete a document by writing a tombstone. Returns `None` if the id is
    /// unknown or already deleted.
    pub async fn delete_document(&self, id: &str, now: i64) -> Result<Option<Tombstone>> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.load().await?;

        let Some(doc) = snapshot.documents.get(id) else {
            return Ok(None);
        };
        let tombstone = doc.tombstone(now);
        snapshot.insert_tombstone(tombstone.clone());
        self.save(&snapshot).await?;
        debug!("Deleted document {} (tombstone rev {})", id, tombstone.rev);
        Ok(Some(tombstone))
    }
}

/// Whether following `doc.parent_id` through `snapshot` leads back to `doc`.
fn parent_forms_cycle(snapshot: &VaultSnapshot, doc: &Document) -> bool {
    let mut visited = HashSet::new();
    let mut next = doc.parent_id.as_deref();
    while let Some(parent) = next {
        if parent == doc.id {
            return true;
        }
        // A loop elsewhere in the replica does not involve this document.
        if !visited.insert(parent) {
            return false;
        }
        next = snapshot
            .documents
            .get(parent)
            .and_then(|p| p.parent_id.as_deref());
    }
    false
}

/// Insert `item` unless the stored entry is strictly newer.
fn upsert_unless_newer<T: Clone>(
    map: &mut BTreeMap<String, T>,
    id: &str,
    item: &T,
    order: impl Fn(&T, &T) -> Ordering,
) {
    if let Some(existing) = map.get(id) {
        if order(existing, item) == Ordering::Greater {
            return;
        }
    }
    map.insert(id.to_string(), item.clone());
}

#[async_trait]
impl<F: FileSystem> LocalStore for FsLocalStore<F> {
    async fn read_snapshot(&self) -> Result<VaultSnapshot> {
        self.load().await
    }

    async fn apply_snapshot(&self, incoming: &VaultSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut current = self.load().await?;
        let before = current.clone();

        for (id, tombstone) in &incoming.tombstones {
            upsert_unless_newer(&mut current.tombstones, id, tombstone, compare_tombstones);
        }

        let tombstones = &current.tombstones;
        current.documents.retain(|id, _| !tombstones.contains_key(id));

        for (id, doc) in &incoming.documents {
            if current.tombstones.contains_key(id) {
                continue;
            }
            upsert_unless_newer(&mut current.documents, id, doc, compare_documents);
        }
        for (id, view) in &incoming.views {
            upsert_unless_newer(&mut current.views, id, view, compare_views);
        }
        for (id, schema) in &incoming.schemas {
            upsert_unless_newer(&mut current.schemas, id, schema, compare_schemas);
        }

        // Unchanged replicas are not rewritten, so file watchers stay quiet.
        if current == before {
            debug!("Local replica unchanged, skipping write");
            return Ok(());
        }
        self.save(&current).await
    }
}

/// Remote replica stored as one blob file.
pub struct FsRemoteStore<F: FileSystem> {
    fs: F,
    path: String,
}

impl<F: FileSystem> FsRemoteStore<F> {
    pub fn new(fs: F, path: impl Into<String>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }
}

fn revision_of(bytes: &[u8]) -> String {
    hex::encode(&Sha256::digest(bytes)[..8])
}

#[async_trait]
impl<F: FileSystem> RemoteStore for FsRemoteStore<F> {
    async fn read(&self) -> std::result::Result<RemoteBlob, TransportError> {
        match self.fs.read(&self.path).await {
            Ok(bytes) => Ok(RemoteBlob {
                revision: Some(revision_of(&bytes)),
                text: Some(String::from_utf8_lossy(&bytes).into_owned()),
            }),
            Err(FsError::NotFound(_)) => Ok(RemoteBlob::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, text: &str) -> std::result::Result<(), TransportError> {
        self.fs.write(&self.path, text.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use crate::model::View;
    use serde_json::json;
    use std::sync::Arc;

    fn doc(id: &str, rev: u64, updated_at: i64, title: &str) -> Document {
        let mut d = Document::leaf(id, title, 0);
        d.rev = rev;
        d.updated_at = updated_at;
        d
    }

    #[tokio::test]
    async fn test_missing_replica_reads_empty() {
        let store = FsLocalStore::new(InMemoryFs::new());
        assert!(store.read_snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_replica_is_an_error() {
        let fs = Arc::new(InMemoryFs::new());
        fs.write(REPLICA_FILE, b"{broken").await.unwrap();
        let store = FsLocalStore::new(Arc::clone(&fs));
        assert!(matches!(
            store.read_snapshot().await,
            Err(StoreError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_deletes_tombstoned_documents() {
        let store = FsLocalStore::new(InMemoryFs::new());
        store
            .apply_snapshot(&VaultSnapshot::new().with_document(doc("n1", 1, 10, "a")))
            .await
            .unwrap();

        let incoming = VaultSnapshot::new().with_tombstone(Tombstone {
            id: "n1".into(),
            rev: 2,
            deleted_at: 20,
        });
        store.apply_snapshot(&incoming).await.unwrap();

        let snapshot = store.read_snapshot().await.unwrap();
        assert!(snapshot.document("n1").is_none());
        assert!(snapshot.is_tombstoned("n1"));
    }

    #[tokio::test]
    async fn test_apply_never_resurrects_within_one_transaction() {
        let store = FsLocalStore::new(InMemoryFs::new());
        // Inconsistent input: both a tombstone and a live document for n1.
        let mut incoming = VaultSnapshot::new().with_tombstone(Tombstone {
            id: "n1".into(),
            rev: 2,
            deleted_at: 20,
        });
        incoming.documents.insert("n1".into(), doc("n1", 3, 30, "zombie"));

        store.apply_snapshot(&incoming).await.unwrap();
        assert!(store.read_snapshot().await.unwrap().document("n1").is_none());
    }

    #[tokio::test]
    async fn test_apply_is_upsert_and_keeps_newer_local_entries() {
        let store = FsLocalStore::new(InMemoryFs::new());
        let seed = VaultSnapshot::new()
            .with_document(doc("keep", 1, 10, "untouched"))
            .with_document(doc("edited", 5, 50, "edited mid-cycle"));
        store.apply_snapshot(&seed).await.unwrap();

        let incoming = VaultSnapshot::new()
            .with_document(doc("edited", 4, 40, "stale merge result"))
            .with_document(doc("new", 1, 60, "from remote"))
            .with_view(View {
                id: "v1".into(),
                name: "Inbox".into(),
                definition: json!({"filter": "inbox"}),
                created_at: 1,
                updated_at: 1,
            });
        store.apply_snapshot(&incoming).await.unwrap();

        let snapshot = store.read_snapshot().await.unwrap();
        assert_eq!(snapshot.documents.len(), 3);
        assert_eq!(snapshot.document("edited").unwrap().title, "edited mid-cycle");
        assert_eq!(snapshot.document("new").unwrap().title, "from remote");
        assert_eq!(snapshot.views["v1"].name, "Inbox");
    }

    #[tokio::test]
    async fn test_apply_without_changes_does_not_rewrite() {
        let fs = Arc::new(InMemoryFs::new());
        let store = FsLocalStore::new(Arc::clone(&fs));
        let snapshot = VaultSnapshot::new().with_document(doc("n1", 1, 10, "a"));
        store.apply_snapshot(&snapshot).await.unwrap();

        let marked = codec::encode(&snapshot, 42).unwrap();
        fs.write(REPLICA_FILE, marked.as_bytes()).await.unwrap();
        store.apply_snapshot(&snapshot).await.unwrap();
        assert_eq!(fs.read(REPLICA_FILE).await.unwrap(), marked.as_bytes());
    }

    #[tokio::test]
    async fn test_upsert_document_bumps_rev() {
        let store = FsLocalStore::new(InMemoryFs::new());
        let created = store
            .upsert_document(Document::leaf("n1", "Draft", 100), 100)
            .await
            .unwrap();
        assert_eq!(created.rev, 1);

        let mut edit = created.clone();
        edit.title = "Final".into();
        let saved = store.upsert_document(edit, 200).await.unwrap();
        assert_eq!(saved.rev, 2);
        assert_eq!(saved.updated_at, 200);

        let stored = store.read_snapshot().await.unwrap();
        assert_eq!(stored.document("n1").unwrap().title, "Final");
    }

    #[tokio::test]
    async fn test_upsert_rejects_self_parent() {
        let store = FsLocalStore::new(InMemoryFs::new());
        let mut doc = Document::leaf("s", "Self", 100);
        doc.parent_id = Some("s".into());

        let err = store.upsert_document(doc, 100).await.unwrap_err();
        assert!(matches!(err, StoreError::ParentCycle(id) if id == "s"));
        assert!(store.read_snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_rejects_parent_loop() {
        let store = FsLocalStore::new(InMemoryFs::new());
        store
            .upsert_document(Document::container("b", "Folder B", 100), 100)
            .await
            .unwrap();
        let mut a = Document::container("a", "Folder A", 100);
        a.parent_id = Some("b".into());
        store.upsert_document(a, 100).await.unwrap();

        let mut b = store.read_snapshot().await.unwrap().document("b").cloned().unwrap();
        b.parent_id = Some("a".into());
        let err = store.upsert_document(b, 200).await.unwrap_err();
        assert!(matches!(err, StoreError::ParentCycle(id) if id == "b"));

        let stored = store.read_snapshot().await.unwrap();
        assert_eq!(stored.document("b").unwrap().parent_id, None);

        // A deeper chain is still fine.
        let mut c = Document::leaf("c", "Note", 300);
        c.parent_id = Some("a".into());
        assert!(store.upsert_document(c, 300).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_document_writes_tombstone() {
        let store = FsLocalStore::new(InMemoryFs::new());
        store
            .upsert_document(Document::leaf("n1", "Doomed", 100), 100)
            .await
            .unwrap();

        let tombstone = store.delete_document("n1", 300).await.unwrap().unwrap();
        assert_eq!(tombstone.rev, 2);
        assert!(store.delete_document("n1", 400).await.unwrap().is_none());

        let err = store
            .upsert_document(Document::leaf("n1", "Again", 500), 500)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Deleted(_)));
    }

    #[tokio::test]
    async fn test_remote_missing_blob_reads_as_empty() {
        let remote = FsRemoteStore::new(InMemoryFs::new(), "vault.json");
        assert_eq!(remote.read().await.unwrap(), RemoteBlob::default());
    }

    #[tokio::test]
    async fn test_remote_revision_tracks_content() {
        let remote = FsRemoteStore::new(InMemoryFs::new(), "vault.json");
        remote.write("{\"a\":1}").await.unwrap();
        let first = remote.read().await.unwrap();
        remote.write("{\"a\":2}").await.unwrap();
        let second = remote.read().await.unwrap();

        assert_eq!(second.text.as_deref(), Some("{\"a\":2}"));
        assert!(first.revision.is_some());
        assert_ne!(first.revision, second.revision);
    }

    #[tokio::test]
    async fn test_remote_errors_are_classified() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = FsRemoteStore::new(Arc::clone(&fs), "vault.json");

        fs.set_failure(Some(FsError::PermissionDenied("vault.json".into())));
        assert!(matches!(
            remote.read().await,
            Err(TransportError::Unauthorized(_))
        ));

        fs.set_failure(Some(FsError::Io("connection reset".into())));
        assert_eq!(
            remote.write("{}").await,
            Err(TransportError::Network("connection reset".into()))
        );
    }
}
