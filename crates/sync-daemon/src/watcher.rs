//! Watches the local replica file for changes made outside the daemon.
//!
//! Uses notify-debouncer-mini on the vault's `.sync` directory and forwards
//! only events for the replica file.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use sync_core::store::REPLICA_FILE;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// File event from the watcher.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Path relative to vault root
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// Watcher for `.sync/replica.json`.
pub struct FileWatcher {
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

/// Last seen mtime per file, to drop events that did not change anything
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

impl FileWatcher {
    /// Start watching. Uses a 200ms debounce so a save is reported once.
    pub fn new(vault_path: PathBuf) -> Result<Self> {
        // Canonicalize to resolve symlinks (macOS /var -> /private/var for FSEvents).
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);
        let sync_dir = vault_path.join(".sync");
        std::fs::create_dir_all(&sync_dir)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) =
                            Self::process_event(&event, &vault_path, &mtime_cache)
                        {
                            if event_tx.send(file_event).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&sync_dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            _debouncer: debouncer,
            event_rx,
        })
    }

    fn process_event(
        event: &DebouncedEvent,
        vault_path: &Path,
        mtime_cache: &MtimeCache,
    ) -> Option<FileEvent> {
        let path = &event.path;
        let relative = path.strip_prefix(vault_path).ok()?;
        if !is_replica_path(relative) {
            return None;
        }

        let kind = if path.exists() {
            FileEventKind::Modified
        } else {
            FileEventKind::Deleted
        };

        let relative_path = relative.to_path_buf();
        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        match kind {
            FileEventKind::Modified => {
                let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
                if cache.get(&relative_path) == Some(&mtime) {
                    return None;
                }
                cache.insert(relative_path, mtime);
            }
            FileEventKind::Deleted => {
                cache.remove(&relative_path);
            }
        }

        debug!("Replica event: {:?}", kind);
        Some(FileEvent {
            path: REPLICA_FILE.to_string(),
            kind,
        })
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }
}

/// Whether a vault-relative path is the local replica file.
pub fn is_replica_path(relative: &Path) -> bool {
    relative == Path::new(REPLICA_FILE)
}
