//! FileSystem trait abstraction for the file-backed stores.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in sync-daemon) - Uses tokio::fs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Platform-independent filesystem abstraction.
///
/// Paths are relative to the implementation's root.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Replace file contents (creates parent directories if needed).
    ///
    /// A reader never observes a partially written file.
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// In-memory filesystem for testing
#[derive(Default)]
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    /// When set, every operation fails with this error
    failure: Mutex<Option<FsError>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `error` (or succeed again with `None`).
    pub fn set_failure(&self, error: Option<FsError>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    fn check(&self) -> Result<()> {
        match &*self.failure.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.check()?;
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        self.check()?;
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.insert(path, content.to_vec());
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check()?;
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        Ok(files.contains_key(&path))
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows sharing a filesystem between several stores in tests
#[async_trait]
impl<T: FileSystem + Send + Sync> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write("/.sync/replica.json", b"hello world").await.unwrap();

        let content = fs.read(".sync/replica.json").await.unwrap();
        assert_eq!(content, b"hello world");

        assert!(fs.exists(".sync/replica.json").await.unwrap());
        assert!(!fs.exists("nonexistent.txt").await.unwrap());
        assert_eq!(
            fs.read("nonexistent.txt").await.unwrap_err(),
            FsError::NotFound("nonexistent.txt".into())
        );
    }

    #[tokio::test]
    async fn test_inmemory_fs_injected_failure() {
        let fs = InMemoryFs::new();
        fs.write("a.json", b"{}").await.unwrap();

        fs.set_failure(Some(FsError::PermissionDenied("a.json".into())));
        assert!(matches!(
            fs.read("a.json").await,
            Err(FsError::PermissionDenied(_))
        ));
        assert!(fs.write("a.json", b"[]").await.is_err());

        fs.set_failure(None);
        assert_eq!(fs.read("a.json").await.unwrap(), b"{}");
    }
}
