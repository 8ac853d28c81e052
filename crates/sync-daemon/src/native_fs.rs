//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use sync_core::fs::{FileSystem, FsError, Result};
use tokio::fs;

/// Native filesystem rooted at a directory.
#[derive(Debug, Clone)]
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

fn map_io(path: &str, err: io::Error) -> FsError {
    match err.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        io::ErrorKind::PermissionDenied => FsError::PermissionDenied(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, err)),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    /// Writes go to a sibling temp file which is then renamed over the target.
    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(path, e))?;
        }

        let file_name = full_path
            .file_name()
            .ok_or_else(|| FsError::Io(format!("{}: not a file path", path)))?
            .to_string_lossy()
            .into_owned();
        let tmp_path = full_path.with_file_name(format!(".{}.tmp", file_name));

        fs::write(&tmp_path, content)
            .await
            .map_err(|e| map_io(path, e))?;
        if let Err(e) = fs::rename(&tmp_path, &full_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(map_io(path, e));
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| map_io(path, e))
    }
}
