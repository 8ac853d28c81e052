//! Reachability check for the remote blob location.

use async_trait::async_trait;
use std::path::PathBuf;
use sync_core::store::Connectivity;
use tokio::fs;

/// Treats the remote as online while its directory is reachable.
///
/// Covers network mounts and synced folders that disappear when offline.
#[derive(Debug, Clone)]
pub struct DirectoryReachability {
    dir: PathBuf,
}

impl DirectoryReachability {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl Connectivity for DirectoryReachability {
    async fn is_online(&self) -> bool {
        fs::metadata(&self.dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reachability_follows_directory_presence() {
        let temp_dir = TempDir::new().unwrap();
        let remote_dir = temp_dir.path().join("remote");
        let reachability = DirectoryReachability::new(remote_dir.clone());

        assert!(!reachability.is_online().await);
        std::fs::create_dir_all(&remote_dir).unwrap();
        assert!(reachability.is_online().await);
    }
}
