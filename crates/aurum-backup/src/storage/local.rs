//! Local filesystem storage backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sysinfo::Disks;
use tokio::fs;
use tracing::{debug, error, info, warn};

use super::{StorageBackend, StorageUsage};
use crate::error::Result;

/// Filesystem backend rooted at a configured base directory.
#[derive(Debug)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create the backend, creating the base directory if needed.
    pub fn new(base_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_path)?;
        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, remote_path: &str) -> PathBuf {
        self.base_path.join(remote_path.trim_start_matches('/'))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &str {
        "local"
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> bool {
        let dest = self.full_path(remote_path);
        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(remote_path, %e, "local upload failed creating parent directory");
                return false;
            }
        }
        match fs::copy(local_path, &dest).await {
            Ok(bytes) => {
                info!(remote_path, bytes, "uploaded to local storage");
                true
            }
            Err(e) => {
                error!(remote_path, %e, "local upload failed");
                false
            }
        }
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> bool {
        let source = self.full_path(remote_path);
        if let Some(parent) = local_path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(remote_path, %e, "local download failed creating parent directory");
                return false;
            }
        }
        match fs::copy(&source, local_path).await {
            Ok(bytes) => {
                info!(remote_path, bytes, "downloaded from local storage");
                true
            }
            Err(e) => {
                error!(remote_path, %e, "local download failed");
                false
            }
        }
    }

    async fn exists(&self, remote_path: &str) -> bool {
        fs::try_exists(self.full_path(remote_path)).await.unwrap_or(false)
    }

    async fn delete(&self, remote_path: &str) -> bool {
        let path = self.full_path(remote_path);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(remote_path, "deleted from local storage");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(remote_path, "delete of missing local file treated as success");
                true
            }
            Err(e) => {
                error!(remote_path, %e, "local delete failed");
                false
            }
        }
    }

    async fn get_size(&self, remote_path: &str) -> Option<u64> {
        fs::metadata(self.full_path(remote_path)).await.ok().map(|m| m.len())
    }

    async fn get_storage_usage(&self) -> Option<StorageUsage> {
        let base = self.base_path.canonicalize().unwrap_or_else(|_| self.base_path.clone());
        let disks = Disks::new_with_refreshed_list();

        // Pick the disk with the longest mount point that contains the base
        // directory.
        let disk = disks
            .list()
            .iter()
            .filter(|d| base.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;

        let total_bytes = disk.total_space();
        let available_bytes = disk.available_space();
        if total_bytes == 0 {
            warn!("local disk reports zero capacity");
            return None;
        }
        Some(StorageUsage {
            total_bytes,
            used_bytes: total_bytes.saturating_sub(available_bytes),
            available_bytes,
        })
    }
}
