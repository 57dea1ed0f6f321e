//! Storage backend abstraction over the three artifact locations.
//!
//! Backends convert transient failures into `false`/`None` and log them; the
//! orchestrator decides whether reduced redundancy is acceptable. Only
//! configuration problems surface as errors, at construction time.

pub mod local;
pub mod s3;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BackupSettings;
use crate::error::{BackupError, Result};

/// Capacity report for a backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StorageUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

impl StorageUsage {
    /// Used fraction in [0, 1]; zero-capacity reports count as full.
    pub fn usage_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }
}

/// Uniform contract over the local filesystem and the two object stores.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Symbolic backend name (`local`, `r2`, `b2`).
    fn name(&self) -> &str;

    /// Copy a local file to `remote_path`, creating parents on demand.
    async fn upload(&self, local_path: &Path, remote_path: &str) -> bool;

    /// Fetch `remote_path` into a local file, creating parent directories.
    async fn download(&self, remote_path: &str, local_path: &Path) -> bool;

    async fn exists(&self, remote_path: &str) -> bool;

    /// Delete an object. Deleting a missing object is success.
    async fn delete(&self, remote_path: &str) -> bool;

    async fn get_size(&self, remote_path: &str) -> Option<u64>;

    /// Capacity report, when the backend can produce one.
    async fn get_storage_usage(&self) -> Option<StorageUsage>;
}

/// The configured backend set, addressable by case-insensitive name.
#[derive(Clone)]
pub struct StorageSet {
    backends: Vec<Arc<dyn StorageBackend>>,
}

impl StorageSet {
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>) -> Self {
        Self { backends }
    }

    /// Build the backend set from settings: local storage always, R2 and B2
    /// when their credentials are configured.
    pub async fn from_settings(settings: &BackupSettings) -> Result<Self> {
        let mut backends: Vec<Arc<dyn StorageBackend>> =
            vec![Arc::new(local::LocalStorage::new(&settings.local_path)?)];
        if let Some(r2) = &settings.r2 {
            backends.push(Arc::new(s3::S3CompatibleStorage::r2(r2).await));
        }
        if let Some(b2) = &settings.b2 {
            backends.push(Arc::new(s3::S3CompatibleStorage::b2(b2).await));
        }
        Ok(Self { backends })
    }

    /// Look up a backend by symbolic name.
    pub fn backend(&self, name: &str) -> Result<Arc<dyn StorageBackend>> {
        self.backends
            .iter()
            .find(|b| b.name().eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| BackupError::UnknownBackend(name.to_string()))
    }

    pub fn local(&self) -> Result<Arc<dyn StorageBackend>> {
        self.backend("local")
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn StorageBackend>> {
        self.backends.iter()
    }
}
