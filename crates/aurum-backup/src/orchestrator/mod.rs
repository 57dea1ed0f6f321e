//! Task pipelines over the catalog, storage, dump, lock, and monitor
//! services.
//!
//! Every pipeline follows the same skeleton: acquire the task-run lock (or
//! return immediately), create IN_PROGRESS records, do the work inside a
//! per-run temp directory, move records to a terminal status, alert on
//! failure, release the lock. Pipelines are single-attempt; callers apply
//! the task's retry policy with [`run_with_retries`].

pub mod cleanup;
pub mod configuration;
pub mod full;
pub mod integrity;
pub mod restore;
pub mod runbook;
pub mod tenant;
pub mod test_restore;
pub mod wal;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{CatalogHandle, CatalogStore};
use crate::codec::EncryptionKey;
use crate::config::BackupSettings;
use crate::db::{DatabaseAdmin, DbTenantDirectory, PgAdmin, TenantDirectory};
use crate::dump::{DumpDriver, PgDumpDriver};
use crate::error::{BackupError, Result};
use crate::locks::{LockService, RedisLockKv};
use crate::monitor::Monitor;
use crate::notify::{IdentityDirectory, Notifier};
use crate::records::{BackupKind, BackupRecord};
use crate::scheduler::TaskKind;
use crate::storage::{StorageBackend, StorageSet};

/// Host-supplied collaborators the engine consumes through narrow
/// interfaces.
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogStore>,
    pub notifier: Arc<dyn Notifier>,
    pub directory: Arc<dyn IdentityDirectory>,
}

/// Process-lifetime services shared by all pipelines.
#[derive(Clone)]
pub struct BackupContext {
    pub settings: BackupSettings,
    pub key: EncryptionKey,
    pub storage: StorageSet,
    pub catalog: CatalogHandle,
    pub locks: LockService,
    pub dump: Arc<dyn DumpDriver>,
    pub admin: Arc<dyn DatabaseAdmin>,
    pub tenants: Arc<dyn TenantDirectory>,
    pub monitor: Arc<Monitor>,
    pub http: reqwest::Client,
}

impl BackupContext {
    /// Production wiring from settings plus the host's collaborators.
    pub async fn initialize(
        settings: BackupSettings,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let key = EncryptionKey::from_base64(&settings.encryption_key)?;
        let storage = StorageSet::from_settings(&settings).await?;
        let admin: Arc<dyn DatabaseAdmin> =
            Arc::new(PgAdmin::connect(settings.database.clone()).await?);
        let locks = LockService::new(Arc::new(RedisLockKv::connect(&settings.redis_url).await?));
        let dump: Arc<dyn DumpDriver> = Arc::new(PgDumpDriver::new(
            settings.database.clone(),
            admin.clone(),
            settings.rls_force_tables.clone(),
            settings.tenant_tables.clone(),
        ));
        let tenants: Arc<dyn TenantDirectory> = Arc::new(DbTenantDirectory::new(admin.clone()));
        let catalog = CatalogHandle::new(collaborators.catalog);
        let monitor = Arc::new(Monitor::new(
            catalog.clone(),
            collaborators.notifier,
            collaborators.directory,
            settings.alert_webhook_url.clone(),
            settings.thresholds.clone(),
        ));

        Ok(Self {
            settings,
            key,
            storage,
            catalog,
            locks,
            dump,
            admin,
            tenants,
            monitor,
            http: reqwest::Client::new(),
        })
    }
}

/// Result of a pipeline invocation that may be skipped by lock contention.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    /// Another instance holds the task-run lock; not an error.
    Skipped,
}

impl<T> TaskOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            TaskOutcome::Completed(value) => Some(value),
            TaskOutcome::Skipped => None,
        }
    }
}

/// Artifact filename grammar:
/// `backup_{kind}[_{tenant}]_{YYYYMMDD_HHMMSS}.dump` for database dumps,
/// `backup_configuration_{YYYYMMDD_HHMMSS}` for the configuration archive.
pub fn generate_backup_filename(
    kind: BackupKind,
    tenant_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> String {
    let timestamp = now.format("%Y%m%d_%H%M%S");
    match (kind, tenant_id) {
        (BackupKind::Configuration, _) => format!("backup_configuration_{timestamp}"),
        (_, Some(tenant)) => format!(
            "backup_{}_{tenant}_{timestamp}.dump",
            kind.filename_token()
        ),
        (_, None) => format!("backup_{}_{timestamp}.dump", kind.filename_token()),
    }
}

/// Where each copy of an artifact landed.
#[derive(Debug, Default, Clone)]
pub struct StoragePaths {
    pub local: Option<String>,
    pub r2: Option<String>,
    pub b2: Option<String>,
}

/// Fan an artifact out to every configured backend. Returns whether all
/// uploads succeeded along with the per-backend paths.
pub async fn upload_to_all_storages(
    ctx: &BackupContext,
    local_path: &Path,
    remote_path: &str,
) -> (bool, StoragePaths) {
    let mut paths = StoragePaths::default();
    let mut all_succeeded = true;

    for backend in ctx.storage.iter() {
        let ok = backend.upload(local_path, remote_path).await;
        if !ok {
            error!(backend = backend.name(), remote_path, "upload failed");
            all_succeeded = false;
            continue;
        }
        let slot = match backend.name() {
            "local" => &mut paths.local,
            "r2" => &mut paths.r2,
            "b2" => &mut paths.b2,
            other => {
                warn!(backend = other, "upload to unrecognized backend ignored in paths");
                continue;
            }
        };
        *slot = Some(remote_path.to_string());
    }

    (all_succeeded, paths)
}

/// Pair each backend that holds a copy of `record` with the copy's path.
pub fn integrity_targets(
    ctx: &BackupContext,
    record: &BackupRecord,
) -> Vec<(Arc<dyn StorageBackend>, String)> {
    let mut targets = Vec::new();
    for (name, path) in [
        ("local", &record.local_path),
        ("r2", &record.r2_path),
        ("b2", &record.b2_path),
    ] {
        if path.is_empty() {
            continue;
        }
        if let Ok(backend) = ctx.storage.backend(name) {
            targets.push((backend, path.clone()));
        }
    }
    targets
}

/// Download a backup artifact, preferring R2, then B2, then local storage.
/// Returns the name of the backend that served the copy.
pub async fn download_backup_artifact(
    ctx: &BackupContext,
    record: &BackupRecord,
    dest: &Path,
) -> Result<String> {
    for (name, path) in [
        ("r2", &record.r2_path),
        ("b2", &record.b2_path),
        ("local", &record.local_path),
    ] {
        if path.is_empty() {
            continue;
        }
        let backend = match ctx.storage.backend(name) {
            Ok(backend) => backend,
            Err(_) => continue,
        };
        if backend.download(path, dest).await {
            info!(backend = name, path = %path, "downloaded backup artifact");
            return Ok(name.to_string());
        }
        warn!(backend = name, path = %path, "download failed, trying next location");
    }
    Err(BackupError::Storage(format!(
        "failed to download {} from any storage location",
        record.filename
    )))
}

/// Apply a task's retry policy around a pipeline invocation.
pub async fn run_with_retries<T, F, Fut>(task: TaskKind, mut attempt_fn: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = task.retry_policy();
    let mut attempt = 0;
    loop {
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries => {
                warn!(
                    task = task.name(),
                    attempt,
                    delay_secs = policy.delay.as_secs(),
                    %e,
                    "task attempt failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn elapsed_secs(started: Instant) -> u64 {
    started.elapsed().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn filename_grammar_matches_kinds() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 2, 0, 5).unwrap();
        assert_eq!(
            generate_backup_filename(BackupKind::FullDatabase, None, now),
            "backup_full_database_20250304_020005.dump"
        );

        let tenant = Uuid::nil();
        assert_eq!(
            generate_backup_filename(BackupKind::Tenant, Some(tenant), now),
            format!("backup_tenant_{tenant}_20250304_020005.dump")
        );

        assert_eq!(
            generate_backup_filename(BackupKind::Configuration, None, now),
            "backup_configuration_20250304_020005"
        );
    }

    #[tokio::test]
    async fn retries_exhaust_then_fail() {
        let mut attempts_seen = Vec::new();
        let result: Result<()> = run_with_retries(TaskKind::TestRestore, |attempt| {
            attempts_seen.push(attempt);
            async { Err(BackupError::Storage("down".into())) }
        })
        .await;
        assert!(result.is_err());
        // TestRestore has no retries: exactly one attempt.
        assert_eq!(attempts_seen, vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_recover_from_transient_failures() {
        let result = run_with_retries(TaskKind::WalArchive, |attempt| async move {
            if attempt < 1 {
                Err(BackupError::Storage("transient".into()))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 1);
    }
}
