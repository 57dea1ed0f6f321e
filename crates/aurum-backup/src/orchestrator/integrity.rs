//! Hourly storage-integrity sweep.
//!
//! Intentionally cheap: existence and size checks only, over at most the
//! 100 most recent successful backups from the last 30 days. Full
//! download-and-checksum verification happens once, right after upload.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{BackupContext, TaskOutcome};
use crate::catalog::BackupQuery;
use crate::error::Result;
use crate::records::{AlertKind, AlertRecord, AlertSeverity, BackupKind, BackupRecord};
use crate::scheduler::TaskKind;

/// Bound on how many backups one hourly run inspects.
const MAX_VERIFICATIONS_PER_RUN: usize = 100;

/// Counters for one sweep.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IntegrityStats {
    pub total_backups_checked: usize,
    pub verified_successfully: usize,
    pub integrity_failures: usize,
    pub missing_files: usize,
    pub size_mismatches: usize,
}

/// Run the hourly existence/size sweep across all storage locations.
pub async fn verify_storage_integrity(
    ctx: &BackupContext,
    task_id: &str,
) -> Result<TaskOutcome<IntegrityStats>> {
    let task = TaskKind::StorageIntegrity;
    let lock = match ctx
        .locks
        .acquire_task_lock(task.name(), task_id, task.lock_ttl())
        .await
    {
        Some(lock) => lock,
        None => return Ok(TaskOutcome::Skipped),
    };

    let result = run(ctx).await;
    lock.release().await;
    result.map(TaskOutcome::Completed)
}

async fn run(ctx: &BackupContext) -> Result<IntegrityStats> {
    let mut stats = IntegrityStats::default();
    let scope = ctx.catalog.bypass_rls();

    let mut query = BackupQuery {
        statuses: vec![
            crate::records::BackupStatus::Completed,
            crate::records::BackupStatus::Verified,
        ],
        created_after: Some(Utc::now() - Duration::days(30)),
        ..Default::default()
    };
    query.limit = Some(MAX_VERIFICATIONS_PER_RUN);
    let backups = scope.list_backups(&query).await?;

    if backups.is_empty() {
        info!("no backups found to verify");
        return Ok(stats);
    }
    info!(count = backups.len(), "verifying storage integrity");
    stats.total_backups_checked = backups.len();

    for mut backup in backups {
        let mut errors: Vec<String> = Vec::new();

        for (name, path) in storage_paths(&backup) {
            let backend = match ctx.storage.backend(name) {
                Ok(backend) => backend,
                Err(_) => {
                    debug!(backend = name, "backend not configured, skipping check");
                    continue;
                }
            };

            if !backend.exists(&path).await {
                errors.push(format!("file missing in {name}: {path}"));
                stats.missing_files += 1;
                continue;
            }

            match backend.get_size(&path).await {
                Some(size) if size == backup.size_bytes => {}
                Some(size) => {
                    errors.push(format!(
                        "size mismatch in {name}: expected {}, got {size}",
                        backup.size_bytes
                    ));
                    stats.size_mismatches += 1;
                }
                None => {
                    errors.push(format!("size unavailable in {name}: {path}"));
                    stats.size_mismatches += 1;
                }
            }
        }

        let passed = errors.is_empty();
        backup.metadata.insert(
            "last_integrity_check".into(),
            json!({
                "timestamp": Utc::now(),
                "status": if passed { "passed" } else { "failed" },
                "errors": errors,
            }),
        );
        scope.update_backup(&backup).await?;

        if passed {
            stats.verified_successfully += 1;
            continue;
        }
        stats.integrity_failures += 1;
        warn!(backup = %backup.id, "storage integrity verification failed");

        let mut alert = AlertRecord::new(
            AlertKind::IntegrityFailure,
            AlertSeverity::Error,
            &format!(
                "Storage integrity verification failed for backup {}",
                backup.filename
            ),
        );
        alert.backup_id = Some(backup.id);
        alert.details.insert(
            "last_integrity_check".into(),
            backup.metadata["last_integrity_check"].clone(),
        );
        ctx.monitor.create_alert(alert).await?;
    }

    if stats.integrity_failures > 0 {
        let mut alert = AlertRecord::new(
            AlertKind::IntegrityFailure,
            AlertSeverity::Warning,
            &format!(
                "Storage integrity sweep found {} failing backup(s) out of {}",
                stats.integrity_failures, stats.total_backups_checked
            ),
        );
        alert.details.insert("stats".into(), json!(stats));
        ctx.monitor.create_alert(alert).await?;
    }

    info!(
        checked = stats.total_backups_checked,
        passed = stats.verified_successfully,
        failed = stats.integrity_failures,
        "storage integrity sweep completed"
    );
    Ok(stats)
}

/// Paths to check, mirroring where each kind keeps its copies. WAL local
/// copies live outside the local backend and are skipped here.
fn storage_paths(backup: &BackupRecord) -> Vec<(&'static str, String)> {
    let mut paths = Vec::new();
    if !backup.local_path.is_empty() && backup.kind != BackupKind::WalArchive {
        paths.push(("local", backup.local_path.clone()));
    }
    if !backup.r2_path.is_empty() {
        paths.push(("r2", backup.r2_path.clone()));
    }
    if !backup.b2_path.is_empty() {
        paths.push(("b2", backup.b2_path.clone()));
    }
    paths
}
