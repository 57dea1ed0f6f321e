//! Retention sweep over old backups.
//!
//! Local copies expire after 30 days, cloud copies after a year; records
//! with no remaining copies are deleted. Cleanup clears path fields only,
//! never `checksum` or `size_bytes`. Finishes with a temp-file sweep of the
//! local base directory.

use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{BackupContext, TaskOutcome};
use crate::catalog::BackupQuery;
use crate::error::Result;
use crate::records::{AlertKind, AlertRecord, AlertSeverity};
use crate::scheduler::TaskKind;

/// Per-action counters reported by the sweep.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CleanupStats {
    pub local_deleted: usize,
    pub local_failed: usize,
    pub r2_deleted: usize,
    pub r2_failed: usize,
    pub b2_deleted: usize,
    pub b2_failed: usize,
    pub records_deleted: usize,
    pub temp_files_deleted: usize,
    pub errors: Vec<String>,
    pub duration_seconds: u64,
}

impl CleanupStats {
    fn total_deleted(&self) -> usize {
        self.local_deleted + self.r2_deleted + self.b2_deleted
    }

    fn total_failed(&self) -> usize {
        self.local_failed + self.r2_failed + self.b2_failed
    }
}

/// Run the daily retention sweep.
pub async fn cleanup_old_backups(
    ctx: &BackupContext,
    task_id: &str,
) -> Result<TaskOutcome<CleanupStats>> {
    let task = TaskKind::Cleanup;
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

    match result {
        Ok(stats) => {
            if stats.total_deleted() > 0 {
                let mut alert = AlertRecord::new(
                    AlertKind::BackupFailure,
                    AlertSeverity::Info,
                    &format!(
                        "Backup cleanup completed: {} old backups removed",
                        stats.total_deleted()
                    ),
                );
                alert.details.insert("stats".into(), json!(stats));
                ctx.monitor.create_alert(alert).await?;
            }
            if stats.total_failed() > 0 {
                let mut alert = AlertRecord::new(
                    AlertKind::BackupFailure,
                    AlertSeverity::Warning,
                    &format!("Backup cleanup had {} failures", stats.total_failed()),
                );
                alert.details.insert("stats".into(), json!(stats));
                ctx.monitor.create_alert(alert).await?;
            }
            Ok(TaskOutcome::Completed(stats))
        }
        Err(e) => {
            let mut alert = AlertRecord::new(
                AlertKind::BackupFailure,
                AlertSeverity::Critical,
                &format!("Backup cleanup task failed: {e}"),
            );
            alert.details.insert("task_id".into(), json!(task_id));
            if let Err(alert_err) = ctx.monitor.create_alert(alert).await {
                warn!(%alert_err, "failed to create cleanup failure alert");
            }
            Err(e)
        }
    }
}

async fn run(ctx: &BackupContext) -> Result<CleanupStats> {
    let started = Instant::now();
    let mut stats = CleanupStats::default();
    let scope = ctx.catalog.bypass_rls();

    // Step 1: local copies past the 30-day window.
    let local_cutoff =
        Utc::now() - Duration::from_std(ctx.settings.local_retention()).unwrap_or(Duration::days(30));
    let old_local = scope
        .list_backups(&BackupQuery {
            created_before: Some(local_cutoff),
            has_local_path: Some(true),
            ..Default::default()
        })
        .await?;
    info!(count = old_local.len(), "local backups past retention");

    let local_storage = ctx.storage.local()?;
    for mut backup in old_local {
        if local_storage.delete(&backup.local_path).await {
            backup.local_path = String::new();
            scope.update_backup(&backup).await?;
            stats.local_deleted += 1;
        } else {
            stats.local_failed += 1;
            stats
                .errors
                .push(format!("local deletion failed for {}", backup.filename));
        }
    }

    // Step 2: cloud copies past the one-year window.
    let cloud_cutoff =
        Utc::now() - Duration::from_std(ctx.settings.cloud_retention()).unwrap_or(Duration::days(365));
    let old_cloud = scope
        .list_backups(&BackupQuery {
            created_before: Some(cloud_cutoff),
            has_any_remote_path: Some(true),
            ..Default::default()
        })
        .await?;
    info!(count = old_cloud.len(), "cloud backups past retention");

    for mut backup in old_cloud {
        if !backup.r2_path.is_empty() {
            match ctx.storage.backend("r2") {
                Ok(backend) if backend.delete(&backup.r2_path).await => {
                    backup.r2_path = String::new();
                    stats.r2_deleted += 1;
                }
                _ => {
                    stats.r2_failed += 1;
                    stats
                        .errors
                        .push(format!("r2 deletion failed for {}", backup.filename));
                }
            }
        }
        if !backup.b2_path.is_empty() {
            match ctx.storage.backend("b2") {
                Ok(backend) if backend.delete(&backup.b2_path).await => {
                    backup.b2_path = String::new();
                    stats.b2_deleted += 1;
                }
                _ => {
                    stats.b2_failed += 1;
                    stats
                        .errors
                        .push(format!("b2 deletion failed for {}", backup.filename));
                }
            }
        }
        scope.update_backup(&backup).await?;
    }

    // Step 3: records with no copies left anywhere.
    let orphaned = scope
        .list_backups(&BackupQuery {
            has_local_path: Some(false),
            has_any_remote_path: Some(false),
            ..Default::default()
        })
        .await?;
    for backup in orphaned {
        scope.delete_backup(backup.id).await?;
        stats.records_deleted += 1;
    }

    // Step 4: stray temp files older than a day in the base directory.
    stats.temp_files_deleted = sweep_temp_files(ctx);

    stats.duration_seconds = started.elapsed().as_secs();
    info!(
        local = stats.local_deleted,
        r2 = stats.r2_deleted,
        b2 = stats.b2_deleted,
        records = stats.records_deleted,
        temp_files = stats.temp_files_deleted,
        "backup cleanup completed"
    );
    Ok(stats)
}

fn is_temp_name(name: &str) -> bool {
    name.ends_with(".tmp") || name.ends_with(".temp") || name.starts_with("test_restore_")
}

fn sweep_temp_files(ctx: &BackupContext) -> usize {
    let mut deleted = 0;
    let entries = match std::fs::read_dir(&ctx.settings.local_path) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(%e, "temp-file sweep could not read base directory");
            return 0;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_temp_name(&name) {
            continue;
        }
        let old_enough = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map(|age| age > StdDuration::from_secs(24 * 3600))
            .unwrap_or(false);
        if !old_enough {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(file = %name, "deleted stray temp file");
                deleted += 1;
            }
            Err(e) => warn!(file = %name, %e, "failed to delete temp file"),
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_patterns_match_known_strays() {
        assert!(is_temp_name("upload.tmp"));
        assert!(is_temp_name("dump.temp"));
        assert!(is_temp_name("test_restore_20250101"));
        assert!(!is_temp_name("backup_full_database_20250101_020000.dump.gz.enc"));
        assert!(!is_temp_name("0000000100000000000000AB.gz"));
    }
}
