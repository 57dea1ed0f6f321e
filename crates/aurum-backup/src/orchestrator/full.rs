//! Daily full-database backup pipeline.
//!
//! pg_dump → gzip(9) → AES-256-GCM → fan-out to local/R2/B2 → integrity
//! verification. The local upload is the minimum redundancy requirement;
//! missing cloud copies degrade to warnings.

use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    elapsed_secs, generate_backup_filename, integrity_targets, upload_to_all_storages,
    BackupContext, TaskOutcome,
};
use crate::codec;
use crate::error::{BackupError, Result};
use crate::records::{AlertKind, AlertRecord, AlertSeverity, BackupKind, BackupRecord};
use crate::scheduler::TaskKind;
use crate::verify::verify_backup_integrity;

/// Run the daily full-database backup. Returns the backup id, or `Skipped`
/// when another instance already holds the task-run lock.
pub async fn daily_full_database_backup(
    ctx: &BackupContext,
    task_id: &str,
    initiated_by: Option<&str>,
) -> Result<TaskOutcome<Uuid>> {
    let task = TaskKind::DailyFullBackup;
    let lock = match ctx
        .locks
        .acquire_task_lock(task.name(), task_id, task.lock_ttl())
        .await
    {
        Some(lock) => lock,
        None => return Ok(TaskOutcome::Skipped),
    };

    info!("starting daily full database backup");
    let started = Instant::now();

    let base_filename = generate_backup_filename(BackupKind::FullDatabase, None, Utc::now());
    let remote_filename = format!("{base_filename}.gz.enc");
    let mut record = BackupRecord::new(BackupKind::FullDatabase, None, &remote_filename, task_id);
    record.created_by = initiated_by.map(str::to_string);
    ctx.catalog.bypass_rls().insert_backup(record.clone()).await?;
    info!(backup = %record.id, "created backup record");

    let result = run(ctx, &mut record, &base_filename, started).await;

    if let Err(e) = &result {
        record.mark_failed(elapsed_secs(started), &e.to_string()).ok();
        if let Err(update_err) = ctx.catalog.bypass_rls().update_backup(&record).await {
            warn!(%update_err, "failed to persist FAILED backup record");
        }

        let mut alert = AlertRecord::new(
            AlertKind::BackupFailure,
            AlertSeverity::Critical,
            &format!("Daily full database backup failed: {e}"),
        );
        alert.backup_id = Some(record.id);
        alert.details.insert("error".into(), json!(e.to_string()));
        alert.details.insert("task_id".into(), json!(task_id));
        if let Err(alert_err) = ctx.monitor.create_alert(alert).await {
            warn!(%alert_err, "failed to create backup failure alert");
        }
    }

    lock.release().await;
    result.map(|_| TaskOutcome::Completed(record.id))
}

async fn run(
    ctx: &BackupContext,
    record: &mut BackupRecord,
    base_filename: &str,
    started: Instant,
) -> Result<()> {
    let temp = tempfile::tempdir()?;
    let dump_path = temp.path().join(base_filename);

    ctx.dump.full_dump(&dump_path).await?;
    let original_size = std::fs::metadata(&dump_path)?.len();
    info!(bytes = original_size, "pg_dump finished");

    let artifact = codec::compress_and_encrypt_file(
        &ctx.key,
        &dump_path,
        Some(&temp.path().join(&record.filename)),
        false,
    )?;
    let compression_ratio = if artifact.original_size > 0 {
        1.0 - artifact.compressed_size as f64 / artifact.original_size as f64
    } else {
        0.0
    };
    info!(
        compressed = artifact.compressed_size,
        encrypted = artifact.final_size,
        ratio = format!("{:.1}%", compression_ratio * 100.0),
        checksum = %artifact.checksum,
        "compressed and encrypted dump"
    );

    let (all_succeeded, paths) =
        upload_to_all_storages(ctx, &artifact.path, &record.filename).await;
    if paths.local.is_none() {
        return Err(BackupError::Storage(
            "failed to upload to local storage (minimum requirement)".to_string(),
        ));
    }
    if !all_succeeded {
        warn!("not all storage locations succeeded, continuing with reduced redundancy");
    }

    record.size_bytes = artifact.final_size;
    record.checksum = artifact.checksum.clone();
    record.local_path = paths.local.unwrap_or_default();
    record.r2_path = paths.r2.unwrap_or_default();
    record.b2_path = paths.b2.unwrap_or_default();
    record.compression_ratio = compression_ratio;
    record
        .metadata
        .insert("database".into(), json!(ctx.settings.database.name));
    record
        .metadata
        .insert("original_size_bytes".into(), json!(artifact.original_size));
    record
        .metadata
        .insert("compressed_size_bytes".into(), json!(artifact.compressed_size));
    // The flag actually passed to pg_dump is -Fp.
    record.metadata.insert("pg_dump_format".into(), json!("plain"));
    record.mark_completed(elapsed_secs(started))?;
    ctx.catalog.bypass_rls().update_backup(record).await?;
    info!(backup = %record.id, duration = ?record.duration_seconds, "backup completed");

    let report = verify_backup_integrity(&integrity_targets(ctx, record), &record.checksum).await?;
    if report.valid {
        record.mark_verified()?;
        ctx.catalog.bypass_rls().update_backup(record).await?;
        info!(backup = %record.id, "backup integrity verified");
    } else {
        let mut alert = AlertRecord::new(
            AlertKind::IntegrityFailure,
            AlertSeverity::Warning,
            &format!(
                "Backup integrity verification failed for {}",
                record.filename
            ),
        );
        alert.backup_id = Some(record.id);
        alert.details.insert("report".into(), report.details());
        ctx.monitor.create_alert(alert).await?;
    }

    ctx.monitor.monitor_backup_completion(record).await?;
    Ok(())
}
