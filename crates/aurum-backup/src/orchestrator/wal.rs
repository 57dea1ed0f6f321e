//! Continuous WAL archiving.
//!
//! Completed WAL segments (24-hex-char names) are compressed in place, the
//! compressed file stays on disk as the local copy, and the artifact is
//! uploaded to both cloud backends under `wal/`. At least one cloud copy is
//! required; the raw 16 MiB segment is removed once the compressed copy is
//! safe. Segments are not re-encrypted: they only ever live in the remote
//! buckets, which carry server-side protection.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use super::{elapsed_secs, BackupContext, TaskOutcome};
use crate::catalog::BackupQuery;
use crate::codec::{calculate_checksum, compress_file, ChecksumAlgorithm};
use crate::error::{BackupError, Result};
use crate::records::{AlertKind, AlertRecord, AlertSeverity, BackupKind, BackupRecord};
use crate::scheduler::TaskKind;

static WAL_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{24}$").unwrap());

/// Archive new WAL segments. Returns the number archived.
pub async fn continuous_wal_archiving(
    ctx: &BackupContext,
    task_id: &str,
) -> Result<TaskOutcome<usize>> {
    let task = TaskKind::WalArchive;
    let lock = match ctx
        .locks
        .acquire_task_lock(task.name(), task_id, task.lock_ttl())
        .await
    {
        Some(lock) => lock,
        None => return Ok(TaskOutcome::Skipped),
    };

    let result = run(ctx, task_id).await;
    lock.release().await;

    if let Err(e) = &result {
        let mut alert = AlertRecord::new(
            AlertKind::BackupFailure,
            AlertSeverity::Error,
            &format!("Continuous WAL archiving task failed: {e}"),
        );
        alert.details.insert("task_id".into(), json!(task_id));
        if let Err(alert_err) = ctx.monitor.create_alert(alert).await {
            warn!(%alert_err, "failed to create WAL archiving alert");
        }
    }

    result.map(TaskOutcome::Completed)
}

async fn run(ctx: &BackupContext, task_id: &str) -> Result<usize> {
    let wal_dir = &ctx.settings.wal_archive_dir;
    if !wal_dir.is_dir() {
        warn!(
            dir = %wal_dir.display(),
            "WAL archive directory not found; check archive_mode and archive_command"
        );
        return Ok(0);
    }

    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(wal_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !WAL_NAME.is_match(&name) {
            continue;
        }
        let remote_filename = format!("{name}.gz");
        let already_archived = ctx
            .catalog
            .bypass_rls()
            .backup_exists(BackupKind::WalArchive, &remote_filename)
            .await?;
        if !already_archived {
            candidates.push(entry.path());
        }
    }

    if candidates.is_empty() {
        info!("no new WAL files to archive");
        cleanup_old_wal_archives(ctx).await;
        return Ok(0);
    }
    info!(count = candidates.len(), "found WAL files to archive");

    let mut archived = 0;
    for wal_path in candidates {
        match archive_one(ctx, task_id, &wal_path).await {
            Ok(()) => archived += 1,
            Err(e) => {
                let name = wal_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                warn!(wal = %name, %e, "WAL archiving failed, continuing with next file");
                let mut alert = AlertRecord::new(
                    AlertKind::BackupFailure,
                    AlertSeverity::Error,
                    &format!("WAL archiving failed for {name}: {e}"),
                );
                alert.details.insert("wal_filename".into(), json!(name));
                alert.details.insert("task_id".into(), json!(task_id));
                if let Err(alert_err) = ctx.monitor.create_alert(alert).await {
                    warn!(%alert_err, "failed to create WAL failure alert");
                }
            }
        }
    }

    info!(archived, "continuous WAL archiving completed");
    cleanup_old_wal_archives(ctx).await;
    Ok(archived)
}

async fn archive_one(ctx: &BackupContext, task_id: &str, wal_path: &Path) -> Result<()> {
    let started = Instant::now();
    let wal_filename = wal_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| BackupError::NotFound(wal_path.display().to_string()))?;
    let remote_filename = format!("{wal_filename}.gz");

    let mut record = BackupRecord::new(BackupKind::WalArchive, None, &remote_filename, task_id);
    ctx.catalog.bypass_rls().insert_backup(record.clone()).await?;

    let result = archive_inner(ctx, &mut record, wal_path, &wal_filename, started).await;
    if let Err(e) = &result {
        record.mark_failed(elapsed_secs(started), &e.to_string()).ok();
        if let Err(update_err) = ctx.catalog.bypass_rls().update_backup(&record).await {
            warn!(%update_err, "failed to persist FAILED WAL record");
        }
    }
    result
}

async fn archive_inner(
    ctx: &BackupContext,
    record: &mut BackupRecord,
    wal_path: &Path,
    wal_filename: &str,
    started: Instant,
) -> Result<()> {
    // Compress next to the original; the .gz stays as the local copy.
    let compressed_path = PathBuf::from(format!("{}.gz", wal_path.display()));
    let (compressed_path, original_size, final_size) =
        compress_file(wal_path, Some(&compressed_path))?;
    let checksum = calculate_checksum(&compressed_path, ChecksumAlgorithm::Sha256)?;
    let compression_ratio = if original_size > 0 {
        1.0 - final_size as f64 / original_size as f64
    } else {
        0.0
    };
    info!(
        wal = wal_filename,
        original = original_size,
        compressed = final_size,
        "compressed WAL segment"
    );

    // Cloud fan-out only; local storage is skipped for WAL segments.
    let remote_path = format!("wal/{}", record.filename);
    let mut r2_path = String::new();
    let mut b2_path = String::new();
    for (name, slot) in [("r2", &mut r2_path), ("b2", &mut b2_path)] {
        match ctx.storage.backend(name) {
            Ok(backend) => {
                if backend.upload(&compressed_path, &remote_path).await {
                    *slot = remote_path.clone();
                } else {
                    warn!(backend = name, wal = wal_filename, "WAL upload failed");
                }
            }
            Err(_) => warn!(backend = name, "backend not configured, skipping WAL upload"),
        }
    }
    if r2_path.is_empty() && b2_path.is_empty() {
        return Err(BackupError::Storage(
            "failed to upload WAL segment to any cloud storage location".to_string(),
        ));
    }

    record.size_bytes = final_size;
    record.checksum = checksum;
    record.local_path = record.filename.clone();
    record.r2_path = r2_path;
    record.b2_path = b2_path;
    record.compression_ratio = compression_ratio;
    record
        .metadata
        .insert("wal_filename".into(), json!(wal_filename));
    record
        .metadata
        .insert("original_size_bytes".into(), json!(original_size));
    record
        .metadata
        .insert("compressed_size_bytes".into(), json!(final_size));
    record.metadata.insert(
        "pg_wal_archive_dir".into(),
        json!(ctx.settings.wal_archive_dir.display().to_string()),
    );
    record
        .metadata
        .insert("kept_compressed_locally".into(), json!(true));
    record.mark_completed(elapsed_secs(started))?;
    ctx.catalog.bypass_rls().update_backup(record).await?;

    // Drop the raw segment; PostgreSQL cleans up stragglers if this fails.
    if let Err(e) = std::fs::remove_file(wal_path) {
        warn!(wal = wal_filename, %e, "failed to remove uncompressed WAL segment");
    }

    record.mark_verified()?;
    ctx.catalog.bypass_rls().update_backup(record).await?;
    info!(wal = wal_filename, backup = %record.id, "WAL segment archived");
    Ok(())
}

/// Delete WAL archives (records and cloud objects) older than the 30-day
/// retention window.
pub async fn cleanup_old_wal_archives(ctx: &BackupContext) {
    let cutoff = Utc::now() - Duration::days(30);
    let query = BackupQuery {
        kind: Some(BackupKind::WalArchive),
        created_before: Some(cutoff),
        ..Default::default()
    };

    let old_archives = match ctx.catalog.bypass_rls().list_backups(&query).await {
        Ok(archives) => archives,
        Err(e) => {
            warn!(%e, "WAL archive cleanup failed listing records");
            return;
        }
    };
    if old_archives.is_empty() {
        return;
    }
    info!(count = old_archives.len(), "cleaning up old WAL archives");

    for backup in old_archives {
        for (name, path) in [("r2", &backup.r2_path), ("b2", &backup.b2_path)] {
            if path.is_empty() {
                continue;
            }
            if let Ok(backend) = ctx.storage.backend(name) {
                if !backend.delete(path).await {
                    warn!(backend = name, path = %path, "failed to delete old WAL object");
                }
            }
        }
        if let Err(e) = ctx.catalog.bypass_rls().delete_backup(backup.id).await {
            warn!(backup = %backup.id, %e, "failed to delete WAL record");
        }
    }
}
