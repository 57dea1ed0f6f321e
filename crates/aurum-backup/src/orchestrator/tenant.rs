//! Per-tenant backup batch.
//!
//! Tenants are processed independently: a held per-tenant lock skips that
//! tenant, and one tenant's failure marks its own record FAILED without
//! aborting the batch.

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
use crate::db::TenantRef;
use crate::error::{BackupError, Result};
use crate::locks::TenantLockOutcome;
use crate::records::{AlertKind, AlertRecord, AlertSeverity, BackupKind, BackupRecord};
use crate::scheduler::TaskKind;
use crate::verify::verify_backup_integrity;

/// Weekly batch over every active tenant. Returns the ids of successful
/// tenant backups (possibly empty).
pub async fn weekly_per_tenant_backup(
    ctx: &BackupContext,
    task_id: &str,
) -> Result<TaskOutcome<Vec<Uuid>>> {
    let tenants = ctx.tenants.active_tenants().await?;
    run_batch(ctx, task_id, tenants).await
}

/// Manual backup of a single tenant.
pub async fn perform_tenant_backup(
    ctx: &BackupContext,
    task_id: &str,
    tenant_id: Uuid,
) -> Result<TaskOutcome<Vec<Uuid>>> {
    let tenant = ctx
        .tenants
        .find_tenant(tenant_id)
        .await?
        .ok_or_else(|| BackupError::NotFound(format!("tenant {tenant_id}")))?;
    run_batch(ctx, task_id, vec![tenant]).await
}

async fn run_batch(
    ctx: &BackupContext,
    task_id: &str,
    tenants: Vec<TenantRef>,
) -> Result<TaskOutcome<Vec<Uuid>>> {
    let task = TaskKind::WeeklyTenantBackup;
    let lock = match ctx
        .locks
        .acquire_task_lock(task.name(), task_id, task.lock_ttl())
        .await
    {
        Some(lock) => lock,
        None => return Ok(TaskOutcome::Skipped),
    };

    info!(tenants = tenants.len(), "starting per-tenant backup batch");
    let mut successful = Vec::new();

    for tenant in &tenants {
        let tenant_lock = match ctx.locks.acquire_tenant_lock(tenant.id, task_id).await {
            TenantLockOutcome::Acquired(guard) => guard,
            TenantLockOutcome::Held(owner) => {
                warn!(
                    tenant = %tenant.id,
                    owner = owner.as_deref().unwrap_or("unknown"),
                    "tenant backup already in progress, skipping"
                );
                continue;
            }
        };

        match backup_one_tenant(ctx, task_id, tenant).await {
            Ok(backup_id) => successful.push(backup_id),
            Err(e) => {
                warn!(tenant = %tenant.id, %e, "tenant backup failed, continuing batch");
            }
        }

        tenant_lock.release().await;
    }

    lock.release().await;
    info!(
        succeeded = successful.len(),
        attempted = tenants.len(),
        "per-tenant backup batch finished"
    );
    Ok(TaskOutcome::Completed(successful))
}

async fn backup_one_tenant(
    ctx: &BackupContext,
    task_id: &str,
    tenant: &TenantRef,
) -> Result<Uuid> {
    let started = Instant::now();
    let base_filename = generate_backup_filename(BackupKind::Tenant, Some(tenant.id), Utc::now());
    let remote_filename = format!("{base_filename}.gz.enc");

    let mut record =
        BackupRecord::new(BackupKind::Tenant, Some(tenant.id), &remote_filename, task_id);
    ctx.catalog.bypass_rls().insert_backup(record.clone()).await?;

    let result = run_one(ctx, &mut record, tenant, &base_filename, started).await;

    if let Err(e) = &result {
        record.mark_failed(elapsed_secs(started), &e.to_string()).ok();
        if let Err(update_err) = ctx.catalog.bypass_rls().update_backup(&record).await {
            warn!(%update_err, "failed to persist FAILED tenant backup record");
        }

        let mut alert = AlertRecord::new(
            AlertKind::BackupFailure,
            AlertSeverity::Error,
            &format!("Tenant backup failed for {}: {e}", tenant.name),
        );
        alert.backup_id = Some(record.id);
        alert.details.insert("tenant_id".into(), json!(tenant.id));
        alert.details.insert("error".into(), json!(e.to_string()));
        if let Err(alert_err) = ctx.monitor.create_alert(alert).await {
            warn!(%alert_err, "failed to create tenant backup alert");
        }
    }

    result.map(|_| record.id)
}

async fn run_one(
    ctx: &BackupContext,
    record: &mut BackupRecord,
    tenant: &TenantRef,
    base_filename: &str,
    started: Instant,
) -> Result<()> {
    let temp = tempfile::tempdir()?;
    let dump_path = temp.path().join(base_filename);

    ctx.dump.tenant_dump(&dump_path, tenant.id).await?;

    let artifact = codec::compress_and_encrypt_file(
        &ctx.key,
        &dump_path,
        Some(&temp.path().join(&record.filename)),
        false,
    )?;

    let (all_succeeded, paths) =
        upload_to_all_storages(ctx, &artifact.path, &record.filename).await;
    if paths.local.is_none() {
        return Err(BackupError::Storage(
            "failed to upload to local storage (minimum requirement)".to_string(),
        ));
    }
    if !all_succeeded {
        warn!(tenant = %tenant.id, "not all storage locations succeeded");
    }

    record.size_bytes = artifact.final_size;
    record.checksum = artifact.checksum.clone();
    record.local_path = paths.local.unwrap_or_default();
    record.r2_path = paths.r2.unwrap_or_default();
    record.b2_path = paths.b2.unwrap_or_default();
    record.compression_ratio = if artifact.original_size > 0 {
        1.0 - artifact.compressed_size as f64 / artifact.original_size as f64
    } else {
        0.0
    };
    record.metadata.insert("tenant_name".into(), json!(tenant.name));
    record
        .metadata
        .insert("original_size_bytes".into(), json!(artifact.original_size));
    record
        .metadata
        .insert("compressed_size_bytes".into(), json!(artifact.compressed_size));
    // Same -Fp flag as the full dump; the format recorded is the one used.
    record.metadata.insert("pg_dump_format".into(), json!("plain"));
    record.mark_completed(elapsed_secs(started))?;
    ctx.catalog.bypass_rls().update_backup(record).await?;
    info!(tenant = %tenant.id, backup = %record.id, "tenant backup completed");

    let report = verify_backup_integrity(&integrity_targets(ctx, record), &record.checksum).await?;
    if report.valid {
        record.mark_verified()?;
        ctx.catalog.bypass_rls().update_backup(record).await?;
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
