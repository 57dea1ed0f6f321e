//! Restore operation driven by a restore record.
//!
//! FULL replaces everything (`pg_restore --clean`), MERGE restores on top of
//! existing data, PITR is declared but unimplemented. Downloads prefer R2,
//! then B2, then local storage.

use std::time::Instant;

use tracing::{info, warn};
use uuid::Uuid;

use super::{download_backup_artifact, elapsed_secs, BackupContext};
use crate::codec;
use crate::error::{BackupError, Result};
use crate::records::{RestoreMode, RestoreRecord};

/// Execute a previously created restore record. Returns the restore id.
pub async fn perform_restore_operation(ctx: &BackupContext, restore_id: Uuid) -> Result<Uuid> {
    let scope = ctx.catalog.bypass_rls();
    let mut restore = scope
        .get_restore(restore_id)
        .await?
        .ok_or_else(|| BackupError::Catalog(format!("restore {restore_id} not found")))?;
    let backup = scope.require_backup(restore.backup_id).await?;

    info!(
        restore = %restore.id,
        backup = %backup.filename,
        mode = ?restore.mode,
        "starting restore operation"
    );

    if !backup.status.is_successful() {
        return Err(BackupError::InvalidState(format!(
            "backup {} is not restorable (status {:?})",
            backup.id, backup.status
        )));
    }

    let started = Instant::now();
    let result = run(ctx, &restore, &backup.filename, &backup).await;

    match &result {
        Ok(()) => {
            restore.mark_completed(elapsed_secs(started))?;
            scope.update_restore(&restore).await?;
            info!(restore = %restore.id, duration = ?restore.duration_seconds, "restore completed");
        }
        Err(e) => {
            restore.mark_failed(elapsed_secs(started), &e.to_string()).ok();
            if let Err(update_err) = scope.update_restore(&restore).await {
                warn!(%update_err, "failed to persist FAILED restore record");
            }
            if let Err(alert_err) = ctx.monitor.monitor_restore_completion(&restore).await {
                warn!(%alert_err, "failed to create restore failure alert");
            }
        }
    }

    result.map(|_| restore.id)
}

async fn run(
    ctx: &BackupContext,
    restore: &RestoreRecord,
    filename: &str,
    backup: &crate::records::BackupRecord,
) -> Result<()> {
    let temp = tempfile::tempdir()?;
    let encrypted_path = temp.path().join(filename);

    let source = download_backup_artifact(ctx, backup, &encrypted_path).await?;
    info!(source, "downloaded backup for restore");

    let decrypted_path = temp
        .path()
        .join(filename.trim_end_matches(".gz.enc"));
    codec::decrypt_and_decompress_file(&ctx.key, &encrypted_path, Some(&decrypted_path), false)?;

    match restore.mode {
        RestoreMode::Full => {
            warn!("FULL restore mode: existing data will be replaced");
            ctx.dump.restore(&decrypted_path, true, None).await
        }
        RestoreMode::Merge => {
            info!("MERGE restore mode: existing data preserved");
            ctx.dump.restore(&decrypted_path, false, None).await
        }
        RestoreMode::Pitr => Err(BackupError::Unsupported(
            "Point-in-time recovery".to_string(),
        )),
    }
}
