//! Monthly automated test restore.
//!
//! Picks a random recent full backup, restores it into a throwaway
//! database, runs structural integrity queries against the copy, records
//! the outcome, and always drops the throwaway database.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::{download_backup_artifact, elapsed_secs, BackupContext, TaskOutcome};
use crate::catalog::BackupQuery;
use crate::codec;
use crate::db::{self, DatabaseAdmin};
use crate::error::{BackupError, Result};
use crate::records::{AlertKind, AlertRecord, AlertSeverity, BackupKind, RestoreMode, RestoreRecord};
use crate::scheduler::TaskKind;

/// Run the monthly test restore. Returns the restore record id.
pub async fn automated_test_restore(
    ctx: &BackupContext,
    task_id: &str,
) -> Result<TaskOutcome<Uuid>> {
    let task = TaskKind::TestRestore;
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

    if let Err(e) = &result {
        let mut alert = AlertRecord::new(
            AlertKind::RestoreFailure,
            AlertSeverity::Error,
            &format!("Automated test restore failed: {e}"),
        );
        alert.details.insert("task_id".into(), json!(task_id));
        if let Err(alert_err) = ctx.monitor.create_alert(alert).await {
            warn!(%alert_err, "failed to create test restore alert");
        }
    }

    result.map(TaskOutcome::Completed)
}

async fn run(ctx: &BackupContext) -> Result<Uuid> {
    let scope = ctx.catalog.bypass_rls();

    // Candidate pool: successful full backups from the last week.
    let mut query = BackupQuery::successful(BackupKind::FullDatabase);
    query.created_after = Some(Utc::now() - Duration::days(7));
    let candidates = scope.list_backups(&query).await?;
    let backup = candidates
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or_else(|| {
            BackupError::NotFound("no successful full backup in the last 7 days".to_string())
        })?;
    info!(backup = %backup.filename, "selected backup for test restore");

    let test_db = format!("test_restore_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let mut restore = RestoreRecord::new(backup.id, RestoreMode::Full, "Automated test restore");
    restore
        .metadata
        .insert("test_database".into(), json!(test_db));
    scope.insert_restore(restore.clone()).await?;

    let started = Instant::now();
    db::create_database(ctx.admin.as_ref(), &test_db).await?;

    let outcome = restore_and_verify(ctx, &backup, &test_db).await;

    // The throwaway database goes away on every path.
    if let Err(e) = db::drop_database(ctx.admin.as_ref(), &test_db).await {
        warn!(database = %test_db, %e, "failed to drop test database");
    }

    match outcome {
        Ok(checks) => {
            let passed = checks
                .get("overall")
                .and_then(|o| o.get("passed"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            restore
                .metadata
                .insert("integrity_checks".into(), json!(checks));
            if passed {
                restore.mark_completed(elapsed_secs(started))?;
                scope.update_restore(&restore).await?;
                info!(restore = %restore.id, "test restore passed integrity checks");
            } else {
                restore
                    .mark_failed(elapsed_secs(started), "integrity checks failed")
                    .ok();
                scope.update_restore(&restore).await?;
                let mut alert = AlertRecord::new(
                    AlertKind::RestoreFailure,
                    AlertSeverity::Error,
                    &format!("Test restore of {} failed integrity checks", backup.filename),
                );
                alert.restore_id = Some(restore.id);
                alert.backup_id = Some(backup.id);
                alert.details.insert("integrity_checks".into(), json!(checks));
                ctx.monitor.create_alert(alert).await?;
            }
            Ok(restore.id)
        }
        Err(e) => {
            restore.mark_failed(elapsed_secs(started), &e.to_string()).ok();
            scope.update_restore(&restore).await?;
            ctx.monitor.monitor_restore_completion(&restore).await?;
            Err(e)
        }
    }
}

async fn restore_and_verify(
    ctx: &BackupContext,
    backup: &crate::records::BackupRecord,
    test_db: &str,
) -> Result<BTreeMap<String, Value>> {
    let temp = tempfile::tempdir()?;
    let encrypted_path = temp.path().join(&backup.filename);
    download_backup_artifact(ctx, backup, &encrypted_path).await?;

    let decrypted_path = temp
        .path()
        .join(backup.filename.trim_end_matches(".gz.enc"));
    codec::decrypt_and_decompress_file(&ctx.key, &encrypted_path, Some(&decrypted_path), false)?;

    ctx.dump.restore(&decrypted_path, false, Some(test_db)).await?;

    let test_admin = ctx.admin.for_database(test_db).await?;
    verify_test_restore_integrity(test_admin, &ctx.settings.integrity_tables).await
}

/// Structural checks against a restored copy: table existence, row counts,
/// sampled foreign-key orphans, sampled NOT NULL violations.
pub async fn verify_test_restore_integrity(
    admin: Arc<dyn DatabaseAdmin>,
    key_tables: &[String],
) -> Result<BTreeMap<String, Value>> {
    let mut results = BTreeMap::new();

    // Check 1: key tables exist.
    let mut existing = Vec::new();
    let mut missing = Vec::new();
    for table in key_tables {
        let sql = format!(
            "SELECT CASE WHEN EXISTS (SELECT FROM information_schema.tables \
             WHERE table_name = '{table}') THEN 1 ELSE 0 END;"
        );
        match admin.query_i64(&sql).await {
            Ok(1) => existing.push(table.clone()),
            _ => missing.push(table.clone()),
        }
    }
    results.insert(
        "table_existence".to_string(),
        json!({
            "passed": missing.is_empty(),
            "existing_tables": existing,
            "missing_tables": missing,
            "total_checked": key_tables.len(),
        }),
    );

    // Check 2: row counts over the tables that exist.
    let mut counts = BTreeMap::new();
    let mut total_rows: i64 = 0;
    let mut counts_ok = true;
    for table in &existing {
        match admin.query_i64(&format!("SELECT COUNT(*) FROM {table};")).await {
            Ok(count) => {
                total_rows += count;
                counts.insert(table.clone(), count);
            }
            Err(e) => {
                warn!(table, %e, "row count failed");
                counts.insert(table.clone(), -1);
                counts_ok = false;
            }
        }
    }
    results.insert(
        "row_counts".to_string(),
        json!({
            "passed": counts_ok,
            "counts": counts,
            "total_rows": total_rows,
        }),
    );

    // Check 3: sampled foreign-key orphans.
    let fk_rows = admin
        .query_rows(
            "SELECT tc.table_name, kcu.column_name, ccu.table_name, ccu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
             JOIN information_schema.constraint_column_usage ccu \
               ON ccu.constraint_name = tc.constraint_name \
             WHERE tc.constraint_type = 'FOREIGN KEY' LIMIT 20;",
        )
        .await
        .unwrap_or_default();

    let mut fk_violations = Vec::new();
    for row in &fk_rows {
        if row.len() < 4 {
            continue;
        }
        let [table, column, ref_table, ref_column] = [&row[0], &row[1], &row[2], &row[3]];
        let sql = format!(
            "SELECT COUNT(*) FROM {table} t WHERE t.{column} IS NOT NULL AND NOT EXISTS \
             (SELECT 1 FROM {ref_table} r WHERE r.{ref_column} = t.{column});"
        );
        match admin.query_i64(&sql).await {
            Ok(0) => {}
            Ok(violations) => fk_violations.push(json!({
                "table": table,
                "column": column,
                "ref_table": ref_table,
                "violations": violations,
            })),
            Err(e) => warn!(table = %table, column = %column, %e, "FK check failed"),
        }
    }
    results.insert(
        "foreign_key_integrity".to_string(),
        json!({
            "passed": fk_violations.is_empty(),
            "constraints_checked": fk_rows.len(),
            "violations": fk_violations,
        }),
    );

    // Check 4: sampled NOT NULL columns actually hold no NULLs.
    let not_null_rows = admin
        .query_rows(
            "SELECT table_name, column_name FROM information_schema.columns \
             WHERE is_nullable = 'NO' AND table_schema = 'public' LIMIT 10;",
        )
        .await
        .unwrap_or_default();

    let mut corruption = Vec::new();
    for row in &not_null_rows {
        if row.len() < 2 {
            continue;
        }
        let (table, column) = (&row[0], &row[1]);
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE {column} IS NULL;");
        match admin.query_i64(&sql).await {
            Ok(0) | Err(_) => {}
            Ok(nulls) => corruption.push(json!({
                "table": table,
                "column": column,
                "issue": format!("Found {nulls} NULL values in NOT NULL column"),
            })),
        }
    }
    results.insert(
        "data_corruption".to_string(),
        json!({
            "passed": corruption.is_empty(),
            "issues": corruption,
        }),
    );

    let all_passed = results
        .values()
        .all(|check| check.get("passed").and_then(Value::as_bool).unwrap_or(false));
    let total_checks = results.len();
    results.insert(
        "overall".to_string(),
        json!({
            "passed": all_passed,
            "total_checks": total_checks,
        }),
    );

    Ok(results)
}
