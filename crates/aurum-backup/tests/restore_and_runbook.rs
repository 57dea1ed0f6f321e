//! Restore operation, monthly test restore, and the DR runbook.

mod common;

use aurum_backup::catalog::AlertQuery;
use aurum_backup::error::BackupError;
use aurum_backup::orchestrator::{full, restore, runbook, test_restore};
use aurum_backup::records::{
    AlertKind, AlertSeverity, RestoreMode, RestoreRecord, RestoreStatus,
};
use uuid::Uuid;

async fn seeded_backup(h: &common::Harness) -> Uuid {
    full::daily_full_database_backup(&h.ctx, "seed", None)
        .await
        .unwrap()
        .completed()
        .unwrap()
}

#[tokio::test]
async fn full_restore_downloads_decodes_and_invokes_pg_restore_clean() {
    let h = common::harness();
    let backup_id = seeded_backup(&h).await;

    let scope = h.ctx.catalog.bypass_rls();
    let record = RestoreRecord::new(backup_id, RestoreMode::Full, "operator request");
    let restore_id = record.id;
    scope.insert_restore(record).await.unwrap();

    restore::perform_restore_operation(&h.ctx, restore_id)
        .await
        .unwrap();

    let finished = scope.get_restore(restore_id).await.unwrap().unwrap();
    assert_eq!(finished.status, RestoreStatus::Completed);
    assert!(finished.duration_seconds.is_some());

    let restores = h.dump.restores.lock().unwrap().clone();
    assert_eq!(restores.len(), 1);
    let (dump_path, clean, target) = &restores[0];
    assert!(*clean, "FULL mode must pass --clean");
    assert!(target.is_none());
    // The driver saw the decoded plain dump, not the encrypted artifact.
    assert!(!dump_path.display().to_string().ends_with(".gz.enc"));
}

#[tokio::test]
async fn merge_restore_preserves_existing_objects() {
    let h = common::harness();
    let backup_id = seeded_backup(&h).await;

    let scope = h.ctx.catalog.bypass_rls();
    let record = RestoreRecord::new(backup_id, RestoreMode::Merge, "partial recovery");
    let restore_id = record.id;
    scope.insert_restore(record).await.unwrap();

    restore::perform_restore_operation(&h.ctx, restore_id)
        .await
        .unwrap();

    let restores = h.dump.restores.lock().unwrap().clone();
    assert!(!restores[0].1, "MERGE mode must not pass --clean");
}

#[tokio::test]
async fn pitr_restore_is_unimplemented_and_alerts() {
    let h = common::harness();
    let backup_id = seeded_backup(&h).await;

    let scope = h.ctx.catalog.bypass_rls();
    let mut record = RestoreRecord::new(backup_id, RestoreMode::Pitr, "time travel");
    record.target_timestamp = Some(chrono::Utc::now());
    let restore_id = record.id;
    scope.insert_restore(record).await.unwrap();

    let err = restore::perform_restore_operation(&h.ctx, restore_id)
        .await
        .expect_err("PITR is not implemented");
    assert!(matches!(err, BackupError::Unsupported(_)));

    let finished = scope.get_restore(restore_id).await.unwrap().unwrap();
    assert_eq!(finished.status, RestoreStatus::Failed);

    let alerts = scope.list_alerts(&AlertQuery::active()).await.unwrap();
    assert!(alerts.iter().any(|a| {
        a.kind == AlertKind::RestoreFailure && a.severity == AlertSeverity::Critical
    }));
}

#[tokio::test]
async fn automated_test_restore_uses_a_throwaway_database() {
    let h = common::harness();
    seeded_backup(&h).await;

    let outcome = test_restore::automated_test_restore(&h.ctx, "task-1")
        .await
        .unwrap();
    let restore_id = outcome.completed().unwrap();

    let scope = h.ctx.catalog.bypass_rls();
    let finished = scope.get_restore(restore_id).await.unwrap().unwrap();
    assert_eq!(finished.status, RestoreStatus::Completed);
    let test_db = finished.metadata["test_database"].as_str().unwrap().to_string();
    assert!(test_db.starts_with("test_restore_"));
    assert!(finished.metadata["integrity_checks"]["overall"]["passed"]
        .as_bool()
        .unwrap());

    // The throwaway database was created, restored into, and dropped.
    let statements = h.admin.executed();
    assert!(statements
        .iter()
        .any(|s| s.contains(&format!("CREATE DATABASE {test_db}"))));
    assert!(statements
        .iter()
        .any(|s| s.contains(&format!("DROP DATABASE IF EXISTS {test_db}"))));

    let restores = h.dump.restores.lock().unwrap().clone();
    assert_eq!(restores[0].2.as_deref(), Some(test_db.as_str()));
}

#[tokio::test]
async fn test_restore_without_recent_backups_fails_cleanly() {
    let h = common::harness();

    let err = test_restore::automated_test_restore(&h.ctx, "task-1")
        .await
        .expect_err("no candidates");
    assert!(matches!(err, BackupError::NotFound(_)));

    let alerts = h
        .ctx
        .catalog
        .bypass_rls()
        .list_alerts(&AlertQuery::active())
        .await
        .unwrap();
    assert!(alerts.iter().any(|a| a.kind == AlertKind::RestoreFailure));
}

#[tokio::test]
async fn dr_runbook_executes_all_seven_steps_within_rto() {
    let h = common::harness();
    let backup_id = seeded_backup(&h).await;

    let report = runbook::execute_disaster_recovery_runbook(&h.ctx, None, "drill")
        .await
        .unwrap();

    assert!(report.success);
    assert!(report.rto_met);
    assert!(report.duration_seconds < 3600);
    assert_eq!(report.backup_id, backup_id);
    assert_eq!(report.steps.len(), 7);

    let by_step: Vec<(&str, &str)> = report
        .steps
        .iter()
        .map(|s| (s.name.as_str(), s.status.as_str()))
        .collect();
    // Fatal steps all completed.
    assert_eq!(by_step[0], ("Select backup", "completed"));
    assert_eq!(by_step[1], ("Download backup", "completed"));
    assert_eq!(by_step[2], ("Decrypt and decompress", "completed"));
    assert_eq!(by_step[3], ("Restore database", "completed"));
    // Best-effort steps never fail the run.
    assert!(matches!(by_step[4].1, "completed" | "manual_required"));
    assert_eq!(by_step[5].1, "skipped");
    assert_eq!(by_step[6], ("Traffic routing", "completed"));

    // Per-step timings landed in the restore record's metadata.
    let scope = h.ctx.catalog.bypass_rls();
    let restore = scope.get_restore(report.restore_id).await.unwrap().unwrap();
    assert_eq!(restore.status, RestoreStatus::Completed);
    let steps = restore.metadata["runbook_steps"].as_array().unwrap();
    assert_eq!(steps.len(), 7);
    assert!(steps.iter().all(|s| s["duration_seconds"].is_number()));

    // The restore itself ran clean with the default target database.
    let restores = h.dump.restores.lock().unwrap().clone();
    assert!(restores[0].1);
}

#[tokio::test]
async fn dr_runbook_without_backups_fails_at_step_one() {
    let h = common::harness();

    let err = runbook::execute_disaster_recovery_runbook(&h.ctx, None, "drill")
        .await
        .expect_err("nothing to restore");
    assert!(matches!(err, BackupError::NotFound(_)));
}

#[tokio::test]
async fn dr_runbook_honors_a_pinned_backup_id() {
    let h = common::harness();
    let first = seeded_backup(&h).await;
    let _second = seeded_backup(&h).await;

    let report = runbook::execute_disaster_recovery_runbook(&h.ctx, Some(first), "drill")
        .await
        .unwrap();
    assert_eq!(report.backup_id, first);
}
