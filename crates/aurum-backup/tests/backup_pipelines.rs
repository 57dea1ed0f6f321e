//! End-to-end pipeline tests over the in-memory catalog, scripted dump
//! driver, and tempdir-backed storage set.

mod common;

use aurum_backup::catalog::AlertQuery;
use aurum_backup::locks::TenantLockOutcome;
use aurum_backup::orchestrator::{full, tenant, TaskOutcome};
use aurum_backup::records::{AlertKind, AlertSeverity, BackupKind, BackupStatus};
use aurum_backup::scheduler::TaskKind;
use common::HarnessBuilder;
use aurum_backup::db::TenantRef;
use uuid::Uuid;

#[tokio::test]
async fn full_backup_is_triple_redundant_and_verified() {
    let h = common::harness();

    let outcome = full::daily_full_database_backup(&h.ctx, "task-1", None)
        .await
        .unwrap();
    let backup_id = outcome.completed().expect("pipeline must run");

    let record = h
        .ctx
        .catalog
        .bypass_rls()
        .require_backup(backup_id)
        .await
        .unwrap();

    assert_eq!(record.status, BackupStatus::Verified);
    assert!(!record.local_path.is_empty());
    assert!(!record.r2_path.is_empty());
    assert!(!record.b2_path.is_empty());
    assert_eq!(record.checksum.len(), 64);
    assert!(record.size_bytes > 0);
    assert!(record.verified_at.is_some());
    assert!(record.duration_seconds.is_some());
    // Plain SQL text compresses well past the 70 % target.
    assert!(record.compression_ratio >= 0.70);
    assert_eq!(record.metadata["pg_dump_format"], "plain");

    // The artifact is really there, with the remote key equal to the
    // filename.
    let local = h.ctx.storage.local().unwrap();
    assert!(local.exists(&record.filename).await);
    assert_eq!(local.get_size(&record.filename).await, Some(record.size_bytes));

    // The RLS bracket ran: FORCE RLS disabled, then restored.
    let statements = h.admin.executed();
    assert!(statements
        .iter()
        .any(|s| s.contains("NO FORCE ROW LEVEL SECURITY")));
    assert!(statements
        .iter()
        .any(|s| s.ends_with("FORCE ROW LEVEL SECURITY;") && !s.contains("NO FORCE")));
}

#[tokio::test]
async fn failed_local_upload_fails_the_task_with_critical_alert() {
    let h = HarnessBuilder::new().failing_backend("local").build();

    let result = full::daily_full_database_backup(&h.ctx, "task-1", None).await;
    assert!(result.is_err());

    let scope = h.ctx.catalog.bypass_rls();
    let records = scope
        .list_backups(&aurum_backup::BackupQuery::of_kind(BackupKind::FullDatabase))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BackupStatus::Failed);
    assert!(records[0].notes.contains("local storage"));

    let alerts = scope.list_alerts(&AlertQuery::active()).await.unwrap();
    assert!(alerts.iter().any(|a| {
        a.kind == AlertKind::BackupFailure
            && a.severity == AlertSeverity::Critical
            && a.backup_id == Some(records[0].id)
    }));
}

#[tokio::test]
async fn cloud_outage_degrades_to_reduced_redundancy() {
    let h = HarnessBuilder::new().failing_backend("r2").build();

    let outcome = full::daily_full_database_backup(&h.ctx, "task-1", None)
        .await
        .unwrap();
    let backup_id = outcome.completed().unwrap();
    let record = h
        .ctx
        .catalog
        .bypass_rls()
        .require_backup(backup_id)
        .await
        .unwrap();

    // Local is mandatory, clouds are best-effort; the missing copy leaves
    // its path empty and verification covers the copies that exist.
    assert_eq!(record.status, BackupStatus::Verified);
    assert!(record.r2_path.is_empty());
    assert!(!record.local_path.is_empty());
    assert!(!record.b2_path.is_empty());
}

#[tokio::test]
async fn dump_failure_marks_record_failed() {
    let h = HarnessBuilder::new().failing_full_dump().build();

    assert!(full::daily_full_database_backup(&h.ctx, "task-1", None)
        .await
        .is_err());

    let records = h
        .ctx
        .catalog
        .bypass_rls()
        .list_backups(&aurum_backup::BackupQuery::of_kind(BackupKind::FullDatabase))
        .await
        .unwrap();
    assert_eq!(records[0].status, BackupStatus::Failed);
    assert!(records[0].notes.contains("pg_dump"));
}

#[tokio::test]
async fn held_task_lock_skips_the_run() {
    let h = common::harness();
    let task = TaskKind::DailyFullBackup;

    let _guard = h
        .ctx
        .locks
        .acquire_task_lock(task.name(), "task-1", task.lock_ttl())
        .await
        .unwrap();

    let outcome = full::daily_full_database_backup(&h.ctx, "task-1", None)
        .await
        .unwrap();
    assert!(matches!(outcome, TaskOutcome::Skipped));

    // Nothing was written to the catalog.
    let records = h
        .ctx
        .catalog
        .bypass_rls()
        .list_backups(&Default::default())
        .await
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn tenant_batch_isolates_failures() {
    let good = TenantRef {
        id: Uuid::new_v4(),
        name: "Good Jeweler".into(),
    };
    let bad = TenantRef {
        id: Uuid::new_v4(),
        name: "Broken Jeweler".into(),
    };
    let h = HarnessBuilder::new()
        .tenants(vec![bad.clone(), good.clone()])
        .failing_tenant_dump(bad.id)
        .build();

    let outcome = tenant::weekly_per_tenant_backup(&h.ctx, "task-1")
        .await
        .unwrap();
    let succeeded = outcome.completed().unwrap();
    assert_eq!(succeeded.len(), 1);

    let scope = h.ctx.catalog.bypass_rls();
    let records = scope
        .list_backups(&aurum_backup::BackupQuery::of_kind(BackupKind::Tenant))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);

    let good_record = records.iter().find(|r| r.tenant_id == Some(good.id)).unwrap();
    assert_eq!(good_record.status, BackupStatus::Verified);
    let bad_record = records.iter().find(|r| r.tenant_id == Some(bad.id)).unwrap();
    assert_eq!(bad_record.status, BackupStatus::Failed);

    // The failing tenant raised an ERROR alert, not a batch abort.
    let alerts = scope.list_alerts(&AlertQuery::active()).await.unwrap();
    assert!(alerts
        .iter()
        .any(|a| a.severity == AlertSeverity::Error && a.backup_id == Some(bad_record.id)));

    // Both tenant locks were released.
    for tenant_ref in [&good, &bad] {
        assert!(matches!(
            h.ctx.locks.acquire_tenant_lock(tenant_ref.id, "task-2").await,
            TenantLockOutcome::Acquired(_)
        ));
    }
}

#[tokio::test]
async fn held_tenant_lock_skips_only_that_tenant() {
    let locked = TenantRef {
        id: Uuid::new_v4(),
        name: "Locked".into(),
    };
    let free = TenantRef {
        id: Uuid::new_v4(),
        name: "Free".into(),
    };
    let h = HarnessBuilder::new()
        .tenants(vec![locked.clone(), free.clone()])
        .build();

    let guard = match h.ctx.locks.acquire_tenant_lock(locked.id, "other-task").await {
        TenantLockOutcome::Acquired(guard) => guard,
        TenantLockOutcome::Held(_) => panic!("lock should be free"),
    };

    let outcome = tenant::weekly_per_tenant_backup(&h.ctx, "task-1")
        .await
        .unwrap();
    let succeeded = outcome.completed().unwrap();
    assert_eq!(succeeded.len(), 1);

    let records = h
        .ctx
        .catalog
        .bypass_rls()
        .list_backups(&aurum_backup::BackupQuery::of_kind(BackupKind::Tenant))
        .await
        .unwrap();
    // The locked tenant was skipped before a record was created.
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tenant_id, Some(free.id));

    guard.release().await;
}

#[tokio::test]
async fn manual_tenant_backup_resolves_the_tenant() {
    let tenant_ref = TenantRef {
        id: Uuid::new_v4(),
        name: "Solo".into(),
    };
    let h = HarnessBuilder::new().tenants(vec![tenant_ref.clone()]).build();

    let outcome = tenant::perform_tenant_backup(&h.ctx, "task-1", tenant_ref.id)
        .await
        .unwrap();
    assert_eq!(outcome.completed().unwrap().len(), 1);

    assert!(tenant::perform_tenant_backup(&h.ctx, "task-2", Uuid::new_v4())
        .await
        .is_err());
}
