//! Configuration backup round-trip and the hourly integrity sweep.

mod common;

use aurum_backup::catalog::{AlertQuery, BackupQuery};
use aurum_backup::codec;
use aurum_backup::orchestrator::{configuration, integrity};
use aurum_backup::records::{AlertKind, AlertSeverity, BackupKind, BackupStatus};

#[tokio::test]
async fn configuration_backup_round_trips_with_sanitized_env() {
    let h = common::harness();
    let project_root = h.ctx.settings.project_root.clone();

    std::fs::write(
        project_root.join("docker-compose.yml"),
        "services:\n  app:\n    image: aurum\n",
    )
    .unwrap();
    std::fs::write(
        project_root.join(".env"),
        "# secrets\nDATABASE_PASSWORD=hunter2\nAPI_KEY=abc123\n",
    )
    .unwrap();
    std::fs::write(project_root.join("Cargo.toml"), "[workspace]\n").unwrap();

    let outcome = configuration::configuration_backup(&h.ctx, "task-1", None)
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
    assert_eq!(record.status, BackupStatus::Verified);
    assert!(record.filename.starts_with("backup_configuration_"));
    assert!(record.filename.ends_with(".tar.gz.enc"));

    // Pull the artifact back, decode it, and check the sanitized env file.
    let scratch = tempfile::tempdir().unwrap();
    let fetched = scratch.path().join(&record.filename);
    let local = h.ctx.storage.local().unwrap();
    assert!(local.download(&record.filename, &fetched).await);

    let tar_path = scratch.path().join("restored.tar");
    codec::decrypt_and_decompress_file(&h.ctx.key, &fetched, Some(&tar_path), false).unwrap();

    let mut archive = tar::Archive::new(std::fs::File::open(&tar_path).unwrap());
    let unpack_dir = scratch.path().join("unpacked");
    archive.unpack(&unpack_dir).unwrap();

    let sanitized =
        std::fs::read_to_string(unpack_dir.join("config_backup/.env.sanitized")).unwrap();
    assert!(sanitized.contains("DATABASE_PASSWORD=***REDACTED***"));
    assert!(sanitized.contains("# secrets"));
    assert!(!sanitized.contains("hunter2"));
    // The raw .env never enters the archive.
    assert!(!unpack_dir.join("config_backup/.env").exists());
    assert!(unpack_dir.join("config_backup/docker-compose.yml").is_file());
}

#[tokio::test]
async fn configuration_backup_with_nothing_to_collect_fails() {
    let h = common::harness();

    let result = configuration::configuration_backup(&h.ctx, "task-1", None).await;
    assert!(result.is_err());

    let records = h
        .ctx
        .catalog
        .bypass_rls()
        .list_backups(&BackupQuery::of_kind(BackupKind::Configuration))
        .await
        .unwrap();
    assert_eq!(records[0].status, BackupStatus::Failed);
}

#[tokio::test]
async fn integrity_sweep_passes_intact_backups_and_flags_tampered_ones() {
    let h = common::harness();
    let scope = h.ctx.catalog.bypass_rls();

    // Two real backups via the full pipeline.
    let first = aurum_backup::orchestrator::full::daily_full_database_backup(&h.ctx, "t1", None)
        .await
        .unwrap()
        .completed()
        .unwrap();
    let second = aurum_backup::orchestrator::full::daily_full_database_backup(&h.ctx, "t2", None)
        .await
        .unwrap()
        .completed()
        .unwrap();

    // Clean sweep first: everything passes.
    let stats = integrity::verify_storage_integrity(&h.ctx, "sweep-1")
        .await
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(stats.total_backups_checked, 2);
    assert_eq!(stats.verified_successfully, 2);
    assert_eq!(stats.integrity_failures, 0);

    let checked = scope.require_backup(first).await.unwrap();
    assert_eq!(
        checked.metadata["last_integrity_check"]["status"],
        "passed"
    );

    // Truncate the second backup's local copy to force a size mismatch.
    let record = scope.require_backup(second).await.unwrap();
    let local_base = h.dirs[0].path();
    std::fs::write(local_base.join(&record.local_path), b"short").unwrap();

    let stats = integrity::verify_storage_integrity(&h.ctx, "sweep-2")
        .await
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(stats.integrity_failures, 1);
    assert_eq!(stats.size_mismatches, 1);

    let flagged = scope.require_backup(second).await.unwrap();
    assert_eq!(
        flagged.metadata["last_integrity_check"]["status"],
        "failed"
    );
    // Status is untouched by the sweep; only metadata and alerts change.
    assert_eq!(flagged.status, BackupStatus::Verified);

    let alerts = scope.list_alerts(&AlertQuery::active()).await.unwrap();
    assert!(alerts.iter().any(|a| {
        a.kind == AlertKind::IntegrityFailure
            && a.severity == AlertSeverity::Error
            && a.backup_id == Some(second)
    }));
    // Plus the per-sweep summary warning.
    assert!(alerts
        .iter()
        .any(|a| a.kind == AlertKind::IntegrityFailure && a.severity == AlertSeverity::Warning));
}

#[tokio::test]
async fn integrity_sweep_reports_missing_files() {
    let h = common::harness();
    let scope = h.ctx.catalog.bypass_rls();

    let backup_id = aurum_backup::orchestrator::full::daily_full_database_backup(&h.ctx, "t1", None)
        .await
        .unwrap()
        .completed()
        .unwrap();
    let record = scope.require_backup(backup_id).await.unwrap();

    // Remove the r2 copy behind the catalog's back.
    let r2 = h.ctx.storage.backend("r2").unwrap();
    assert!(r2.delete(&record.r2_path).await);

    let stats = integrity::verify_storage_integrity(&h.ctx, "sweep-1")
        .await
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(stats.missing_files, 1);
    assert_eq!(stats.integrity_failures, 1);
}
