//! WAL archiving and retention-sweep behavior.

mod common;

use chrono::{Duration, Utc};
use common::HarnessBuilder;

use aurum_backup::catalog::{AlertQuery, BackupQuery};
use aurum_backup::orchestrator::{cleanup, wal};
use aurum_backup::records::{AlertSeverity, BackupKind, BackupRecord, BackupStatus};

fn seed_wal_segment(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    // Miniature stand-in for a 16 MiB segment.
    std::fs::write(&path, vec![0xA5u8; 64 * 1024]).unwrap();
    path
}

#[tokio::test]
async fn wal_segments_are_compressed_uploaded_and_deduplicated() {
    let h = common::harness();
    let wal_dir = h.ctx.settings.wal_archive_dir.clone();

    let seg_a = seed_wal_segment(&wal_dir, "000000010000000000000001");
    let seg_b = seed_wal_segment(&wal_dir, "0000000100000000000000AB");
    // Wrong shape: ignored.
    seed_wal_segment(&wal_dir, "not-a-wal-file");

    let outcome = wal::continuous_wal_archiving(&h.ctx, "task-1").await.unwrap();
    assert_eq!(outcome.completed(), Some(2));

    // Raw segments removed, compressed variants kept beside them.
    assert!(!seg_a.exists());
    assert!(!seg_b.exists());
    assert!(wal_dir.join("000000010000000000000001.gz").exists());
    assert!(wal_dir.join("0000000100000000000000AB.gz").exists());

    let scope = h.ctx.catalog.bypass_rls();
    let records = scope
        .list_backups(&BackupQuery::of_kind(BackupKind::WalArchive))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.status, BackupStatus::Verified);
        assert_eq!(record.checksum.len(), 64);
        // Cloud copies under the wal/ prefix, local copy is the on-disk .gz.
        assert!(record.r2_path.starts_with("wal/"));
        assert!(record.b2_path.starts_with("wal/"));
        let r2 = h.ctx.storage.backend("r2").unwrap();
        assert!(r2.exists(&record.r2_path).await);
    }

    // A second sweep finds nothing new.
    let outcome = wal::continuous_wal_archiving(&h.ctx, "task-2").await.unwrap();
    assert_eq!(outcome.completed(), Some(0));
}

#[tokio::test]
async fn wal_archiving_requires_at_least_one_cloud_copy() {
    let h = HarnessBuilder::new()
        .failing_backend("r2")
        .failing_backend("b2")
        .build();
    let wal_dir = h.ctx.settings.wal_archive_dir.clone();
    let segment = seed_wal_segment(&wal_dir, "000000010000000000000001");

    let outcome = wal::continuous_wal_archiving(&h.ctx, "task-1").await.unwrap();
    assert_eq!(outcome.completed(), Some(0));

    // The raw segment survives a failed archive attempt.
    assert!(segment.exists());

    let scope = h.ctx.catalog.bypass_rls();
    let records = scope
        .list_backups(&BackupQuery::of_kind(BackupKind::WalArchive))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BackupStatus::Failed);

    let alerts = scope.list_alerts(&AlertQuery::active()).await.unwrap();
    assert!(alerts.iter().any(|a| a.severity == AlertSeverity::Error));
}

#[tokio::test]
async fn old_wal_archives_are_purged_from_cloud_and_catalog() {
    let h = common::harness();
    let scope = h.ctx.catalog.bypass_rls();

    // Seed an archived segment dated past the 30-day window, with a live
    // cloud object.
    let r2 = h.ctx.storage.backend("r2").unwrap();
    let scratch = h.ctx.settings.wal_archive_dir.join("old.gz");
    std::fs::write(&scratch, b"old wal").unwrap();
    assert!(r2.upload(&scratch, "wal/000000010000000000000001.gz").await);

    let mut old = BackupRecord::new(
        BackupKind::WalArchive,
        None,
        "000000010000000000000001.gz",
        "job",
    );
    old.r2_path = "wal/000000010000000000000001.gz".into();
    old.created_at = Utc::now() - Duration::days(31);
    old.mark_completed(1).unwrap();
    scope.insert_backup(old.clone()).await.unwrap();

    wal::cleanup_old_wal_archives(&h.ctx).await;

    assert!(scope.get_backup(old.id).await.unwrap().is_none());
    assert!(!r2.exists("wal/000000010000000000000001.gz").await);
}

#[tokio::test]
async fn retention_sweep_deletes_expired_local_copies_and_orphaned_records() {
    let h = common::harness();
    let scope = h.ctx.catalog.bypass_rls();
    let local = h.ctx.storage.local().unwrap();

    // 35-day-old backup with only a local copy.
    let staging = h.ctx.settings.wal_archive_dir.join("stage.bin");
    std::fs::write(&staging, b"expired artifact").unwrap();
    assert!(local.upload(&staging, "expired.dump.gz.enc").await);

    let mut expired = BackupRecord::new(BackupKind::FullDatabase, None, "expired.dump.gz.enc", "j");
    expired.local_path = "expired.dump.gz.enc".into();
    expired.size_bytes = 16;
    expired.checksum = "ab".repeat(32);
    expired.created_at = Utc::now() - Duration::days(35);
    expired.mark_completed(1).unwrap();
    scope.insert_backup(expired.clone()).await.unwrap();

    // 29-day-old backup stays untouched.
    assert!(local.upload(&staging, "recent.dump.gz.enc").await);
    let mut recent = BackupRecord::new(BackupKind::FullDatabase, None, "recent.dump.gz.enc", "j");
    recent.local_path = "recent.dump.gz.enc".into();
    recent.created_at = Utc::now() - Duration::days(29);
    recent.mark_completed(1).unwrap();
    scope.insert_backup(recent.clone()).await.unwrap();

    let outcome = cleanup::cleanup_old_backups(&h.ctx, "task-1").await.unwrap();
    let stats = outcome.completed().unwrap();

    assert_eq!(stats.local_deleted, 1);
    // No remote copies remained, so the record itself is gone.
    assert_eq!(stats.records_deleted, 1);
    assert!(scope.get_backup(expired.id).await.unwrap().is_none());
    assert!(!local.exists("expired.dump.gz.enc").await);

    let kept = scope.get_backup(recent.id).await.unwrap().unwrap();
    assert_eq!(kept.local_path, "recent.dump.gz.enc");
    assert!(local.exists("recent.dump.gz.enc").await);

    // Cleanup reported itself with an INFO alert.
    let alerts = scope.list_alerts(&AlertQuery::active()).await.unwrap();
    assert!(alerts.iter().any(|a| a.severity == AlertSeverity::Info));
}

#[tokio::test]
async fn year_old_cloud_copies_are_removed_but_checksum_survives() {
    let h = common::harness();
    let scope = h.ctx.catalog.bypass_rls();

    let staging = h.ctx.settings.wal_archive_dir.join("stage.bin");
    std::fs::write(&staging, b"ancient artifact").unwrap();
    let r2 = h.ctx.storage.backend("r2").unwrap();
    let b2 = h.ctx.storage.backend("b2").unwrap();
    assert!(r2.upload(&staging, "ancient.dump.gz.enc").await);
    assert!(b2.upload(&staging, "ancient.dump.gz.enc").await);

    let mut ancient = BackupRecord::new(BackupKind::FullDatabase, None, "ancient.dump.gz.enc", "j");
    ancient.r2_path = "ancient.dump.gz.enc".into();
    ancient.b2_path = "ancient.dump.gz.enc".into();
    ancient.size_bytes = 16;
    ancient.checksum = "cd".repeat(32);
    ancient.created_at = Utc::now() - Duration::days(400);
    ancient.mark_completed(1).unwrap();
    scope.insert_backup(ancient.clone()).await.unwrap();

    let outcome = cleanup::cleanup_old_backups(&h.ctx, "task-1").await.unwrap();
    let stats = outcome.completed().unwrap();
    assert_eq!(stats.r2_deleted, 1);
    assert_eq!(stats.b2_deleted, 1);

    // All paths emptied, so the record was deleted; cleanup never mutated
    // checksum or size before that.
    assert!(scope.get_backup(ancient.id).await.unwrap().is_none());
    assert!(!r2.exists("ancient.dump.gz.enc").await);
}
