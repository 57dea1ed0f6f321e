//! Durable catalog of backups, restore attempts, and alerts.
//!
//! The host database enforces per-tenant row filters; the engine must read
//! and write across all tenants. That capability is modelled as an explicit,
//! innermost scope: call [`CatalogHandle::bypass_rls`] and perform the write
//! through the returned [`PlatformCatalog`]. Store implementations honor the
//! scope (a SQL-backed store disables row security for the session it wraps;
//! the in-memory store used in tests is platform-wide by construction).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{BackupError, Result};
use crate::records::{
    AlertKind, AlertRecord, AlertSeverity, AlertStatus, BackupKind, BackupRecord, BackupStatus,
    RestoreRecord,
};

/// Filter for backup queries. Unset fields match everything; results are
/// ordered newest-first.
#[derive(Debug, Clone, Default)]
pub struct BackupQuery {
    pub kind: Option<BackupKind>,
    pub statuses: Vec<BackupStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub has_local_path: Option<bool>,
    pub has_any_remote_path: Option<bool>,
    pub limit: Option<usize>,
}

impl BackupQuery {
    pub fn of_kind(kind: BackupKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Successful backups (COMPLETED or VERIFIED) of one kind.
    pub fn successful(kind: BackupKind) -> Self {
        Self {
            kind: Some(kind),
            statuses: vec![BackupStatus::Completed, BackupStatus::Verified],
            ..Default::default()
        }
    }

    fn matches(&self, record: &BackupRecord) -> bool {
        if let Some(kind) = self.kind {
            if record.kind != kind {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if let Some(after) = self.created_after {
            if record.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if record.created_at >= before {
                return false;
            }
        }
        if let Some(wants_local) = self.has_local_path {
            if record.local_path.is_empty() == wants_local {
                return false;
            }
        }
        if let Some(wants_remote) = self.has_any_remote_path {
            let has_remote = !record.r2_path.is_empty() || !record.b2_path.is_empty();
            if has_remote != wants_remote {
                return false;
            }
        }
        true
    }
}

/// Filter for alert queries, ordered newest-first.
#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    pub status: Option<AlertStatus>,
    pub severity: Option<AlertSeverity>,
    pub kind: Option<AlertKind>,
    pub created_after: Option<DateTime<Utc>>,
}

impl AlertQuery {
    pub fn active() -> Self {
        Self {
            status: Some(AlertStatus::Active),
            ..Default::default()
        }
    }

    fn matches(&self, alert: &AlertRecord) -> bool {
        if let Some(status) = self.status {
            if alert.status != status {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if alert.severity != severity {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if alert.kind != kind {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if alert.created_at < after {
                return false;
            }
        }
        true
    }
}

/// External persistence contract for catalog records.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn insert_backup(&self, record: BackupRecord) -> Result<()>;
    async fn update_backup(&self, record: &BackupRecord) -> Result<()>;
    async fn delete_backup(&self, id: Uuid) -> Result<()>;
    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>>;
    async fn backup_exists(&self, kind: BackupKind, filename: &str) -> Result<bool>;
    async fn list_backups(&self, query: &BackupQuery) -> Result<Vec<BackupRecord>>;

    async fn insert_restore(&self, record: RestoreRecord) -> Result<()>;
    async fn update_restore(&self, record: &RestoreRecord) -> Result<()>;
    async fn get_restore(&self, id: Uuid) -> Result<Option<RestoreRecord>>;

    async fn insert_alert(&self, alert: AlertRecord) -> Result<()>;
    async fn update_alert(&self, alert: &AlertRecord) -> Result<()>;
    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<AlertRecord>>;
    /// Delete RESOLVED alerts resolved before `cutoff`; returns the count.
    async fn purge_resolved_alerts(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Process-lifetime handle to the catalog store.
#[derive(Clone)]
pub struct CatalogHandle {
    store: Arc<dyn CatalogStore>,
}

impl CatalogHandle {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// Enter the cross-tenant scope. Keep the scope as small as possible:
    /// acquire it per statement group, not per pipeline.
    pub fn bypass_rls(&self) -> PlatformCatalog<'_> {
        PlatformCatalog { store: &*self.store }
    }
}

/// Cross-tenant view of the catalog; the only way to touch records.
pub struct PlatformCatalog<'a> {
    store: &'a dyn CatalogStore,
}

impl PlatformCatalog<'_> {
    pub async fn insert_backup(&self, record: BackupRecord) -> Result<()> {
        self.store.insert_backup(record).await
    }

    pub async fn update_backup(&self, record: &BackupRecord) -> Result<()> {
        self.store.update_backup(record).await
    }

    pub async fn delete_backup(&self, id: Uuid) -> Result<()> {
        self.store.delete_backup(id).await
    }

    pub async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        self.store.get_backup(id).await
    }

    /// Fetch a backup or fail with a catalog error.
    pub async fn require_backup(&self, id: Uuid) -> Result<BackupRecord> {
        self.store
            .get_backup(id)
            .await?
            .ok_or_else(|| BackupError::Catalog(format!("backup {id} not found")))
    }

    pub async fn backup_exists(&self, kind: BackupKind, filename: &str) -> Result<bool> {
        self.store.backup_exists(kind, filename).await
    }

    pub async fn list_backups(&self, query: &BackupQuery) -> Result<Vec<BackupRecord>> {
        self.store.list_backups(query).await
    }

    /// Latest successful backup of a kind, if any.
    pub async fn latest_successful(&self, kind: BackupKind) -> Result<Option<BackupRecord>> {
        let mut query = BackupQuery::successful(kind);
        query.limit = Some(1);
        Ok(self.store.list_backups(&query).await?.into_iter().next())
    }

    pub async fn insert_restore(&self, record: RestoreRecord) -> Result<()> {
        self.store.insert_restore(record).await
    }

    pub async fn update_restore(&self, record: &RestoreRecord) -> Result<()> {
        self.store.update_restore(record).await
    }

    pub async fn get_restore(&self, id: Uuid) -> Result<Option<RestoreRecord>> {
        self.store.get_restore(id).await
    }

    pub async fn insert_alert(&self, alert: AlertRecord) -> Result<()> {
        self.store.insert_alert(alert).await
    }

    pub async fn update_alert(&self, alert: &AlertRecord) -> Result<()> {
        self.store.update_alert(alert).await
    }

    pub async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<AlertRecord>> {
        self.store.list_alerts(query).await
    }

    pub async fn purge_resolved_alerts(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.store.purge_resolved_alerts(cutoff).await
    }
}

/// In-memory catalog store used by tests and local development.
#[derive(Default)]
pub struct MemoryCatalog {
    backups: DashMap<Uuid, BackupRecord>,
    restores: DashMap<Uuid, RestoreRecord>,
    alerts: DashMap<Uuid, AlertRecord>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn insert_backup(&self, record: BackupRecord) -> Result<()> {
        self.backups.insert(record.id, record);
        Ok(())
    }

    async fn update_backup(&self, record: &BackupRecord) -> Result<()> {
        if !self.backups.contains_key(&record.id) {
            return Err(BackupError::Catalog(format!("backup {} not found", record.id)));
        }
        self.backups.insert(record.id, record.clone());
        Ok(())
    }

    async fn delete_backup(&self, id: Uuid) -> Result<()> {
        self.backups.remove(&id);
        Ok(())
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        Ok(self.backups.get(&id).map(|r| r.clone()))
    }

    async fn backup_exists(&self, kind: BackupKind, filename: &str) -> Result<bool> {
        Ok(self
            .backups
            .iter()
            .any(|r| r.kind == kind && r.filename == filename))
    }

    async fn list_backups(&self, query: &BackupQuery) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .backups
            .iter()
            .filter(|r| query.matches(r.value()))
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn insert_restore(&self, record: RestoreRecord) -> Result<()> {
        self.restores.insert(record.id, record);
        Ok(())
    }

    async fn update_restore(&self, record: &RestoreRecord) -> Result<()> {
        if !self.restores.contains_key(&record.id) {
            return Err(BackupError::Catalog(format!("restore {} not found", record.id)));
        }
        self.restores.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_restore(&self, id: Uuid) -> Result<Option<RestoreRecord>> {
        Ok(self.restores.get(&id).map(|r| r.clone()))
    }

    async fn insert_alert(&self, alert: AlertRecord) -> Result<()> {
        self.alerts.insert(alert.id, alert);
        Ok(())
    }

    async fn update_alert(&self, alert: &AlertRecord) -> Result<()> {
        if !self.alerts.contains_key(&alert.id) {
            return Err(BackupError::Catalog(format!("alert {} not found", alert.id)));
        }
        self.alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<AlertRecord>> {
        let mut alerts: Vec<AlertRecord> = self
            .alerts
            .iter()
            .filter(|a| query.matches(a.value()))
            .map(|a| a.clone())
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts)
    }

    async fn purge_resolved_alerts(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let stale: Vec<Uuid> = self
            .alerts
            .iter()
            .filter(|a| {
                a.status == AlertStatus::Resolved
                    && a.resolved_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|a| a.id)
            .collect();
        for id in &stale {
            self.alerts.remove(id);
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn handle() -> CatalogHandle {
        CatalogHandle::new(Arc::new(MemoryCatalog::new()))
    }

    #[tokio::test]
    async fn backup_queries_filter_by_kind_status_and_age() {
        let catalog = handle();
        let scope = catalog.bypass_rls();

        let mut fresh = BackupRecord::new(BackupKind::FullDatabase, None, "fresh", "job-1");
        fresh.mark_completed(10).unwrap();
        let mut stale = BackupRecord::new(BackupKind::FullDatabase, None, "stale", "job-2");
        stale.created_at = Utc::now() - Duration::days(40);
        stale.mark_completed(10).unwrap();
        let wal = BackupRecord::new(BackupKind::WalArchive, None, "0001.gz", "job-3");

        scope.insert_backup(fresh.clone()).await.unwrap();
        scope.insert_backup(stale.clone()).await.unwrap();
        scope.insert_backup(wal).await.unwrap();

        let mut recent = BackupQuery::successful(BackupKind::FullDatabase);
        recent.created_after = Some(Utc::now() - Duration::days(30));
        let results = scope.list_backups(&recent).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, fresh.id);

        let older = BackupQuery {
            created_before: Some(Utc::now() - Duration::days(30)),
            ..Default::default()
        };
        let results = scope.list_backups(&older).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, stale.id);
    }

    #[tokio::test]
    async fn path_filters_select_retention_candidates() {
        let catalog = handle();
        let scope = catalog.bypass_rls();

        let mut local_only = BackupRecord::new(BackupKind::FullDatabase, None, "a", "j");
        local_only.local_path = "a".into();
        let mut remote_only = BackupRecord::new(BackupKind::FullDatabase, None, "b", "j");
        remote_only.r2_path = "b".into();
        scope.insert_backup(local_only.clone()).await.unwrap();
        scope.insert_backup(remote_only.clone()).await.unwrap();

        let with_local = BackupQuery {
            has_local_path: Some(true),
            ..Default::default()
        };
        let results = scope.list_backups(&with_local).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, local_only.id);

        let with_remote = BackupQuery {
            has_any_remote_path: Some(true),
            ..Default::default()
        };
        let results = scope.list_backups(&with_remote).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, remote_only.id);
    }

    #[tokio::test]
    async fn latest_successful_skips_failed_and_in_progress() {
        let catalog = handle();
        let scope = catalog.bypass_rls();

        let mut failed = BackupRecord::new(BackupKind::FullDatabase, None, "failed", "j");
        failed.mark_failed(1, "boom").unwrap();
        let in_progress = BackupRecord::new(BackupKind::FullDatabase, None, "running", "j");
        let mut good = BackupRecord::new(BackupKind::FullDatabase, None, "good", "j");
        good.created_at = Utc::now() - Duration::hours(1);
        good.mark_completed(5).unwrap();

        scope.insert_backup(failed).await.unwrap();
        scope.insert_backup(in_progress).await.unwrap();
        scope.insert_backup(good.clone()).await.unwrap();

        let latest = scope
            .latest_successful(BackupKind::FullDatabase)
            .await
            .unwrap()
            .expect("one successful backup");
        assert_eq!(latest.id, good.id);
    }

    #[tokio::test]
    async fn resolved_alert_purge_respects_cutoff() {
        let catalog = handle();
        let scope = catalog.bypass_rls();

        let mut old = AlertRecord::new(AlertKind::BackupFailure, AlertSeverity::Info, "old");
        old.resolve();
        old.resolved_at = Some(Utc::now() - Duration::days(45));
        let mut recent = AlertRecord::new(AlertKind::BackupFailure, AlertSeverity::Info, "new");
        recent.resolve();
        let active = AlertRecord::new(AlertKind::BackupFailure, AlertSeverity::Info, "active");

        scope.insert_alert(old).await.unwrap();
        scope.insert_alert(recent).await.unwrap();
        scope.insert_alert(active).await.unwrap();

        let purged = scope
            .purge_resolved_alerts(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(scope.list_alerts(&AlertQuery::default()).await.unwrap().len(), 2);
    }
}
