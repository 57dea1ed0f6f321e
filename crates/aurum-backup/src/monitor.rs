//! Post-hoc anomaly detection over catalog records.
//!
//! The orchestrator calls into the monitor after each terminal transition;
//! standalone tasks reuse it for capacity checks and the daily digest. Every
//! alert the monitor creates is pushed through the notifier, and the
//! channels that accepted delivery are recorded on the alert.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::catalog::{AlertQuery, BackupQuery, CatalogHandle};
use crate::config::MonitorThresholds;
use crate::error::Result;
use crate::notify::{IdentityDirectory, Notifier};
use crate::records::{
    AlertKind, AlertRecord, AlertSeverity, AlertStatus, BackupRecord, BackupStatus, RestoreRecord,
    RestoreStatus,
};
use crate::storage::StorageSet;

/// How many recent same-kind backups feed the deviation baselines.
const BASELINE_SAMPLE: usize = 10;
/// Age limit of baseline samples.
const BASELINE_WINDOW_DAYS: i64 = 7;

/// Aggregated alert counts for the digest.
#[derive(Debug, Clone)]
pub struct AlertSummary {
    pub active_alerts: usize,
    pub critical_alerts: usize,
    pub recent_alerts_24h: usize,
    pub by_kind: BTreeMap<String, usize>,
}

/// Anomaly detector and alert dispatcher.
pub struct Monitor {
    catalog: CatalogHandle,
    notifier: Arc<dyn Notifier>,
    directory: Arc<dyn IdentityDirectory>,
    webhook_url: Option<String>,
    thresholds: MonitorThresholds,
}

impl Monitor {
    pub fn new(
        catalog: CatalogHandle,
        notifier: Arc<dyn Notifier>,
        directory: Arc<dyn IdentityDirectory>,
        webhook_url: Option<String>,
        thresholds: MonitorThresholds,
    ) -> Self {
        Self {
            catalog,
            notifier,
            directory,
            webhook_url,
            thresholds,
        }
    }

    /// Persist an alert and fan out notifications, recording the channels
    /// that accepted delivery.
    pub async fn create_alert(&self, mut alert: AlertRecord) -> Result<AlertRecord> {
        info!(
            kind = ?alert.kind,
            severity = ?alert.severity,
            message = %alert.message,
            "created backup alert"
        );
        let scope = self.catalog.bypass_rls();
        scope.insert_alert(alert.clone()).await?;

        let mut channels: Vec<String> = Vec::new();
        let admins = self.directory.platform_administrators().await;

        for admin in &admins {
            if self
                .notifier
                .create_in_app(
                    admin,
                    &format!("Backup Alert: {:?}", alert.kind),
                    &alert.message,
                    Some("/admin/backups/alerts/"),
                )
                .await
                && !channels.iter().any(|c| c == "in_app")
            {
                channels.push("in_app".to_string());
            }

            let context = json!({
                "message": alert.message,
                "severity": format!("{:?}", alert.severity),
                "details": alert.details,
            });
            if self
                .notifier
                .send_email(
                    admin,
                    "backup_alert",
                    &context,
                    Some(&format!("[{:?}] Backup Alert: {:?}", alert.severity, alert.kind)),
                )
                .await
                && !channels.iter().any(|c| c == "email")
            {
                channels.push("email".to_string());
            }

            if alert.severity == AlertSeverity::Critical
                && self
                    .notifier
                    .send_sms(admin, &alert.message, "BACKUP_ALERT")
                    .await
                && !channels.iter().any(|c| c == "sms")
            {
                channels.push("sms".to_string());
            }
        }

        if let Some(url) = &self.webhook_url {
            let payload = json!({
                "alert_id": alert.id,
                "alert_type": format!("{:?}", alert.kind),
                "severity": format!("{:?}", alert.severity),
                "message": alert.message,
                "details": alert.details,
                "backup_id": alert.backup_id,
                "created_at": alert.created_at,
            });
            if self.notifier.post_webhook(url, &payload).await {
                channels.push("webhook".to_string());
            }
        }

        alert.notification_channels = channels;
        alert.notification_sent_at = Some(Utc::now());
        scope.update_alert(&alert).await?;
        Ok(alert)
    }

    /// Run all completion detectors for a backup's terminal state.
    pub async fn monitor_backup_completion(&self, backup: &BackupRecord) -> Result<Vec<AlertRecord>> {
        let mut alerts = Vec::new();

        if backup.status == BackupStatus::Failed {
            let mut alert = AlertRecord::new(
                AlertKind::BackupFailure,
                AlertSeverity::Critical,
                &format!("Backup failed: {}", backup.filename),
            );
            alert.backup_id = Some(backup.id);
            alert.details.insert("notes".into(), Value::String(backup.notes.clone()));
            alerts.push(self.create_alert(alert).await?);
            return Ok(alerts);
        }

        if let Some(alert) = self.check_size_deviation(backup).await? {
            alerts.push(alert);
        }
        if let Some(alert) = self.check_duration_threshold(backup).await? {
            alerts.push(alert);
        }
        Ok(alerts)
    }

    /// Failed restores raise a CRITICAL alert.
    pub async fn monitor_restore_completion(
        &self,
        restore: &RestoreRecord,
    ) -> Result<Option<AlertRecord>> {
        if restore.status != RestoreStatus::Failed {
            return Ok(None);
        }
        let mut alert = AlertRecord::new(
            AlertKind::RestoreFailure,
            AlertSeverity::Critical,
            &format!("Restore operation failed: {}", restore.error_message),
        );
        alert.restore_id = Some(restore.id);
        alert.backup_id = Some(restore.backup_id);
        Ok(Some(self.create_alert(alert).await?))
    }

    async fn baseline(&self, backup: &BackupRecord) -> Result<Vec<BackupRecord>> {
        let mut query = BackupQuery::successful(backup.kind);
        query.created_after = Some(Utc::now() - Duration::days(BASELINE_WINDOW_DAYS));
        let records = self.catalog.bypass_rls().list_backups(&query).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.id != backup.id)
            .take(BASELINE_SAMPLE)
            .collect())
    }

    /// Alert when a backup's size strays from the recent same-kind mean.
    pub async fn check_size_deviation(&self, backup: &BackupRecord) -> Result<Option<AlertRecord>> {
        let recent = self.baseline(backup).await?;
        if recent.is_empty() {
            debug!(backup = %backup.id, "no recent backups for size comparison");
            return Ok(None);
        }

        let avg_size =
            recent.iter().map(|r| r.size_bytes as f64).sum::<f64>() / recent.len() as f64;
        if avg_size == 0.0 {
            return Ok(None);
        }

        let deviation = (backup.size_bytes as f64 - avg_size).abs() / avg_size;
        if deviation <= self.thresholds.size_warning {
            return Ok(None);
        }

        let severity = if deviation > self.thresholds.size_critical {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        let direction = if (backup.size_bytes as f64) > avg_size {
            "larger"
        } else {
            "smaller"
        };

        let mut alert = AlertRecord::new(
            AlertKind::SizeDeviation,
            severity,
            &format!(
                "Backup size deviation detected: {} is {:.1}% {} than average ({:.2} MB vs {:.2} MB avg)",
                backup.filename,
                deviation * 100.0,
                direction,
                backup.size_mb(),
                avg_size / (1024.0 * 1024.0)
            ),
        );
        alert.backup_id = Some(backup.id);
        alert.details.insert("backup_size_bytes".into(), json!(backup.size_bytes));
        alert.details.insert("average_size_bytes".into(), json!(avg_size as u64));
        alert
            .details
            .insert("deviation_percentage".into(), json!((deviation * 10000.0).round() / 100.0));
        alert
            .details
            .insert("recent_backups_count".into(), json!(recent.len()));

        Ok(Some(self.create_alert(alert).await?))
    }

    /// Alert when a backup takes significantly longer than the recent mean.
    /// Only slower-than-average runs trigger.
    pub async fn check_duration_threshold(
        &self,
        backup: &BackupRecord,
    ) -> Result<Option<AlertRecord>> {
        let duration = match backup.duration_seconds {
            Some(d) => d as f64,
            None => return Ok(None),
        };

        let recent: Vec<BackupRecord> = self
            .baseline(backup)
            .await?
            .into_iter()
            .filter(|r| r.duration_seconds.is_some())
            .collect();
        if recent.is_empty() {
            return Ok(None);
        }

        let avg_duration = recent
            .iter()
            .map(|r| r.duration_seconds.unwrap_or(0) as f64)
            .sum::<f64>()
            / recent.len() as f64;
        if avg_duration == 0.0 {
            return Ok(None);
        }

        let deviation = (duration - avg_duration).abs() / avg_duration;
        if duration <= avg_duration || deviation <= self.thresholds.duration_warning {
            return Ok(None);
        }

        let severity = if deviation > self.thresholds.duration_critical {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };

        let mut alert = AlertRecord::new(
            AlertKind::DurationThreshold,
            severity,
            &format!(
                "Backup duration threshold exceeded: {} took {}s, {:.1}% longer than average ({}s avg)",
                backup.filename,
                duration as u64,
                deviation * 100.0,
                avg_duration as u64
            ),
        );
        alert.backup_id = Some(backup.id);
        alert
            .details
            .insert("backup_duration_seconds".into(), json!(duration as u64));
        alert
            .details
            .insert("average_duration_seconds".into(), json!(avg_duration as u64));
        alert
            .details
            .insert("deviation_percentage".into(), json!((deviation * 10000.0).round() / 100.0));

        Ok(Some(self.create_alert(alert).await?))
    }

    /// Alert on backends running out of room.
    pub async fn check_storage_capacity(&self, storage: &StorageSet) -> Result<Vec<AlertRecord>> {
        let mut alerts = Vec::new();
        for backend in storage.iter() {
            let usage = match backend.get_storage_usage().await {
                Some(usage) => usage,
                None => continue,
            };
            let fraction = usage.usage_fraction();
            if fraction <= self.thresholds.capacity_warning {
                continue;
            }
            let severity = if fraction > self.thresholds.capacity_critical {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            let mut alert = AlertRecord::new(
                AlertKind::StorageCapacity,
                severity,
                &format!(
                    "Storage capacity warning: {} is {:.1}% full",
                    backend.name(),
                    fraction * 100.0
                ),
            );
            alert.details.insert("backend".into(), json!(backend.name()));
            alert.details.insert("total_bytes".into(), json!(usage.total_bytes));
            alert.details.insert("used_bytes".into(), json!(usage.used_bytes));
            alert
                .details
                .insert("usage_percentage".into(), json!((fraction * 1000.0).round() / 10.0));
            alerts.push(self.create_alert(alert).await?);
        }
        Ok(alerts)
    }

    /// Counts of active alerts for the digest.
    pub async fn alert_summary(&self) -> Result<AlertSummary> {
        let scope = self.catalog.bypass_rls();
        let active = scope.list_alerts(&AlertQuery::active()).await?;
        let recent = scope
            .list_alerts(&AlertQuery {
                created_after: Some(Utc::now() - Duration::hours(24)),
                ..Default::default()
            })
            .await?;

        let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
        for alert in &active {
            *by_kind.entry(format!("{:?}", alert.kind)).or_default() += 1;
        }

        Ok(AlertSummary {
            critical_alerts: active
                .iter()
                .filter(|a| a.severity == AlertSeverity::Critical)
                .count(),
            active_alerts: active.len(),
            recent_alerts_24h: recent.len(),
            by_kind,
        })
    }

    /// Daily digest of active alerts to platform administrators. Returns
    /// the number of recipients notified; zero when there is nothing to say.
    pub async fn send_alert_digest(&self) -> Result<usize> {
        let summary = self.alert_summary().await?;
        if summary.active_alerts == 0 {
            info!("no active alerts, skipping digest");
            return Ok(0);
        }

        let scope = self.catalog.bypass_rls();
        let mut grouped = BTreeMap::new();
        for severity in [
            AlertSeverity::Critical,
            AlertSeverity::Error,
            AlertSeverity::Warning,
        ] {
            let alerts = scope
                .list_alerts(&AlertQuery {
                    status: Some(AlertStatus::Active),
                    severity: Some(severity),
                    ..Default::default()
                })
                .await?;
            grouped.insert(
                format!("{severity:?}"),
                alerts.iter().map(|a| a.message.clone()).collect::<Vec<_>>(),
            );
        }

        let admins = self.directory.platform_administrators().await;
        if admins.is_empty() {
            return Ok(0);
        }

        let title = format!("Backup Alert Digest: {} Active Alerts", summary.active_alerts);
        let body = format!(
            "Critical: {}, Active: {}, Recent (24h): {}",
            summary.critical_alerts, summary.active_alerts, summary.recent_alerts_24h
        );
        let context = json!({
            "summary": {
                "active_alerts": summary.active_alerts,
                "critical_alerts": summary.critical_alerts,
                "recent_alerts_24h": summary.recent_alerts_24h,
                "by_kind": summary.by_kind,
            },
            "alerts": grouped,
        });

        for admin in &admins {
            self.notifier
                .create_in_app(admin, &title, &body, Some("/admin/backups/alerts/"))
                .await;
            if admin.email.is_some() {
                self.notifier
                    .send_email(admin, "backup_alert_digest", &context, Some(&title))
                    .await;
            }
        }

        info!(recipients = admins.len(), "sent alert digest");
        Ok(admins.len())
    }

    /// Purge RESOLVED alerts older than `days_to_keep` days.
    pub async fn cleanup_resolved_alerts(&self, days_to_keep: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(days_to_keep);
        let purged = self.catalog.bypass_rls().purge_resolved_alerts(cutoff).await?;
        info!(purged, days_to_keep, "cleaned up resolved alerts");
        Ok(purged)
    }
}
