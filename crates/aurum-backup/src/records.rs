//! Catalog record types: backups, restore attempts, and alerts.
//!
//! Status transitions are monotonic. A record enters the catalog as
//! `InProgress` and moves to exactly one terminal outcome; `duration_seconds`
//! is written once, at the terminal transition. Cleanup may later clear
//! individual storage paths but never touches `checksum` or `size_bytes`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{BackupError, Result};

/// Kind of artifact a backup record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupKind {
    FullDatabase,
    Tenant,
    WalArchive,
    Configuration,
}

impl BackupKind {
    /// Lower-case token used in the artifact filename grammar.
    pub fn filename_token(&self) -> &'static str {
        match self {
            BackupKind::FullDatabase => "full_database",
            BackupKind::Tenant => "tenant",
            BackupKind::WalArchive => "wal_archive",
            BackupKind::Configuration => "configuration",
        }
    }
}

/// Lifecycle status of a backup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupStatus {
    InProgress,
    Completed,
    Verified,
    Failed,
}

impl BackupStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackupStatus::InProgress)
    }

    /// Completed and Verified both count as successful outcomes.
    pub fn is_successful(&self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::Verified)
    }
}

/// One produced backup artifact and where its copies live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub kind: BackupKind,
    pub tenant_id: Option<Uuid>,
    pub filename: String,
    pub size_bytes: u64,
    /// Lower-case hex SHA-256 of the stored artifact; 64 chars once set.
    pub checksum: String,
    pub local_path: String,
    pub r2_path: String,
    pub b2_path: String,
    pub status: BackupStatus,
    /// Fraction of the original size removed by compression, in [0, 1].
    pub compression_ratio: f64,
    pub duration_seconds: Option<u64>,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub job_id: String,
    pub created_by: Option<String>,
    pub notes: String,
}

impl BackupRecord {
    /// New in-progress record with empty paths and checksum.
    pub fn new(kind: BackupKind, tenant_id: Option<Uuid>, filename: &str, job_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            tenant_id,
            filename: filename.to_string(),
            size_bytes: 0,
            checksum: String::new(),
            local_path: String::new(),
            r2_path: String::new(),
            b2_path: String::new(),
            status: BackupStatus::InProgress,
            compression_ratio: 0.0,
            duration_seconds: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            verified_at: None,
            job_id: job_id.to_string(),
            created_by: None,
            notes: String::new(),
        }
    }

    fn ensure_in_progress(&self, target: &str) -> Result<()> {
        if self.status != BackupStatus::InProgress {
            return Err(BackupError::InvalidState(format!(
                "cannot move backup {} from {:?} to {target}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Terminal transition after all mandatory uploads succeeded.
    pub fn mark_completed(&mut self, duration_seconds: u64) -> Result<()> {
        self.ensure_in_progress("Completed")?;
        self.status = BackupStatus::Completed;
        self.duration_seconds = Some(duration_seconds);
        Ok(())
    }

    /// Promotion after the post-upload integrity check passed.
    pub fn mark_verified(&mut self) -> Result<()> {
        if self.status != BackupStatus::Completed {
            return Err(BackupError::InvalidState(format!(
                "cannot verify backup {} in state {:?}",
                self.id, self.status
            )));
        }
        self.status = BackupStatus::Verified;
        self.verified_at = Some(Utc::now());
        Ok(())
    }

    /// Terminal failure transition.
    pub fn mark_failed(&mut self, duration_seconds: u64, notes: &str) -> Result<()> {
        self.ensure_in_progress("Failed")?;
        self.status = BackupStatus::Failed;
        self.duration_seconds = Some(duration_seconds);
        self.notes = format!("Error: {notes}");
        Ok(())
    }

    /// True when every storage path has been cleared by cleanup.
    pub fn all_paths_empty(&self) -> bool {
        self.local_path.is_empty() && self.r2_path.is_empty() && self.b2_path.is_empty()
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Requested restore semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreMode {
    /// Drop existing objects first; destructive.
    Full,
    /// Restore on top of existing data.
    Merge,
    /// Point-in-time recovery; declared but not implemented.
    Pitr,
}

/// Lifecycle status of a restore attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreStatus {
    InProgress,
    Completed,
    Failed,
}

/// One restore attempt against a backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRecord {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub initiated_by: Option<String>,
    pub mode: RestoreMode,
    pub target_timestamp: Option<DateTime<Utc>>,
    pub status: RestoreStatus,
    pub reason: String,
    pub tenant_ids: Vec<Uuid>,
    pub rows_restored: Option<u64>,
    pub duration_seconds: Option<u64>,
    pub error_message: String,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RestoreRecord {
    pub fn new(backup_id: Uuid, mode: RestoreMode, reason: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            backup_id,
            initiated_by: None,
            mode,
            target_timestamp: None,
            status: RestoreStatus::InProgress,
            reason: reason.to_string(),
            tenant_ids: Vec::new(),
            rows_restored: None,
            duration_seconds: None,
            error_message: String::new(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn ensure_in_progress(&self) -> Result<()> {
        if self.status != RestoreStatus::InProgress {
            return Err(BackupError::InvalidState(format!(
                "restore {} already terminal ({:?})",
                self.id, self.status
            )));
        }
        Ok(())
    }

    pub fn mark_completed(&mut self, duration_seconds: u64) -> Result<()> {
        self.ensure_in_progress()?;
        self.status = RestoreStatus::Completed;
        self.duration_seconds = Some(duration_seconds);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, duration_seconds: u64, error: &str) -> Result<()> {
        self.ensure_in_progress()?;
        self.status = RestoreStatus::Failed;
        self.duration_seconds = Some(duration_seconds);
        self.error_message = error.to_string();
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// Category of a monitoring alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    BackupFailure,
    SizeDeviation,
    DurationThreshold,
    StorageCapacity,
    IntegrityFailure,
    RestoreFailure,
}

/// Alert severity ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Acknowledgement state of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

/// One anomaly notification produced by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub details: BTreeMap<String, Value>,
    pub backup_id: Option<Uuid>,
    pub restore_id: Option<Uuid>,
    pub status: AlertStatus,
    /// Channels the notifier successfully delivered on.
    pub notification_channels: Vec<String>,
    pub notification_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AlertRecord {
    pub fn new(kind: AlertKind, severity: AlertSeverity, message: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            message: message.to_string(),
            details: BTreeMap::new(),
            backup_id: None,
            restore_id: None,
            status: AlertStatus::Active,
            notification_channels: Vec::new(),
            notification_sent_at: None,
            created_at: Utc::now(),
            acknowledged_at: None,
            resolved_at: None,
        }
    }

    pub fn acknowledge(&mut self) {
        if self.status == AlertStatus::Active {
            self.status = AlertStatus::Acknowledged;
            self.acknowledged_at = Some(Utc::now());
        }
    }

    pub fn resolve(&mut self) {
        if self.status != AlertStatus::Resolved {
            self.status = AlertStatus::Resolved;
            self.resolved_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_status_transitions_are_monotonic() {
        let mut record = BackupRecord::new(BackupKind::FullDatabase, None, "f.dump.gz.enc", "job");
        assert_eq!(record.status, BackupStatus::InProgress);

        record.mark_completed(12).unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.duration_seconds, Some(12));

        record.mark_verified().unwrap();
        assert_eq!(record.status, BackupStatus::Verified);
        assert!(record.verified_at.is_some());

        // No back-transitions from a terminal state.
        assert!(record.mark_completed(1).is_err());
        assert!(record.mark_failed(1, "nope").is_err());
    }

    #[test]
    fn failed_backup_records_notes_and_duration_once() {
        let mut record = BackupRecord::new(BackupKind::Tenant, Some(Uuid::new_v4()), "t", "job");
        record.mark_failed(7, "pg_dump exploded").unwrap();
        assert_eq!(record.status, BackupStatus::Failed);
        assert_eq!(record.duration_seconds, Some(7));
        assert!(record.notes.contains("pg_dump exploded"));
        assert!(record.mark_verified().is_err());
    }

    #[test]
    fn verify_requires_completed() {
        let mut record = BackupRecord::new(BackupKind::Configuration, None, "c", "job");
        assert!(record.mark_verified().is_err());
    }

    #[test]
    fn restore_terminal_transition_is_single() {
        let mut restore = RestoreRecord::new(Uuid::new_v4(), RestoreMode::Full, "drill");
        restore.mark_completed(30).unwrap();
        assert!(restore.mark_failed(1, "late").is_err());
    }

    #[test]
    fn alert_resolution_sets_timestamp() {
        let mut alert = AlertRecord::new(AlertKind::BackupFailure, AlertSeverity::Critical, "boom");
        alert.acknowledge();
        assert_eq!(alert.status, AlertStatus::Acknowledged);
        alert.resolve();
        assert_eq!(alert.status, AlertStatus::Resolved);
        assert!(alert.resolved_at.is_some());
    }

    #[test]
    fn severity_orders_for_digest_grouping() {
        assert!(AlertSeverity::Critical > AlertSeverity::Error);
        assert!(AlertSeverity::Error > AlertSeverity::Warning);
        assert!(AlertSeverity::Warning > AlertSeverity::Info);
    }
}
