//! Task catalogue: what runs when, with which retry policy and lock TTL.
//!
//! Dispatch itself belongs to the external broker; this module is the single
//! source of truth it reads. Cron expressions use the 6-field form with a
//! leading seconds column.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;

use crate::error::{BackupError, Result};

/// The periodic and manually triggered tasks of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    DailyFullBackup,
    WeeklyTenantBackup,
    WalArchive,
    ConfigurationBackup,
    Cleanup,
    StorageIntegrity,
    TestRestore,
    CapacityCheck,
    AlertDigest,
    ResolvedAlertCleanup,
}

/// Retry behavior after a failed run.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::from_secs(0),
        }
    }
}

impl TaskKind {
    pub const ALL: [TaskKind; 10] = [
        TaskKind::DailyFullBackup,
        TaskKind::WeeklyTenantBackup,
        TaskKind::WalArchive,
        TaskKind::ConfigurationBackup,
        TaskKind::Cleanup,
        TaskKind::StorageIntegrity,
        TaskKind::TestRestore,
        TaskKind::CapacityCheck,
        TaskKind::AlertDigest,
        TaskKind::ResolvedAlertCleanup,
    ];

    /// Stable task name, used in lock keys and broker routing.
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::DailyFullBackup => "daily_full_database_backup",
            TaskKind::WeeklyTenantBackup => "weekly_tenant_backup",
            TaskKind::WalArchive => "continuous_wal_archiving",
            TaskKind::ConfigurationBackup => "configuration_backup",
            TaskKind::Cleanup => "cleanup_old_backups",
            TaskKind::StorageIntegrity => "verify_storage_integrity",
            TaskKind::TestRestore => "automated_test_restore",
            TaskKind::CapacityCheck => "monitor_storage_capacity",
            TaskKind::AlertDigest => "send_alert_digest",
            TaskKind::ResolvedAlertCleanup => "cleanup_resolved_alerts",
        }
    }

    /// Cron expression (seconds minute hour day-of-month month day-of-week).
    pub fn cron_expr(&self) -> &'static str {
        match self {
            TaskKind::DailyFullBackup => "0 0 2 * * *",
            TaskKind::WeeklyTenantBackup => "0 0 3 * * SUN",
            TaskKind::WalArchive => "0 */5 * * * *",
            TaskKind::ConfigurationBackup => "0 0 4 * * *",
            TaskKind::Cleanup => "0 0 5 * * *",
            TaskKind::StorageIntegrity => "0 0 * * * *",
            TaskKind::TestRestore => "0 0 6 1 * *",
            TaskKind::CapacityCheck => "0 30 * * * *",
            TaskKind::AlertDigest => "0 0 8 * * *",
            TaskKind::ResolvedAlertCleanup => "0 15 5 * * *",
        }
    }

    /// TTL of the task-run lock: the task's maximum expected duration.
    pub fn lock_ttl(&self) -> Duration {
        match self {
            TaskKind::DailyFullBackup => Duration::from_secs(2 * 3600),
            TaskKind::WeeklyTenantBackup => Duration::from_secs(30 * 60),
            TaskKind::WalArchive => Duration::from_secs(10 * 60),
            TaskKind::ConfigurationBackup => Duration::from_secs(30 * 60),
            TaskKind::Cleanup => Duration::from_secs(3600),
            TaskKind::StorageIntegrity => Duration::from_secs(3600),
            TaskKind::TestRestore => Duration::from_secs(3 * 3600),
            TaskKind::CapacityCheck => Duration::from_secs(15 * 60),
            TaskKind::AlertDigest => Duration::from_secs(15 * 60),
            TaskKind::ResolvedAlertCleanup => Duration::from_secs(15 * 60),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            TaskKind::WalArchive => RetryPolicy {
                max_retries: 3,
                delay: Duration::from_secs(60),
            },
            // Disaster drills and test restores must not loop.
            TaskKind::TestRestore => RetryPolicy::none(),
            _ => RetryPolicy {
                max_retries: 3,
                delay: Duration::from_secs(300),
            },
        }
    }

    pub fn schedule(&self) -> Result<Schedule> {
        Schedule::from_str(self.cron_expr()).map_err(|e| {
            BackupError::Configuration(format!(
                "invalid cron expression for {}: {e}",
                self.name()
            ))
        })
    }

    /// Next fire time strictly after `after`.
    pub fn next_run(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        Ok(self.schedule()?.after(&after).next())
    }
}

/// External broker interface: enqueue a task, get its id back.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn submit(&self, task: TaskKind, args: Value) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_task_has_a_parseable_schedule() {
        for task in TaskKind::ALL {
            task.schedule()
                .unwrap_or_else(|e| panic!("{} schedule invalid: {e}", task.name()));
        }
    }

    #[test]
    fn wal_archiving_fires_every_five_minutes() {
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let next = TaskKind::WalArchive.next_run(base).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap());
    }

    #[test]
    fn daily_backup_fires_at_two() {
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();
        let next = TaskKind::DailyFullBackup.next_run(base).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 2, 0, 0).unwrap());
    }

    #[test]
    fn retry_policies_follow_the_task_table() {
        let daily = TaskKind::DailyFullBackup.retry_policy();
        assert_eq!(daily.max_retries, 3);
        assert_eq!(daily.delay, Duration::from_secs(300));

        let wal = TaskKind::WalArchive.retry_policy();
        assert_eq!(wal.max_retries, 3);
        assert_eq!(wal.delay, Duration::from_secs(60));

        assert_eq!(TaskKind::TestRestore.retry_policy().max_retries, 0);
    }

    #[test]
    fn lock_ttls_bound_task_duration() {
        assert_eq!(
            TaskKind::DailyFullBackup.lock_ttl(),
            Duration::from_secs(7200)
        );
        assert_eq!(
            TaskKind::WeeklyTenantBackup.lock_ttl(),
            Duration::from_secs(1800)
        );
    }
}
