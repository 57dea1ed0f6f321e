//! # Aurum Backup System
//!
//! Enterprise backup and disaster-recovery engine for the Aurum platform.
//!
//! ## Features
//!
//! - **Triple Redundancy**: every backup lands on the local filesystem plus
//!   two S3-compatible object stores (Cloudflare R2 and Backblaze B2)
//! - **Encrypted Artifacts**: streaming gzip(9) plus authenticated
//!   AES-256-GCM, with SHA-256 checksums end to end
//! - **WAL Archiving**: 5-minute write-ahead-log shipping for a 15-minute
//!   recovery-point objective
//! - **Idempotent Scheduling**: TTL locks make task runs and per-tenant
//!   backups at-most-once
//! - **Integrity Verification**: full download verification after upload,
//!   cheap existence/size sweeps hourly
//! - **Anomaly Monitoring**: failure, size-deviation, duration and capacity
//!   alerts fanned out to in-app/email/SMS/webhook channels
//! - **Disaster Recovery**: a seven-step runbook with a one-hour
//!   recovery-time objective, plus monthly automated test restores
//!
//! ## Architecture
//!
//! - `codec`: streaming compression, encryption, and checksums
//! - `storage`: the storage-backend abstraction and its three backends
//! - `dump`: logical dump/restore via the PostgreSQL client tools
//! - `catalog`: durable records of backups, restores, and alerts
//! - `locks`: TTL named locks over an external key-value store
//! - `orchestrator`: the task pipelines
//! - `monitor`: post-hoc anomaly detection and alert dispatch
//! - `scheduler`: the task catalogue (cron expressions, retries, lock TTLs)

#![warn(clippy::all)]

pub mod catalog;
pub mod codec;
pub mod config;
pub mod db;
pub mod dump;
pub mod error;
pub mod locks;
pub mod monitor;
pub mod notify;
pub mod orchestrator;
pub mod records;
pub mod scheduler;
pub mod storage;
pub mod verify;

// Re-export main types for convenience.
pub use catalog::{BackupQuery, CatalogHandle, CatalogStore, MemoryCatalog};
pub use codec::{ChecksumAlgorithm, EncryptionKey};
pub use config::{BackupSettings, MonitorThresholds};
pub use error::{BackupError, Result};
pub use locks::{LockKv, LockService, MemoryLockKv, RedisLockKv};
pub use monitor::Monitor;
pub use orchestrator::{BackupContext, Collaborators, TaskOutcome};
pub use records::{
    AlertKind, AlertRecord, AlertSeverity, AlertStatus, BackupKind, BackupRecord, BackupStatus,
    RestoreMode, RestoreRecord, RestoreStatus,
};
pub use scheduler::{TaskKind, TaskRunner};
pub use storage::{StorageBackend, StorageSet, StorageUsage};

/// Version information for the backup engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports.
pub mod prelude {
    //! Commonly used types and traits.

    pub use crate::catalog::{BackupQuery, CatalogHandle, CatalogStore};
    pub use crate::codec::EncryptionKey;
    pub use crate::config::BackupSettings;
    pub use crate::error::{BackupError, Result};
    pub use crate::orchestrator::{BackupContext, Collaborators, TaskOutcome};
    pub use crate::records::{BackupKind, BackupRecord, BackupStatus};
    pub use crate::scheduler::TaskKind;
    pub use crate::storage::StorageBackend;
}
