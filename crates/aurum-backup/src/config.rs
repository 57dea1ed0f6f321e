//! Environment-driven configuration for the backup engine.
//!
//! Every service the engine talks to (encryption key, storage buckets,
//! database, lock store, webhook) is configured here and passed explicitly
//! to [`crate::orchestrator::BackupContext`]; there are no module-level
//! singletons.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Result};

/// Connection parameters for the platform database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: String,
    pub name: String,
    pub user: String,
    /// Passed to child processes via `PGPASSWORD`, never on the command line.
    pub password: String,
}

impl DatabaseConfig {
    /// Connection URL for the admin SQL pool.
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }

    /// Same credentials against a different database name.
    pub fn with_database(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }
}

/// Credentials for the Cloudflare R2 bucket (S3-compatible backend A).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct R2Config {
    pub account_id: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Optional bucket quota used to derive capacity reports; R2 does not
    /// expose one through the S3 API.
    pub quota_bytes: Option<u64>,
}

impl R2Config {
    pub fn endpoint_url(&self) -> String {
        format!("https://{}.r2.cloudflarestorage.com", self.account_id)
    }
}

/// Credentials for the Backblaze B2 bucket (S3-compatible backend B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct B2Config {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub quota_bytes: Option<u64>,
}

impl B2Config {
    pub fn endpoint_url(&self) -> String {
        format!("https://s3.{}.backblazeb2.com", self.region)
    }
}

/// Anomaly-detection thresholds. Defaults are load-bearing: the alerting
/// contract documents 20 %/50 % size and 50 %/100 % duration deviations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorThresholds {
    /// Size deviation fraction that triggers a WARNING alert.
    pub size_warning: f64,
    /// Size deviation fraction that escalates to CRITICAL.
    pub size_critical: f64,
    /// Duration deviation fraction that triggers a WARNING alert.
    pub duration_warning: f64,
    /// Duration deviation fraction that escalates to CRITICAL.
    pub duration_critical: f64,
    /// Storage usage fraction that triggers a WARNING alert.
    pub capacity_warning: f64,
    /// Storage usage fraction that escalates to CRITICAL.
    pub capacity_critical: f64,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            size_warning: 0.20,
            size_critical: 0.50,
            duration_warning: 0.50,
            duration_critical: 1.00,
            capacity_warning: 0.80,
            capacity_critical: 0.90,
        }
    }
}

/// Full configuration surface of the engine.
#[derive(Debug, Clone)]
pub struct BackupSettings {
    /// URL-safe base64 encoding of the 32-byte AES-256 key.
    pub encryption_key: String,
    /// Base directory of the local storage backend.
    pub local_path: PathBuf,
    pub database: DatabaseConfig,
    pub r2: Option<R2Config>,
    pub b2: Option<B2Config>,
    /// Directory PostgreSQL's `archive_command` copies completed WAL
    /// segments into.
    pub wal_archive_dir: PathBuf,
    /// Project root scanned by the configuration backup.
    pub project_root: PathBuf,
    pub alert_webhook_url: Option<String>,
    pub health_check_url: Option<String>,
    pub k8s_namespace: String,
    /// Redis URL for the lock store.
    pub redis_url: String,
    /// Tables carrying `FORCE ROW LEVEL SECURITY` that the full dump must
    /// temporarily relax.
    pub rls_force_tables: Vec<String>,
    /// Allow-list of tenant-scoped tables exported by per-tenant dumps.
    pub tenant_tables: Vec<String>,
    /// Tables whose existence is asserted after a test restore.
    pub integrity_tables: Vec<String>,
    pub thresholds: MonitorThresholds,
}

impl BackupSettings {
    /// Load settings from the process environment.
    ///
    /// `BACKUP_ENCRYPTION_KEY` is mandatory; object-storage backends are
    /// optional and simply absent from the backend set when unconfigured.
    pub fn from_env() -> Result<Self> {
        let encryption_key = require_env("BACKUP_ENCRYPTION_KEY")?;

        let database = DatabaseConfig {
            host: env_or("DATABASE_HOST", "localhost"),
            port: env_or("DATABASE_PORT", "5432"),
            name: env_or("DATABASE_NAME", "aurum"),
            user: env_or("DATABASE_USER", "aurum"),
            password: env::var("DATABASE_PASSWORD").unwrap_or_default(),
        };

        let r2 = match (
            env::var("R2_ACCOUNT_ID"),
            env::var("R2_BUCKET_NAME"),
            env::var("R2_ACCESS_KEY_ID"),
            env::var("R2_SECRET_ACCESS_KEY"),
        ) {
            (Ok(account_id), Ok(bucket), Ok(access_key_id), Ok(secret_access_key)) => {
                Some(R2Config {
                    account_id,
                    bucket,
                    access_key_id,
                    secret_access_key,
                    quota_bytes: env_u64("R2_QUOTA_BYTES"),
                })
            }
            _ => None,
        };

        let b2 = match (
            env::var("B2_BUCKET_NAME"),
            env::var("B2_REGION"),
            env::var("B2_ACCESS_KEY_ID"),
            env::var("B2_SECRET_ACCESS_KEY"),
        ) {
            (Ok(bucket), Ok(region), Ok(access_key_id), Ok(secret_access_key)) => Some(B2Config {
                bucket,
                region,
                access_key_id,
                secret_access_key,
                quota_bytes: env_u64("B2_QUOTA_BYTES"),
            }),
            _ => None,
        };

        Ok(Self {
            encryption_key,
            local_path: PathBuf::from(env_or("BACKUP_LOCAL_PATH", "/var/backups/aurum")),
            database,
            r2,
            b2,
            wal_archive_dir: PathBuf::from(env_or(
                "PG_WAL_ARCHIVE_DIR",
                "/var/lib/postgresql/wal_archive",
            )),
            project_root: PathBuf::from(env_or("AURUM_PROJECT_ROOT", ".")),
            alert_webhook_url: env::var("BACKUP_ALERT_WEBHOOK_URL").ok(),
            health_check_url: env::var("HEALTH_CHECK_URL").ok(),
            k8s_namespace: env_or("K8S_NAMESPACE", "default"),
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            rls_force_tables: vec!["tenants".to_string()],
            tenant_tables: default_tenant_tables(),
            integrity_tables: default_integrity_tables(),
            thresholds: MonitorThresholds::default(),
        })
    }

    /// Retention window for local copies of backups.
    pub fn local_retention(&self) -> Duration {
        Duration::from_secs(30 * 24 * 3600)
    }

    /// Retention window for cloud copies of backups.
    pub fn cloud_retention(&self) -> Duration {
        Duration::from_secs(365 * 24 * 3600)
    }

    /// Retention window for archived WAL segments in cloud storage.
    pub fn wal_retention(&self) -> Duration {
        Duration::from_secs(30 * 24 * 3600)
    }
}

fn require_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| {
        BackupError::Configuration(format!("required environment variable {key} is not set"))
    })
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn default_tenant_tables() -> Vec<String> {
    [
        "inventory_categories",
        "inventory_items",
        "sales",
        "sale_items",
        "crm_customer",
        "crm_loyaltytier",
        "crm_loyaltytransaction",
        "core_branch",
        "core_terminal",
        "repair_repairorder",
        "repair_repairorderphoto",
        "procurement_supplier",
        "procurement_purchaseorder",
        "procurement_purchaseorderitem",
        "pricing_pricingrule",
        "notifications_notification",
        "core_tenantsettings",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_integrity_tables() -> Vec<String> {
    [
        "tenants",
        "users",
        "core_branch",
        "inventory_items",
        "sales",
        "crm_customer",
        "backup_records",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
