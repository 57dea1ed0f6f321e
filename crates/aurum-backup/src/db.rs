//! Administrative SQL access to the platform database.
//!
//! The engine needs a handful of cross-tenant statements outside the dump
//! tools: relaxing `FORCE ROW LEVEL SECURITY` around full dumps, creating
//! and dropping throwaway test-restore databases, and the integrity queries
//! run against a restored copy. Everything goes through [`DatabaseAdmin`] so
//! pipelines can be exercised against a scripted fake.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{BackupError, Result};

/// Narrow admin-SQL interface consumed by the engine.
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Execute a statement; returns rows affected. Statements run outside
    /// any enclosing transaction so DDL such as `ALTER TABLE … ROW LEVEL
    /// SECURITY` commits immediately.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Run a query returning a single integer scalar.
    async fn query_i64(&self, sql: &str) -> Result<i64>;

    /// Run a query returning text-typed rows.
    async fn query_rows(&self, sql: &str) -> Result<Vec<Vec<String>>>;

    /// A handle with the same credentials against another database.
    async fn for_database(&self, name: &str) -> Result<Arc<dyn DatabaseAdmin>>;
}

/// sqlx-backed implementation against PostgreSQL.
pub struct PgAdmin {
    pool: PgPool,
    config: DatabaseConfig,
}

impl PgAdmin {
    pub async fn connect(config: DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&config.url())
            .await?;
        Ok(Self { pool, config })
    }
}

#[async_trait]
impl DatabaseAdmin for PgAdmin {
    async fn execute(&self, sql: &str) -> Result<u64> {
        let result = sqlx::query(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn query_i64(&self, sql: &str) -> Result<i64> {
        let value: i64 = sqlx::query_scalar(sql).fetch_one(&self.pool).await?;
        Ok(value)
    }

    async fn query_rows(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(row.columns().len());
            for i in 0..row.columns().len() {
                let value: Option<String> = row.try_get(i)?;
                values.push(value.unwrap_or_default());
            }
            result.push(values);
        }
        Ok(result)
    }

    async fn for_database(&self, name: &str) -> Result<Arc<dyn DatabaseAdmin>> {
        let admin = PgAdmin::connect(self.config.with_database(name)).await?;
        Ok(Arc::new(admin))
    }
}

/// Reject identifiers that cannot be safely spliced into DDL.
pub fn validate_identifier(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(BackupError::InvalidState(format!(
            "unsafe SQL identifier: {name}"
        )))
    }
}

/// Create a database. `CREATE DATABASE` cannot be parameterized, so the
/// name is validated before splicing.
pub async fn create_database(admin: &dyn DatabaseAdmin, name: &str) -> Result<()> {
    validate_identifier(name)?;
    info!(database = name, "creating database");
    admin.execute(&format!("CREATE DATABASE {name};")).await?;
    Ok(())
}

/// Drop a database, disconnecting lingering sessions first.
pub async fn drop_database(admin: &dyn DatabaseAdmin, name: &str) -> Result<()> {
    validate_identifier(name)?;
    info!(database = name, "dropping database");
    let _ = admin
        .execute(&format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = '{name}';"
        ))
        .await;
    admin
        .execute(&format!("DROP DATABASE IF EXISTS {name};"))
        .await?;
    Ok(())
}

/// A tenant known to the host application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRef {
    pub id: Uuid,
    pub name: String,
}

/// Enumeration of tenants for the per-tenant backup batch.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn active_tenants(&self) -> Result<Vec<TenantRef>>;
    async fn find_tenant(&self, id: Uuid) -> Result<Option<TenantRef>>;
}

/// Tenant directory reading the host's `tenants` table.
pub struct DbTenantDirectory {
    admin: Arc<dyn DatabaseAdmin>,
}

impl DbTenantDirectory {
    pub fn new(admin: Arc<dyn DatabaseAdmin>) -> Self {
        Self { admin }
    }

    fn parse(rows: Vec<Vec<String>>) -> Vec<TenantRef> {
        rows.into_iter()
            .filter_map(|row| {
                let id = row.first().and_then(|v| Uuid::parse_str(v).ok())?;
                let name = row.get(1).cloned().unwrap_or_default();
                Some(TenantRef { id, name })
            })
            .collect()
    }
}

#[async_trait]
impl TenantDirectory for DbTenantDirectory {
    async fn active_tenants(&self) -> Result<Vec<TenantRef>> {
        let rows = self
            .admin
            .query_rows("SELECT id::text, name FROM tenants WHERE is_active = true ORDER BY name;")
            .await?;
        Ok(Self::parse(rows))
    }

    async fn find_tenant(&self, id: Uuid) -> Result<Option<TenantRef>> {
        let rows = self
            .admin
            .query_rows(&format!(
                "SELECT id::text, name FROM tenants WHERE id = '{id}';"
            ))
            .await?;
        Ok(Self::parse(rows).into_iter().next())
    }
}

/// Fixed tenant list for tests and manual runs.
pub struct StaticTenantDirectory {
    tenants: Vec<TenantRef>,
}

impl StaticTenantDirectory {
    pub fn new(tenants: Vec<TenantRef>) -> Self {
        Self { tenants }
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn active_tenants(&self) -> Result<Vec<TenantRef>> {
        Ok(self.tenants.clone())
    }

    async fn find_tenant(&self, id: Uuid) -> Result<Option<TenantRef>> {
        Ok(self.tenants.iter().find(|t| t.id == id).cloned())
    }
}
