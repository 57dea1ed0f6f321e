//! Logical dump and restore via the PostgreSQL client tools.
//!
//! This is the one place the engine shells out. Argument vectors are built
//! explicitly, credentials travel via `PGPASSWORD`, and both tools run under
//! hard timeouts (1 h dump, 2 h restore). Dumps use plain SQL text (`-Fp`)
//! so gzip level 9 gets its 70-90 % reduction.

use std::io::Write as _;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::{validate_identifier, DatabaseAdmin};
use crate::error::{BackupError, Result};

const DUMP_TIMEOUT: Duration = Duration::from_secs(3600);
const RESTORE_TIMEOUT: Duration = Duration::from_secs(7200);
/// Upper bound on stderr carried into error messages.
const STDERR_SNIPPET: usize = 8 * 1024;

/// Driver interface for logical dumps and restores.
#[async_trait]
pub trait DumpDriver: Send + Sync {
    /// Dump the whole database to `output_path` as plain SQL.
    async fn full_dump(&self, output_path: &Path) -> Result<()>;

    /// Dump one tenant's slice of the tenant-scoped tables.
    async fn tenant_dump(&self, output_path: &Path, tenant_id: Uuid) -> Result<()>;

    /// Restore a dump with 4 parallel workers. `clean` drops existing
    /// objects first (destructive). `target_database` overrides the
    /// configured database name.
    async fn restore(&self, dump_path: &Path, clean: bool, target_database: Option<&str>)
        -> Result<()>;
}

/// Production driver wrapping `pg_dump` / `pg_restore`.
pub struct PgDumpDriver {
    database: DatabaseConfig,
    admin: Arc<dyn DatabaseAdmin>,
    rls_force_tables: Vec<String>,
    tenant_tables: Vec<String>,
}

impl PgDumpDriver {
    pub fn new(
        database: DatabaseConfig,
        admin: Arc<dyn DatabaseAdmin>,
        rls_force_tables: Vec<String>,
        tenant_tables: Vec<String>,
    ) -> Self {
        Self {
            database,
            admin,
            rls_force_tables,
            tenant_tables,
        }
    }

    fn connection_args(&self, database: &str) -> Vec<String> {
        vec![
            "-h".to_string(),
            self.database.host.clone(),
            "-p".to_string(),
            self.database.port.clone(),
            "-U".to_string(),
            self.database.user.clone(),
            "-d".to_string(),
            database.to_string(),
        ]
    }

    async fn run_tool(
        &self,
        tool: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<std::process::Output> {
        let mut command = Command::new(tool);
        command
            .args(args)
            .env("PGPASSWORD", &self.database.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| {
                BackupError::Dump(format!(
                    "{tool} timed out after {} seconds",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| BackupError::Dump(format!("{tool} failed to start: {e}")))?;
        Ok(output)
    }

    /// Relax `FORCE ROW LEVEL SECURITY` so the dump can read every tenant's
    /// rows. Must commit outside any ambient transaction; the admin adapter
    /// guarantees that.
    async fn disable_force_rls(&self) -> Result<()> {
        for table in &self.rls_force_tables {
            validate_identifier(table)?;
            info!(table, "temporarily disabling FORCE ROW LEVEL SECURITY");
            self.admin
                .execute(&format!("ALTER TABLE {table} NO FORCE ROW LEVEL SECURITY;"))
                .await?;
        }
        Ok(())
    }

    /// Re-enable `FORCE ROW LEVEL SECURITY`. Failures here are logged, not
    /// fatal: the dump result stands either way and operators must know.
    async fn restore_force_rls(&self) {
        for table in &self.rls_force_tables {
            if validate_identifier(table).is_err() {
                continue;
            }
            match self
                .admin
                .execute(&format!("ALTER TABLE {table} FORCE ROW LEVEL SECURITY;"))
                .await
            {
                Ok(_) => info!(table, "re-enabled FORCE ROW LEVEL SECURITY"),
                Err(e) => error!(table, %e, "failed to re-enable FORCE ROW LEVEL SECURITY"),
            }
        }
    }
}

fn stderr_snippet(output: &std::process::Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    text.chars().take(STDERR_SNIPPET).collect()
}

#[async_trait]
impl DumpDriver for PgDumpDriver {
    async fn full_dump(&self, output_path: &Path) -> Result<()> {
        self.disable_force_rls().await?;

        let mut args = vec![
            "-Fp".to_string(),
            "-v".to_string(),
            "--no-owner".to_string(),
            "--no-acl".to_string(),
        ];
        args.extend(self.connection_args(&self.database.name));
        args.push("-f".to_string());
        args.push(output_path.display().to_string());

        info!(database = %self.database.name, "starting pg_dump");
        let result = self.run_tool("pg_dump", &args, DUMP_TIMEOUT).await;
        // Always re-enable FORCE RLS, even when the dump failed.
        self.restore_force_rls().await;

        let output = result?;
        if output.status.success() {
            info!(output = %output_path.display(), "pg_dump completed");
            Ok(())
        } else {
            Err(BackupError::Dump(format!(
                "pg_dump exited with {}: {}",
                output.status,
                stderr_snippet(&output)
            )))
        }
    }

    async fn tenant_dump(&self, output_path: &Path, tenant_id: Uuid) -> Result<()> {
        // Session preamble so the host's row-level policies filter the
        // export to this tenant. The file must outlive the child process.
        let mut preamble = tempfile::NamedTempFile::new()?;
        writeln!(preamble, "SET app.current_tenant = '{tenant_id}';")?;

        let mut args = vec![
            "-Fp".to_string(),
            "-v".to_string(),
            "--no-owner".to_string(),
            "--no-acl".to_string(),
        ];
        args.extend(self.connection_args(&self.database.name));
        for table in &self.tenant_tables {
            args.push("-t".to_string());
            args.push(table.clone());
        }
        args.push("-f".to_string());
        args.push(output_path.display().to_string());

        info!(
            %tenant_id,
            tables = self.tenant_tables.len(),
            "starting tenant pg_dump"
        );
        let output = self.run_tool("pg_dump", &args, DUMP_TIMEOUT).await?;
        drop(preamble);

        if output.status.success() {
            info!(%tenant_id, output = %output_path.display(), "tenant pg_dump completed");
            Ok(())
        } else {
            Err(BackupError::Dump(format!(
                "tenant pg_dump for {tenant_id} exited with {}: {}",
                output.status,
                stderr_snippet(&output)
            )))
        }
    }

    async fn restore(
        &self,
        dump_path: &Path,
        clean: bool,
        target_database: Option<&str>,
    ) -> Result<()> {
        let database = target_database.unwrap_or(&self.database.name);

        let mut args = vec![
            "-v".to_string(),
            "--no-owner".to_string(),
            "--no-acl".to_string(),
            "-j".to_string(),
            "4".to_string(),
        ];
        args.extend(self.connection_args(database));
        if clean {
            warn!("pg_restore running with --clean, existing objects will be dropped");
            args.push("--clean".to_string());
        }
        args.push(dump_path.display().to_string());

        info!(database, "starting pg_restore");
        let output = self
            .run_tool("pg_restore", &args, RESTORE_TIMEOUT)
            .await
            .map_err(|e| match e {
                BackupError::Dump(msg) => BackupError::Restore(msg),
                other => other,
            })?;

        if output.status.success() {
            info!(database, "pg_restore completed");
            return Ok(());
        }

        // pg_restore exits non-zero when objects already exist (or are
        // missing under --clean); those are warnings, not failures.
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already exists") || stderr.contains("does not exist") {
            warn!(database, "pg_restore completed with warnings");
            return Ok(());
        }

        Err(BackupError::Restore(format!(
            "pg_restore exited with {}: {}",
            output.status,
            stderr_snippet(&output)
        )))
    }
}
