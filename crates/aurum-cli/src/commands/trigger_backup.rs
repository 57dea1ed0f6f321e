use anyhow::{bail, Context};
use clap::{Args, ValueEnum};
use serde_json::json;
use uuid::Uuid;

use aurum_backup::orchestrator::{configuration, full, run_with_retries, tenant};
use aurum_backup::{TaskKind, TaskOutcome, TaskRunner};

use super::LocalTaskRunner;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackupType {
    Full,
    Tenant,
    Config,
}

impl BackupType {
    fn task(self) -> TaskKind {
        match self {
            BackupType::Full => TaskKind::DailyFullBackup,
            BackupType::Tenant => TaskKind::WeeklyTenantBackup,
            BackupType::Config => TaskKind::ConfigurationBackup,
        }
    }
}

#[derive(Args)]
pub struct TriggerBackupArgs {
    /// Type of backup to perform
    #[arg(long = "type", value_enum, default_value = "full")]
    backup_type: BackupType,

    /// Tenant ID for tenant-specific backups
    #[arg(long)]
    tenant_id: Option<Uuid>,

    /// Queue the backup and return immediately with a task id
    #[arg(long = "async")]
    run_async: bool,
}

pub async fn execute(args: TriggerBackupArgs) -> anyhow::Result<()> {
    if matches!(args.backup_type, BackupType::Tenant) && args.tenant_id.is_none() {
        bail!("--tenant-id is required for tenant backups");
    }

    let ctx = super::build_context().await?;

    if args.run_async {
        let runner = LocalTaskRunner::new(ctx);
        let payload = match args.tenant_id {
            Some(tenant_id) => json!({ "tenant_id": tenant_id.to_string() }),
            None => json!({}),
        };
        let task_id = runner.submit(args.backup_type.task(), payload).await?;
        println!("Backup task queued: {task_id}");
        // Standalone mode has no external broker workers; stay alive until
        // the spawned task completes.
        runner.drain().await;
        return Ok(());
    }

    println!("Triggering {:?} backup...", args.backup_type);
    let task_id = Uuid::new_v4().to_string();
    let outcome = run(&ctx, &args, &task_id).await?;
    println!("{outcome}");
    Ok(())
}

async fn run(
    ctx: &aurum_backup::BackupContext,
    args: &TriggerBackupArgs,
    task_id: &str,
) -> anyhow::Result<String> {
    match args.backup_type {
        BackupType::Full => {
            let outcome = run_with_retries(TaskKind::DailyFullBackup, |_| {
                full::daily_full_database_backup(ctx, task_id, Some("cli"))
            })
            .await
            .context("full database backup failed")?;
            Ok(describe(outcome, "Full database backup"))
        }
        BackupType::Tenant => {
            let tenant_id = args.tenant_id.expect("validated above");
            let outcome = run_with_retries(TaskKind::WeeklyTenantBackup, |_| {
                tenant::perform_tenant_backup(ctx, task_id, tenant_id)
            })
            .await
            .context("tenant backup failed")?;
            match outcome {
                TaskOutcome::Completed(ids) if !ids.is_empty() => {
                    Ok(format!("Tenant backup completed: {}", ids[0]))
                }
                TaskOutcome::Completed(_) => bail!("tenant backup produced no artifact"),
                TaskOutcome::Skipped => Ok("Tenant backup skipped: already running".to_string()),
            }
        }
        BackupType::Config => {
            let outcome = run_with_retries(TaskKind::ConfigurationBackup, |_| {
                configuration::configuration_backup(ctx, task_id, Some("cli"))
            })
            .await
            .context("configuration backup failed")?;
            Ok(describe(outcome, "Configuration backup"))
        }
    }
}

fn describe(outcome: TaskOutcome<Uuid>, label: &str) -> String {
    match outcome {
        TaskOutcome::Completed(id) => format!("{label} completed: {id}"),
        TaskOutcome::Skipped => format!("{label} skipped: already running"),
    }
}
