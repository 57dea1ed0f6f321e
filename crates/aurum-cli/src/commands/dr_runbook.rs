use anyhow::Context;
use clap::Args;
use uuid::Uuid;

use aurum_backup::orchestrator::runbook;

#[derive(Args)]
pub struct DrRunbookArgs {
    /// Restore a specific backup instead of the latest full backup
    #[arg(long)]
    backup_id: Option<Uuid>,

    /// Reason recorded on the restore log
    #[arg(long, default_value = "Disaster recovery initiated")]
    reason: String,
}

pub async fn execute(args: DrRunbookArgs) -> anyhow::Result<()> {
    let ctx = super::build_context().await?;

    println!("Executing disaster recovery runbook...");
    let report = runbook::execute_disaster_recovery_runbook(&ctx, args.backup_id, &args.reason)
        .await
        .context("disaster recovery runbook failed")?;

    for step in &report.steps {
        println!(
            "  step {}: {} [{}] ({:.1}s)",
            step.step, step.name, step.status, step.duration_seconds
        );
    }
    println!(
        "Disaster recovery completed in {}s (RTO {}); restore log {}",
        report.duration_seconds,
        if report.rto_met { "met" } else { "MISSED" },
        report.restore_id
    );
    Ok(())
}
