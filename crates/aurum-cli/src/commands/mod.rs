pub mod dr_runbook;
pub mod trigger_backup;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

use aurum_backup::notify::{HttpNotifier, StaticIdentityDirectory};
use aurum_backup::orchestrator::{configuration, full, tenant};
use aurum_backup::{
    BackupContext, BackupSettings, Collaborators, MemoryCatalog, TaskKind, TaskRunner,
};

/// Build an engine context from the environment.
///
/// When the CLI runs embedded in the platform, the host supplies its catalog
/// store and notification fabric; standalone invocations fall back to an
/// in-memory catalog and the webhook-only notifier.
pub async fn build_context() -> anyhow::Result<BackupContext> {
    let settings = BackupSettings::from_env()?;
    let collaborators = Collaborators {
        catalog: Arc::new(MemoryCatalog::new()),
        notifier: Arc::new(HttpNotifier::new(reqwest::Client::new())),
        directory: Arc::new(StaticIdentityDirectory::new(Vec::new())),
    };
    Ok(BackupContext::initialize(settings, collaborators).await?)
}

/// Broker stand-in for standalone runs: spawns the pipeline on the local
/// runtime and hands the task id back immediately. Production deployments
/// submit to the platform's task broker instead.
pub struct LocalTaskRunner {
    ctx: BackupContext,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalTaskRunner {
    pub fn new(ctx: BackupContext) -> Self {
        Self {
            ctx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Keep the process alive until every submitted task has finished.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl TaskRunner for LocalTaskRunner {
    async fn submit(&self, task: TaskKind, args: Value) -> aurum_backup::Result<String> {
        let ctx = self.ctx.clone();
        let task_id = Uuid::new_v4().to_string();
        let id = task_id.clone();

        let handle = tokio::spawn(async move {
            let result = match task {
                TaskKind::DailyFullBackup => {
                    full::daily_full_database_backup(&ctx, &id, Some("cli"))
                        .await
                        .map(|_| ())
                }
                TaskKind::WeeklyTenantBackup => {
                    let tenant_id = args
                        .get("tenant_id")
                        .and_then(Value::as_str)
                        .and_then(|s| Uuid::parse_str(s).ok());
                    match tenant_id {
                        Some(tenant_id) => tenant::perform_tenant_backup(&ctx, &id, tenant_id)
                            .await
                            .map(|_| ()),
                        None => tenant::weekly_per_tenant_backup(&ctx, &id).await.map(|_| ()),
                    }
                }
                TaskKind::ConfigurationBackup => {
                    configuration::configuration_backup(&ctx, &id, Some("cli"))
                        .await
                        .map(|_| ())
                }
                other => {
                    warn!(task = other.name(), "task not runnable from the CLI");
                    Ok(())
                }
            };
            if let Err(e) = result {
                error!(task = task.name(), %e, "queued backup task failed");
            }
        });

        self.handles.lock().unwrap().push(handle);
        Ok(task_id)
    }
}
