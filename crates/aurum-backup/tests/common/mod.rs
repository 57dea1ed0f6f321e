//! Shared test harness: scripted dump driver, fake admin SQL, and a
//! three-backend storage set rooted in temp directories.
#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use uuid::Uuid;

use aurum_backup::catalog::{CatalogHandle, MemoryCatalog};
use aurum_backup::codec::EncryptionKey;
use aurum_backup::config::{BackupSettings, DatabaseConfig, MonitorThresholds};
use aurum_backup::db::{DatabaseAdmin, StaticTenantDirectory, TenantRef};
use aurum_backup::dump::DumpDriver;
use aurum_backup::error::{BackupError, Result};
use aurum_backup::locks::{LockService, MemoryLockKv};
use aurum_backup::monitor::Monitor;
use aurum_backup::notify::{Recipient, RecordingNotifier, StaticIdentityDirectory};
use aurum_backup::orchestrator::BackupContext;
use aurum_backup::storage::local::LocalStorage;
use aurum_backup::storage::{StorageBackend, StorageSet, StorageUsage};

/// Storage backend with an overridable name and scriptable upload failures,
/// delegating to a tempdir-rooted [`LocalStorage`].
#[derive(Debug)]
pub struct TestBackend {
    name: String,
    inner: LocalStorage,
    fail_uploads: bool,
}

impl TestBackend {
    pub fn new(name: &str, base: &Path, fail_uploads: bool) -> Self {
        Self {
            name: name.to_string(),
            inner: LocalStorage::new(base).unwrap(),
            fail_uploads,
        }
    }
}

#[async_trait]
impl StorageBackend for TestBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> bool {
        if self.fail_uploads {
            return false;
        }
        self.inner.upload(local_path, remote_path).await
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> bool {
        self.inner.download(remote_path, local_path).await
    }

    async fn exists(&self, remote_path: &str) -> bool {
        self.inner.exists(remote_path).await
    }

    async fn delete(&self, remote_path: &str) -> bool {
        self.inner.delete(remote_path).await
    }

    async fn get_size(&self, remote_path: &str) -> Option<u64> {
        self.inner.get_size(remote_path).await
    }

    async fn get_storage_usage(&self) -> Option<StorageUsage> {
        self.inner.get_storage_usage().await
    }
}

/// Dump driver that writes deterministic SQL text instead of shelling out.
#[derive(Default)]
pub struct ScriptedDumpDriver {
    pub fail_full: bool,
    pub failing_tenants: HashSet<Uuid>,
    pub restores: Mutex<Vec<(PathBuf, bool, Option<String>)>>,
}

impl ScriptedDumpDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_sql(output_path: &Path, banner: &str) -> Result<()> {
        let mut dump = String::with_capacity(64 * 1024);
        dump.push_str(&format!("-- PostgreSQL database dump\n-- {banner}\n"));
        for i in 0..2000 {
            dump.push_str(&format!("INSERT INTO t VALUES({i});\n"));
        }
        std::fs::write(output_path, dump)?;
        Ok(())
    }
}

#[async_trait]
impl DumpDriver for ScriptedDumpDriver {
    async fn full_dump(&self, output_path: &Path) -> Result<()> {
        if self.fail_full {
            return Err(BackupError::Dump("scripted pg_dump failure".to_string()));
        }
        Self::write_sql(output_path, "full database")
    }

    async fn tenant_dump(&self, output_path: &Path, tenant_id: Uuid) -> Result<()> {
        if self.failing_tenants.contains(&tenant_id) {
            return Err(BackupError::Dump(format!(
                "scripted tenant dump failure for {tenant_id}"
            )));
        }
        Self::write_sql(output_path, &format!("tenant {tenant_id}"))
    }

    async fn restore(
        &self,
        dump_path: &Path,
        clean: bool,
        target_database: Option<&str>,
    ) -> Result<()> {
        if !dump_path.is_file() {
            return Err(BackupError::Restore(format!(
                "dump file missing: {}",
                dump_path.display()
            )));
        }
        self.restores.lock().unwrap().push((
            dump_path.to_path_buf(),
            clean,
            target_database.map(str::to_string),
        ));
        Ok(())
    }
}

/// Admin adapter recording every statement; EXISTS probes answer yes.
pub struct FakeAdmin {
    pub statements: Arc<Mutex<Vec<String>>>,
}

impl FakeAdmin {
    pub fn new() -> Self {
        Self {
            statements: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatabaseAdmin for FakeAdmin {
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.statements.lock().unwrap().push(sql.to_string());
        Ok(0)
    }

    async fn query_i64(&self, sql: &str) -> Result<i64> {
        self.statements.lock().unwrap().push(sql.to_string());
        if sql.contains("EXISTS") {
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn query_rows(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        self.statements.lock().unwrap().push(sql.to_string());
        Ok(Vec::new())
    }

    async fn for_database(&self, _name: &str) -> Result<Arc<dyn DatabaseAdmin>> {
        Ok(Arc::new(FakeAdmin {
            statements: self.statements.clone(),
        }))
    }
}

pub struct Harness {
    pub ctx: BackupContext,
    pub notifier: Arc<RecordingNotifier>,
    pub dump: Arc<ScriptedDumpDriver>,
    pub admin: Arc<FakeAdmin>,
    // Keeps the backing directories alive for the test's duration.
    pub dirs: Vec<TempDir>,
}

pub struct HarnessBuilder {
    fail_uploads: HashSet<&'static str>,
    tenants: Vec<TenantRef>,
    dump: ScriptedDumpDriver,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            fail_uploads: HashSet::new(),
            tenants: Vec::new(),
            dump: ScriptedDumpDriver::new(),
        }
    }

    pub fn failing_backend(mut self, name: &'static str) -> Self {
        self.fail_uploads.insert(name);
        self
    }

    pub fn tenants(mut self, tenants: Vec<TenantRef>) -> Self {
        self.tenants = tenants;
        self
    }

    pub fn failing_tenant_dump(mut self, tenant_id: Uuid) -> Self {
        self.dump.failing_tenants.insert(tenant_id);
        self
    }

    pub fn failing_full_dump(mut self) -> Self {
        self.dump.fail_full = true;
        self
    }

    pub fn build(self) -> Harness {
        let local_dir = TempDir::new().unwrap();
        let r2_dir = TempDir::new().unwrap();
        let b2_dir = TempDir::new().unwrap();
        let wal_dir = TempDir::new().unwrap();
        let project_dir = TempDir::new().unwrap();

        let settings = BackupSettings {
            encryption_key: EncryptionKey::generate(),
            local_path: local_dir.path().to_path_buf(),
            database: DatabaseConfig {
                host: "localhost".into(),
                port: "5432".into(),
                name: "aurum".into(),
                user: "aurum".into(),
                password: "secret".into(),
            },
            r2: None,
            b2: None,
            wal_archive_dir: wal_dir.path().to_path_buf(),
            project_root: project_dir.path().to_path_buf(),
            alert_webhook_url: Some("https://hooks.example.com/backup".into()),
            health_check_url: None,
            k8s_namespace: "default".into(),
            redis_url: "redis://127.0.0.1:6379".into(),
            rls_force_tables: vec!["tenants".into()],
            tenant_tables: vec!["inventory_items".into(), "sales".into()],
            integrity_tables: vec!["tenants".into(), "users".into()],
            thresholds: MonitorThresholds::default(),
        };

        let key = EncryptionKey::from_base64(&settings.encryption_key).unwrap();
        let backends: Vec<Arc<dyn StorageBackend>> = vec![
            Arc::new(TestBackend::new(
                "local",
                local_dir.path(),
                self.fail_uploads.contains("local"),
            )),
            Arc::new(TestBackend::new(
                "r2",
                r2_dir.path(),
                self.fail_uploads.contains("r2"),
            )),
            Arc::new(TestBackend::new(
                "b2",
                b2_dir.path(),
                self.fail_uploads.contains("b2"),
            )),
        ];
        let storage = StorageSet::new(backends);

        let catalog = CatalogHandle::new(Arc::new(MemoryCatalog::new()));
        let notifier = Arc::new(RecordingNotifier::new());
        let directory = Arc::new(StaticIdentityDirectory::new(vec![Recipient {
            id: "admin-1".into(),
            name: "Platform Admin".into(),
            email: Some("ops@example.com".into()),
            phone: Some("+1555".into()),
        }]));
        let monitor = Arc::new(Monitor::new(
            catalog.clone(),
            notifier.clone(),
            directory,
            settings.alert_webhook_url.clone(),
            settings.thresholds.clone(),
        ));

        let dump = Arc::new(self.dump);
        let admin = Arc::new(FakeAdmin::new());

        let ctx = BackupContext {
            settings,
            key,
            storage,
            catalog,
            locks: LockService::new(Arc::new(MemoryLockKv::new())),
            dump: dump.clone(),
            admin: admin.clone(),
            tenants: Arc::new(StaticTenantDirectory::new(self.tenants)),
            monitor,
            http: reqwest::Client::new(),
        };

        Harness {
            ctx,
            notifier,
            dump,
            admin,
            dirs: vec![local_dir, r2_dir, b2_dir, wal_dir, project_dir],
        }
    }
}

pub fn harness() -> Harness {
    HarnessBuilder::new().build()
}
