//! Configuration backup pipeline.
//!
//! Collects deployment configuration (container manifests, environment
//! files, reverse-proxy configs, certificates, orchestrator manifests,
//! database tuning, build manifests) into a tar archive, then runs it
//! through the same encrypt/upload/verify tail as database backups. The
//! `.env` file is sanitized: values are redacted, structure is kept.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    elapsed_secs, generate_backup_filename, integrity_targets, upload_to_all_storages,
    BackupContext, TaskOutcome,
};
use crate::codec;
use crate::error::{BackupError, Result};
use crate::records::{AlertKind, AlertRecord, AlertSeverity, BackupKind, BackupRecord};
use crate::scheduler::TaskKind;
use crate::verify::verify_backup_integrity;

/// Run the daily configuration backup. Returns the backup id.
pub async fn configuration_backup(
    ctx: &BackupContext,
    task_id: &str,
    initiated_by: Option<&str>,
) -> Result<TaskOutcome<Uuid>> {
    let task = TaskKind::ConfigurationBackup;
    let lock = match ctx
        .locks
        .acquire_task_lock(task.name(), task_id, task.lock_ttl())
        .await
    {
        Some(lock) => lock,
        None => return Ok(TaskOutcome::Skipped),
    };

    info!("starting configuration backup");
    let started = Instant::now();

    let base_filename = generate_backup_filename(BackupKind::Configuration, None, Utc::now());
    let remote_filename = format!("{base_filename}.tar.gz.enc");
    let mut record = BackupRecord::new(BackupKind::Configuration, None, &remote_filename, task_id);
    record.created_by = initiated_by.map(str::to_string);
    ctx.catalog.bypass_rls().insert_backup(record.clone()).await?;

    let result = run(ctx, &mut record, &base_filename, started).await;

    if let Err(e) = &result {
        record.mark_failed(elapsed_secs(started), &e.to_string()).ok();
        if let Err(update_err) = ctx.catalog.bypass_rls().update_backup(&record).await {
            warn!(%update_err, "failed to persist FAILED configuration backup record");
        }
        let mut alert = AlertRecord::new(
            AlertKind::BackupFailure,
            AlertSeverity::Critical,
            &format!("Configuration backup failed: {e}"),
        );
        alert.backup_id = Some(record.id);
        alert.details.insert("error".into(), json!(e.to_string()));
        alert.details.insert("task_id".into(), json!(task_id));
        if let Err(alert_err) = ctx.monitor.create_alert(alert).await {
            warn!(%alert_err, "failed to create configuration backup alert");
        }
    }

    lock.release().await;
    result.map(|_| TaskOutcome::Completed(record.id))
}

async fn run(
    ctx: &BackupContext,
    record: &mut BackupRecord,
    base_filename: &str,
    started: Instant,
) -> Result<()> {
    let temp = tempfile::tempdir()?;
    let collect_dir = temp.path().join("config_backup");
    std::fs::create_dir_all(&collect_dir)?;

    let manifest = collect_configuration_files(&ctx.settings.project_root, &collect_dir)?;
    let total: usize = manifest.values().map(|files| files.len()).sum();
    if total == 0 {
        return Err(BackupError::NotFound(
            "no configuration files found to back up".to_string(),
        ));
    }
    info!(files = total, "collected configuration files");

    let tar_path = temp.path().join(format!("{base_filename}.tar"));
    create_tar_archive(&collect_dir, &tar_path)?;

    let artifact = codec::compress_and_encrypt_file(
        &ctx.key,
        &tar_path,
        Some(&temp.path().join(&record.filename)),
        false,
    )?;

    let (all_succeeded, paths) =
        upload_to_all_storages(ctx, &artifact.path, &record.filename).await;
    if paths.local.is_none() {
        return Err(BackupError::Storage(
            "failed to upload to local storage (minimum requirement)".to_string(),
        ));
    }
    if !all_succeeded {
        warn!("not all storage locations succeeded");
    }

    record.size_bytes = artifact.final_size;
    record.checksum = artifact.checksum.clone();
    record.local_path = paths.local.unwrap_or_default();
    record.r2_path = paths.r2.unwrap_or_default();
    record.b2_path = paths.b2.unwrap_or_default();
    record.compression_ratio = if artifact.original_size > 0 {
        1.0 - artifact.compressed_size as f64 / artifact.original_size as f64
    } else {
        0.0
    };
    record.metadata.insert("total_files".into(), json!(total));
    for (category, files) in &manifest {
        record
            .metadata
            .insert(format!("{category}_files"), json!(files));
    }
    record.mark_completed(elapsed_secs(started))?;
    ctx.catalog.bypass_rls().update_backup(record).await?;
    info!(backup = %record.id, "configuration backup completed");

    let report = verify_backup_integrity(&integrity_targets(ctx, record), &record.checksum).await?;
    if report.valid {
        record.mark_verified()?;
        ctx.catalog.bypass_rls().update_backup(record).await?;
    } else {
        let mut alert = AlertRecord::new(
            AlertKind::IntegrityFailure,
            AlertSeverity::Warning,
            &format!(
                "Backup integrity verification failed for {}",
                record.filename
            ),
        );
        alert.backup_id = Some(record.id);
        alert.details.insert("report".into(), report.details());
        ctx.monitor.create_alert(alert).await?;
    }

    ctx.monitor.monitor_backup_completion(record).await?;
    Ok(())
}

/// Copy the well-known configuration files under `project_root` into
/// `dest`, preserving relative structure. Returns collected paths grouped
/// by category.
pub fn collect_configuration_files(
    project_root: &Path,
    dest: &Path,
) -> Result<BTreeMap<String, Vec<String>>> {
    let mut manifest: BTreeMap<String, Vec<String>> = BTreeMap::new();

    // Container manifests.
    for name in [
        "docker-compose.yml",
        "docker-compose.dev.yml",
        "docker-compose.prod.yml",
        "Dockerfile",
        ".dockerignore",
    ] {
        copy_file(project_root, dest, &project_root.join(name), "docker", &mut manifest)?;
    }
    for path in walk_files(&project_root.join("docker")) {
        copy_file(project_root, dest, &path, "docker", &mut manifest)?;
    }

    // Environment files: the example verbatim, the live file sanitized.
    copy_file(project_root, dest, &project_root.join(".env.example"), "env", &mut manifest)?;
    let env_file = project_root.join(".env");
    if env_file.is_file() {
        let sanitized = dest.join(".env.sanitized");
        sanitize_env_file(&env_file, &sanitized)?;
        manifest
            .entry("env".to_string())
            .or_default()
            .push(".env.sanitized".to_string());
    }

    // Reverse-proxy configs.
    for dir in [project_root.join("nginx"), project_root.join("config/nginx")] {
        for path in walk_files(&dir) {
            if path.extension().is_some_and(|ext| ext == "conf") {
                copy_file(project_root, dest, &path, "nginx", &mut manifest)?;
            }
        }
    }

    // Certificates and keys.
    for dir in [project_root.join("ssl"), project_root.join("certs")] {
        for path in walk_files(&dir) {
            let keep = path
                .extension()
                .is_some_and(|ext| ["pem", "crt", "key", "cert"].iter().any(|e| ext == *e));
            if keep {
                copy_file(project_root, dest, &path, "ssl", &mut manifest)?;
            }
        }
    }

    // Orchestrator manifests.
    for dir in [
        project_root.join("k8s"),
        project_root.join("kubernetes"),
        project_root.join("manifests"),
    ] {
        for path in walk_files(&dir) {
            let keep = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if keep {
                copy_file(project_root, dest, &path, "k8s", &mut manifest)?;
            }
        }
    }

    // Database tuning configs.
    for name in [
        "docker/postgresql.conf",
        "docker/init-db.sh",
        "docker/init-wal-archive.sh",
    ] {
        copy_file(project_root, dest, &project_root.join(name), "postgres", &mut manifest)?;
    }
    for path in walk_files(&project_root.join("docker/postgres")) {
        copy_file(project_root, dest, &path, "postgres", &mut manifest)?;
    }

    // Build manifests.
    for name in ["Cargo.toml", "Cargo.lock", "Makefile", "rust-toolchain.toml"] {
        copy_file(project_root, dest, &project_root.join(name), "build", &mut manifest)?;
    }

    Ok(manifest)
}

fn copy_file(
    project_root: &Path,
    dest: &Path,
    source: &Path,
    category: &str,
    manifest: &mut BTreeMap<String, Vec<String>>,
) -> Result<()> {
    if !source.is_file() {
        debug!(path = %source.display(), "file not found, skipping");
        return Ok(());
    }
    let relative = source
        .strip_prefix(project_root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| PathBuf::from(source.file_name().unwrap_or_default()));
    let target = dest.join(&relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, &target)?;
    manifest
        .entry(category.to_string())
        .or_default()
        .push(relative.display().to_string());
    Ok(())
}

fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files
}

/// Write a sanitized copy of an environment file: every `KEY=VALUE` line
/// becomes `KEY=***REDACTED***`; comments and blank lines pass through.
pub fn sanitize_env_file(input: &Path, output: &Path) -> Result<usize> {
    let reader = BufReader::new(File::open(input)?);
    let mut writer = File::create(output)?;
    let mut redacted = 0;

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.starts_with('#') && line.contains('=') {
            let key = line.split('=').next().unwrap_or_default();
            writeln!(writer, "{key}=***REDACTED***")?;
            redacted += 1;
        } else {
            writeln!(writer, "{line}")?;
        }
    }
    Ok(redacted)
}

/// Build an uncompressed tar of `source_dir` rooted at its directory name.
pub fn create_tar_archive(source_dir: &Path, output_path: &Path) -> Result<u64> {
    let file = File::create(output_path)?;
    let mut builder = tar::Builder::new(file);
    let root_name = source_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "config_backup".to_string());
    builder
        .append_dir_all(&root_name, source_dir)
        .map_err(|e| BackupError::Compression(format!("tar archive failed: {e}")))?;
    builder
        .finish()
        .map_err(|e| BackupError::Compression(format!("tar archive failed: {e}")))?;
    Ok(std::fs::metadata(output_path)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn env_sanitizer_redacts_values_and_keeps_structure() {
        let dir = tempdir().unwrap();
        let input = dir.path().join(".env");
        std::fs::write(
            &input,
            "# database settings\nDATABASE_PASSWORD=hunter2\n\nDEBUG=true\n# trailing comment\n",
        )
        .unwrap();

        let output = dir.path().join(".env.sanitized");
        let redacted = sanitize_env_file(&input, &output).unwrap();
        assert_eq!(redacted, 2);

        let sanitized = std::fs::read_to_string(&output).unwrap();
        assert_eq!(
            sanitized,
            "# database settings\nDATABASE_PASSWORD=***REDACTED***\n\nDEBUG=***REDACTED***\n# trailing comment\n"
        );
        assert!(!sanitized.contains("hunter2"));
    }

    #[test]
    fn collection_preserves_relative_structure() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        std::fs::create_dir_all(root.path().join("docker")).unwrap();
        std::fs::write(root.path().join("docker/postgresql.conf"), "wal_level=replica\n").unwrap();
        std::fs::create_dir_all(root.path().join("k8s")).unwrap();
        std::fs::write(root.path().join("k8s/app.yaml"), "kind: Deployment\n").unwrap();
        std::fs::write(root.path().join("k8s/notes.txt"), "ignored\n").unwrap();
        std::fs::write(root.path().join(".env"), "SECRET=x\n").unwrap();
        std::fs::write(root.path().join("Cargo.toml"), "[package]\n").unwrap();

        let dest = tempdir().unwrap();
        let manifest = collect_configuration_files(root.path(), dest.path()).unwrap();

        assert!(dest.path().join("docker-compose.yml").is_file());
        assert!(dest.path().join("docker/postgresql.conf").is_file());
        assert!(dest.path().join("k8s/app.yaml").is_file());
        assert!(!dest.path().join("k8s/notes.txt").exists());
        assert!(dest.path().join(".env.sanitized").is_file());
        assert!(manifest["docker"].contains(&"docker-compose.yml".to_string()));
        assert!(manifest["env"].contains(&".env.sanitized".to_string()));
        assert!(manifest["build"].contains(&"Cargo.toml".to_string()));
    }

    #[test]
    fn tar_archive_contains_collected_tree() {
        let source = tempdir().unwrap();
        let collect = source.path().join("config_backup");
        std::fs::create_dir_all(collect.join("docker")).unwrap();
        std::fs::write(collect.join("docker/a.conf"), "x").unwrap();

        let out = source.path().join("out.tar");
        let size = create_tar_archive(&collect, &out).unwrap();
        assert!(size > 0);

        let mut archive = tar::Archive::new(File::open(&out).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "config_backup/docker/a.conf"));
    }
}
