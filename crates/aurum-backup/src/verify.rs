//! Post-upload integrity verification.
//!
//! Downloads every copy of an artifact, recomputes its SHA-256, and checks
//! size consistency across backends. Expensive by design; the hourly sweep
//! in the orchestrator does the cheap existence/size variant instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::codec::{calculate_checksum, ChecksumAlgorithm};
use crate::error::Result;
use crate::storage::StorageBackend;

/// Outcome for a single storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationCheck {
    pub exists: bool,
    pub checksum_valid: bool,
    pub size: Option<u64>,
}

/// Combined verification report across all configured locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub locations: BTreeMap<String, LocationCheck>,
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn details(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Verify an artifact's copies. `targets` pairs each backend with the
/// artifact's remote path on that backend.
pub async fn verify_backup_integrity(
    targets: &[(Arc<dyn StorageBackend>, String)],
    expected_checksum: &str,
) -> Result<IntegrityReport> {
    let mut locations = BTreeMap::new();
    let mut errors = Vec::new();
    let mut sizes: Vec<(String, u64)> = Vec::new();

    let scratch = tempfile::tempdir()?;

    for (backend, remote_path) in targets {
        let name = backend.name().to_string();

        if !backend.exists(remote_path).await {
            errors.push(format!("file missing in {name}: {remote_path}"));
            locations.insert(
                name,
                LocationCheck {
                    exists: false,
                    checksum_valid: false,
                    size: None,
                },
            );
            continue;
        }

        let size = backend.get_size(remote_path).await;
        if let Some(size) = size {
            sizes.push((name.clone(), size));
        }

        // Download into the scratch dir; the whole dir is removed on every
        // exit path when `scratch` drops.
        let temp_path = scratch.path().join(format!("verify_{name}"));
        let checksum_valid = if backend.download(remote_path, &temp_path).await {
            match calculate_checksum(&temp_path, ChecksumAlgorithm::Sha256) {
                Ok(actual) => {
                    let ok = actual.eq_ignore_ascii_case(expected_checksum);
                    if !ok {
                        errors.push(format!(
                            "checksum mismatch in {name}: expected {expected_checksum}, got {actual}"
                        ));
                    }
                    ok
                }
                Err(e) => {
                    errors.push(format!("checksum calculation failed for {name}: {e}"));
                    false
                }
            }
        } else {
            errors.push(format!("download failed from {name}: {remote_path}"));
            false
        };
        let _ = tokio::fs::remove_file(&temp_path).await;

        locations.insert(
            name,
            LocationCheck {
                exists: true,
                checksum_valid,
                size,
            },
        );
    }

    // All copies must agree on size.
    if let Some((first_name, first_size)) = sizes.first() {
        for (name, size) in &sizes[1..] {
            if size != first_size {
                errors.push(format!(
                    "size mismatch across backends: {first_name}={first_size}, {name}={size}"
                ));
            }
        }
    }

    let valid = errors.is_empty()
        && !locations.is_empty()
        && locations.values().all(|c| c.exists && c.checksum_valid);

    if valid {
        info!(locations = locations.len(), "backup integrity verified");
    } else {
        warn!(?errors, "backup integrity verification failed");
    }

    Ok(IntegrityReport {
        valid,
        locations,
        errors,
    })
}
