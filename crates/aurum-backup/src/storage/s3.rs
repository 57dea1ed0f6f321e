//! S3-compatible object storage backend.
//!
//! Cloudflare R2 and Backblaze B2 both speak the S3 API; one implementation
//! serves both, differing only in endpoint grammar and region.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use super::{StorageBackend, StorageUsage};
use crate::config::{B2Config, R2Config};

const UPLOADER_TAG: &str = "aurum-backup-engine";

/// One S3-compatible bucket (R2 or B2).
#[derive(Debug)]
pub struct S3CompatibleStorage {
    name: String,
    client: Client,
    bucket: String,
    quota_bytes: Option<u64>,
}

impl S3CompatibleStorage {
    /// Cloudflare R2: account-scoped endpoint, region `auto`.
    pub async fn r2(config: &R2Config) -> Self {
        Self::connect(
            "r2",
            &config.endpoint_url(),
            "auto",
            &config.bucket,
            &config.access_key_id,
            &config.secret_access_key,
            config.quota_bytes,
        )
        .await
    }

    /// Backblaze B2: region-scoped endpoint.
    pub async fn b2(config: &B2Config) -> Self {
        Self::connect(
            "b2",
            &config.endpoint_url(),
            &config.region,
            &config.bucket,
            &config.access_key_id,
            &config.secret_access_key,
            config.quota_bytes,
        )
        .await
    }

    async fn connect(
        name: &str,
        endpoint: &str,
        region: &str,
        bucket: &str,
        access_key_id: &str,
        secret_access_key: &str,
        quota_bytes: Option<u64>,
    ) -> Self {
        let credentials = Credentials::new(
            access_key_id.to_string(),
            secret_access_key.to_string(),
            None,
            None,
            "aurum-backup",
        );
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .load()
            .await;
        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        Self {
            name: name.to_string(),
            client: Client::from_conf(config),
            bucket: bucket.to_string(),
            quota_bytes,
        }
    }
}

#[async_trait]
impl StorageBackend for S3CompatibleStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> bool {
        let body = match ByteStream::from_path(local_path).await {
            Ok(body) => body,
            Err(e) => {
                error!(backend = %self.name, remote_path, %e, "upload failed reading local file");
                return false;
            }
        };

        match self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(remote_path)
            .metadata("uploaded-from", UPLOADER_TAG)
            .body(body)
            .send()
            .await
        {
            Ok(_) => {
                info!(backend = %self.name, remote_path, "uploaded object");
                true
            }
            Err(e) => {
                error!(backend = %self.name, remote_path, %e, "upload failed");
                false
            }
        }
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> bool {
        if let Some(parent) = local_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(backend = %self.name, remote_path, %e, "download failed creating parent directory");
                return false;
            }
        }

        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(remote_path)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                error!(backend = %self.name, remote_path, %e, "download failed");
                return false;
            }
        };

        let mut file = match tokio::fs::File::create(local_path).await {
            Ok(file) => file,
            Err(e) => {
                error!(backend = %self.name, remote_path, %e, "download failed creating local file");
                return false;
            }
        };

        let mut body = output.body;
        loop {
            match body.try_next().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        error!(backend = %self.name, remote_path, %e, "download failed writing local file");
                        return false;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(backend = %self.name, remote_path, %e, "download stream failed");
                    return false;
                }
            }
        }

        info!(backend = %self.name, remote_path, "downloaded object");
        true
    }

    async fn exists(&self, remote_path: &str) -> bool {
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(remote_path)
            .send()
            .await
            .is_ok()
    }

    async fn delete(&self, remote_path: &str) -> bool {
        // S3 DeleteObject succeeds for missing keys, so this is idempotent.
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(remote_path)
            .send()
            .await
        {
            Ok(_) => {
                info!(backend = %self.name, remote_path, "deleted object");
                true
            }
            Err(e) => {
                error!(backend = %self.name, remote_path, %e, "delete failed");
                false
            }
        }
    }

    async fn get_size(&self, remote_path: &str) -> Option<u64> {
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(remote_path)
            .send()
            .await
            .ok()
            .and_then(|output| output.content_length())
            .and_then(|len| u64::try_from(len).ok())
    }

    async fn get_storage_usage(&self) -> Option<StorageUsage> {
        // The S3 API exposes no bucket quota; without a configured one there
        // is no meaningful capacity report.
        let quota = match self.quota_bytes {
            Some(quota) => quota,
            None => {
                debug!(backend = %self.name, "no quota configured, skipping usage report");
                return None;
            }
        };

        let mut used_bytes: u64 = 0;
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let output = match request.send().await {
                Ok(output) => output,
                Err(e) => {
                    error!(backend = %self.name, %e, "bucket listing failed");
                    return None;
                }
            };

            for object in output.contents() {
                if let Some(size) = object.size() {
                    used_bytes += u64::try_from(size).unwrap_or(0);
                }
            }

            match output.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Some(StorageUsage {
            total_bytes: quota,
            used_bytes,
            available_bytes: quota.saturating_sub(used_bytes),
        })
    }
}
