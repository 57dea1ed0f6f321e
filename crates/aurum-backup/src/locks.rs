//! TTL-based named locks over an external key-value store.
//!
//! Two lock scopes keep scheduled work idempotent: a per-task-run lock
//! (`backup:{task}:lock:{task_id}`) and a per-tenant lock
//! (`backup:tenant:{tenant_id}:in_progress`). Both are set-if-absent with a
//! TTL, so a crashed task can hold a lock for at most its TTL. Release is
//! best-effort: a failed delete is logged and left to the TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BackupError, Result};

/// TTL of the per-tenant backup lock.
pub const TENANT_LOCK_TTL: Duration = Duration::from_secs(20 * 60);

/// Narrow interface the engine needs from the lock store.
#[async_trait]
pub trait LockKv: Send + Sync {
    /// Set `key` to `value` with a TTL only if the key is absent. Returns
    /// whether the key was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool;

    async fn get(&self, key: &str) -> Option<String>;

    /// Delete a key; returns false only on store errors.
    async fn delete(&self, key: &str) -> bool;
}

/// A held lock. Call [`LockGuard::release`] in the task's cleanup path; if
/// the release never runs, the TTL expires the lock.
pub struct LockGuard {
    kv: Arc<dyn LockKv>,
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Best-effort release.
    pub async fn release(self) {
        if self.kv.delete(&self.key).await {
            debug!(key = %self.key, "released lock");
        } else {
            warn!(key = %self.key, "failed to release lock, TTL will expire it");
        }
    }
}

/// Outcome of a per-tenant lock attempt.
pub enum TenantLockOutcome {
    Acquired(LockGuard),
    /// Another task holds the lock; carries the owning task id when legible.
    Held(Option<String>),
}

/// Lock grammar and scopes over a [`LockKv`] store.
#[derive(Clone)]
pub struct LockService {
    kv: Arc<dyn LockKv>,
}

impl LockService {
    pub fn new(kv: Arc<dyn LockKv>) -> Self {
        Self { kv }
    }

    /// Acquire the at-most-one-instance lock for a task run. `None` means
    /// another instance is already running and the caller should return
    /// immediately.
    pub async fn acquire_task_lock(
        &self,
        task_name: &str,
        task_id: &str,
        ttl: Duration,
    ) -> Option<LockGuard> {
        let key = format!("backup:{task_name}:lock:{task_id}");
        if self.kv.set_if_absent(&key, "1", ttl).await {
            debug!(%key, "acquired task lock");
            Some(LockGuard {
                kv: self.kv.clone(),
                key,
            })
        } else {
            warn!(%key, "task already running, skipping duplicate execution");
            None
        }
    }

    /// Acquire the per-tenant backup lock, recording the owning task id as
    /// the lock value.
    pub async fn acquire_tenant_lock(&self, tenant_id: Uuid, task_id: &str) -> TenantLockOutcome {
        let key = format!("backup:tenant:{tenant_id}:in_progress");
        if self.kv.set_if_absent(&key, task_id, TENANT_LOCK_TTL).await {
            TenantLockOutcome::Acquired(LockGuard {
                kv: self.kv.clone(),
                key,
            })
        } else {
            TenantLockOutcome::Held(self.kv.get(&key).await)
        }
    }
}

/// Redis-backed lock store.
pub struct RedisLockKv {
    conn: ConnectionManager,
}

impl RedisLockKv {
    /// Connect to the Redis instance at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| BackupError::Configuration(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BackupError::Configuration(format!("redis connection failed: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl LockKv for RedisLockKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await;
        match result {
            Ok(reply) => reply.is_some(),
            Err(e) => {
                warn!(key, %e, "redis SET NX failed");
                false
            }
        }
    }

    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Option<String>> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await;
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(key, %e, "redis GET failed");
                None
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> =
            redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(key, %e, "redis DEL failed");
                false
            }
        }
    }
}

/// In-process lock store for tests and local development.
#[derive(Default)]
pub struct MemoryLockKv {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryLockKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockKv for MemoryLockKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        // Two-phase: drop expired entry, then claim atomically via entry API.
        if let Some(entry) = self.entries.get(key) {
            if entry.1 > now {
                return false;
            }
        }
        self.entries.remove(key);
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert((value.to_string(), now + ttl));
                true
            }
        }
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).and_then(|entry| {
            if entry.1 > Instant::now() {
                Some(entry.0.clone())
            } else {
                None
            }
        })
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.remove(key);
        true
    }
}
