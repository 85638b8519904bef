use std::time::Duration;

use async_trait::async_trait;
use common::RequestContext;

use crate::{LockError, Result};

/// Settings shared by every backing.
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// Prepended to every key handed to [`LockManager::new_lock`].
    pub key_prefix: String,
    /// Pause between attempts in [`DistributedLock::lock`].
    pub retry_delay: Duration,
    /// Attempts before `lock` gives up; `0` waits until cancelled.
    pub max_tries: u32,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            key_prefix: "lock/".to_string(),
            retry_delay: Duration::from_millis(500),
            max_tries: 0,
        }
    }
}

impl LockSettings {
    pub fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

/// A lock on one key.
///
/// Handles are not reentrant: a second `try_lock` on a handle that already
/// holds the lock returns `false`.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Fully prefixed key.
    fn key(&self) -> &str;

    fn ttl(&self) -> Duration;

    /// Attempts to acquire once and returns immediately.
    async fn try_lock(&self, ctx: &RequestContext) -> Result<bool>;

    /// Waits until acquired, the context is cancelled, or the retry budget
    /// runs out.
    async fn lock(&self, ctx: &RequestContext) -> Result<()>;

    /// Releases the lock. A no-op when this handle does not hold it.
    async fn unlock(&self, ctx: &RequestContext) -> Result<()>;
}

#[async_trait]
pub trait LockManager: Send + Sync {
    async fn new_lock(&self, key: &str, ttl: Duration) -> Result<Box<dyn DistributedLock>>;

    /// Releases resources held by the manager. Further `new_lock` calls fail.
    async fn close(&self) -> Result<()>;

    /// Probes the backing store.
    async fn check_health(&self) -> Result<()>;
}

/// Polls `try_lock` every `retry_delay` until it succeeds.
pub async fn acquire_with_retry<L>(
    lock: &L,
    ctx: &RequestContext,
    settings: &LockSettings,
) -> Result<()>
where
    L: DistributedLock + ?Sized,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if lock.try_lock(ctx).await? {
            return Ok(());
        }
        if settings.max_tries > 0 && attempts >= settings.max_tries {
            return Err(LockError::NotAcquired {
                key: lock.key().to_string(),
                attempts,
            });
        }
        ctx.sleep(settings.retry_delay).await?;
    }
}

pub(crate) fn record_attempt(backend: &'static str, acquired: bool) {
    let outcome = if acquired { "acquired" } else { "contended" };
    metrics::counter!("lock_acquisitions_total", "backend" => backend, "outcome" => outcome)
        .increment(1);
}

pub(crate) fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
