use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::RequestContext;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::manager::{DistributedLock, LockManager, LockSettings, new_token, record_attempt};
use crate::{LockError, Result, acquire_with_retry};

#[derive(Debug)]
struct Lease {
    token: String,
    expires_at: Instant,
}

type LeaseTable = Arc<Mutex<HashMap<String, Lease>>>;

/// Process-local lease table.
///
/// Gives the same semantics as the distributed backings within one process;
/// used by tests and single-replica deployments.
#[derive(Clone, Default)]
pub struct InMemoryLockManager {
    leases: LeaseTable,
    settings: LockSettings,
    closed: Arc<AtomicBool>,
}

impl InMemoryLockManager {
    pub fn new(settings: LockSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Number of unexpired leases.
    pub async fn active_leases(&self) -> usize {
        let now = Instant::now();
        self.leases
            .lock()
            .await
            .values()
            .filter(|lease| lease.expires_at > now)
            .count()
    }

    /// Whether an unexpired lease exists for `key` (without prefix).
    pub async fn is_locked(&self, key: &str) -> bool {
        let full_key = self.settings.full_key(key);
        self.leases
            .lock()
            .await
            .get(&full_key)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn new_lock(&self, key: &str, ttl: Duration) -> Result<Box<dyn DistributedLock>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::Closed);
        }
        Ok(Box::new(InMemoryLock {
            key: self.settings.full_key(key),
            ttl,
            token: new_token(),
            held: AtomicBool::new(false),
            leases: self.leases.clone(),
            settings: self.settings.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.leases.lock().await.clear();
        Ok(())
    }

    async fn check_health(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::Closed);
        }
        Ok(())
    }
}

struct InMemoryLock {
    key: String,
    ttl: Duration,
    token: String,
    held: AtomicBool,
    leases: LeaseTable,
    settings: LockSettings,
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    fn key(&self) -> &str {
        &self.key
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn try_lock(&self, ctx: &RequestContext) -> Result<bool> {
        ctx.check()?;
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        let acquired = match leases.get(&self.key) {
            Some(lease) if lease.expires_at > now => false,
            _ => {
                leases.insert(
                    self.key.clone(),
                    Lease {
                        token: self.token.clone(),
                        expires_at: now + self.ttl,
                    },
                );
                self.held.store(true, Ordering::SeqCst);
                true
            }
        };
        record_attempt("memory", acquired);
        Ok(acquired)
    }

    async fn lock(&self, ctx: &RequestContext) -> Result<()> {
        acquire_with_retry(self, ctx, &self.settings).await
    }

    async fn unlock(&self, _ctx: &RequestContext) -> Result<()> {
        if !self.held.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut leases = self.leases.lock().await;
        if leases
            .get(&self.key)
            .is_some_and(|lease| lease.token == self.token)
        {
            leases.remove(&self.key);
        }
        Ok(())
    }
}
