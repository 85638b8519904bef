//! Redlock over one or more independent Redis nodes.
//!
//! A lock is held when a majority of nodes accepted `SET key token NX PX ttl`
//! and the time spent acquiring, plus clock drift, left some of the TTL.
//! Release runs a compare-and-delete script so a holder whose lease already
//! expired cannot delete somebody else's lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::RequestContext;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::RwLock;

use crate::manager::{DistributedLock, LockManager, LockSettings, new_token, record_attempt};
use crate::{LockError, Result, acquire_with_retry};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Fraction of the TTL reserved for clock drift between nodes.
const CLOCK_DRIFT_FACTOR: f64 = 0.01;

/// Number of nodes that must agree.
pub fn quorum(nodes: usize) -> usize {
    nodes / 2 + 1
}

/// TTL left after acquisition, or `None` when the lock would already be unsafe.
pub fn remaining_validity(ttl: Duration, elapsed: Duration) -> Option<Duration> {
    // Redis PX has millisecond resolution; add 2ms like the reference algorithm.
    let drift = ttl.mul_f64(CLOCK_DRIFT_FACTOR) + Duration::from_millis(2);
    ttl.checked_sub(elapsed)?
        .checked_sub(drift)
        .filter(|left| !left.is_zero())
}

pub struct RedisLockManager {
    nodes: Arc<RwLock<Vec<ConnectionManager>>>,
    settings: LockSettings,
    release: Script,
    closed: AtomicBool,
}

impl RedisLockManager {
    /// Connects to every node in `urls`.
    pub async fn connect(urls: &[String], settings: LockSettings) -> Result<Self> {
        if urls.is_empty() {
            return Err(LockError::Config("at least one redis url is required".into()));
        }
        let mut nodes = Vec::with_capacity(urls.len());
        for url in urls {
            let client = Client::open(url.as_str())?;
            nodes.push(ConnectionManager::new(client).await?);
        }
        tracing::info!(nodes = nodes.len(), quorum = quorum(nodes.len()), "redlock connected");
        Ok(Self {
            nodes: Arc::new(RwLock::new(nodes)),
            settings,
            release: Script::new(RELEASE_SCRIPT),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn new_lock(&self, key: &str, ttl: Duration) -> Result<Box<dyn DistributedLock>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::Closed);
        }
        let nodes = self.nodes.read().await.clone();
        Ok(Box::new(RedisLock {
            key: self.settings.full_key(key),
            ttl,
            token: new_token(),
            quorum: quorum(nodes.len()),
            nodes,
            release: self.release.clone(),
            held: AtomicBool::new(false),
            settings: self.settings.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        // Locks already handed out keep their own connections so they can
        // still release.
        self.nodes.write().await.clear();
        Ok(())
    }

    async fn check_health(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::Closed);
        }
        let nodes = self.nodes.read().await.clone();
        let needed = quorum(nodes.len());
        let mut healthy = 0;
        let mut last_error = None;
        for mut conn in nodes {
            let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            match pong {
                Ok(_) => healthy += 1,
                Err(err) => last_error = Some(err),
            }
        }
        if healthy >= needed {
            return Ok(());
        }
        Err(LockError::Unavailable(format!(
            "{healthy} of {needed} required redis nodes answered: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

struct RedisLock {
    key: String,
    ttl: Duration,
    token: String,
    nodes: Vec<ConnectionManager>,
    quorum: usize,
    release: Script,
    held: AtomicBool,
    settings: LockSettings,
}

impl RedisLock {
    /// Runs the release script on every node. Returns how many nodes failed.
    async fn release_all(&self) -> usize {
        let mut failures = 0;
        for node in &self.nodes {
            let mut conn = node.clone();
            let released: redis::RedisResult<i64> = self
                .release
                .key(&self.key)
                .arg(&self.token)
                .invoke_async(&mut conn)
                .await;
            if let Err(err) = released {
                failures += 1;
                tracing::warn!(key = %self.key, error = %err, "redlock release failed on node");
            }
        }
        failures
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    fn key(&self) -> &str {
        &self.key
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn try_lock(&self, ctx: &RequestContext) -> Result<bool> {
        ctx.check()?;
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        let started = Instant::now();
        let mut granted = 0;
        let mut errors = Vec::new();

        for node in &self.nodes {
            let mut conn = node.clone();
            let reply: redis::RedisResult<Option<String>> = redis::cmd("SET")
                .arg(&self.key)
                .arg(&self.token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await;
            match reply {
                Ok(Some(_)) => granted += 1,
                Ok(None) => {}
                Err(err) => errors.push(err),
            }
        }

        let acquired =
            granted >= self.quorum && remaining_validity(self.ttl, started.elapsed()).is_some();
        if acquired {
            self.held.store(true, Ordering::SeqCst);
            record_attempt("redis", true);
            return Ok(true);
        }

        // Undo partial grants so other contenders are not blocked until expiry.
        if granted > 0 {
            self.release_all().await;
        }
        if self.nodes.len() - errors.len() < self.quorum {
            let detail = errors
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no redis nodes configured".into());
            return Err(LockError::Unavailable(detail));
        }
        record_attempt("redis", false);
        Ok(false)
    }

    async fn lock(&self, ctx: &RequestContext) -> Result<()> {
        acquire_with_retry(self, ctx, &self.settings).await
    }

    async fn unlock(&self, _ctx: &RequestContext) -> Result<()> {
        if !self.held.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let failures = self.release_all().await;
        if self.nodes.len() - failures < self.quorum {
            return Err(LockError::Unavailable(format!(
                "release of '{}' reached fewer than {} nodes",
                self.key, self.quorum
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_is_strict_majority() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(5), 3);
    }

    #[test]
    fn validity_accounts_for_elapsed_time_and_drift() {
        let ttl = Duration::from_secs(30);
        let left = remaining_validity(ttl, Duration::from_millis(100)).unwrap();
        assert_eq!(left, Duration::from_millis(30_000 - 100 - 300 - 2));
    }

    #[test]
    fn slow_acquisition_invalidates_lock() {
        let ttl = Duration::from_millis(100);
        assert!(remaining_validity(ttl, Duration::from_millis(99)).is_none());
        assert!(remaining_validity(ttl, Duration::from_millis(200)).is_none());
    }

    #[tokio::test]
    async fn connect_requires_nodes() {
        let result = RedisLockManager::connect(&[], LockSettings::default()).await;
        assert!(matches!(result, Err(LockError::Config(_))));
    }
}
