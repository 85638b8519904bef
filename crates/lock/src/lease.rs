//! Lease table in Postgres.
//!
//! Each manager is one session; every lock it grants is a row whose holder
//! is `<session>:<token>` and whose lease ends at `expires_at`. An expired
//! row is taken over atomically by the next `try_lock`. Closing the manager
//! drops every lease of its session, like revoking a coordination-service
//! session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::RequestContext;
use sqlx::PgPool;

use crate::manager::{DistributedLock, LockManager, LockSettings, new_token, record_attempt};
use crate::{LockError, Result, acquire_with_retry};

pub struct PostgresLeaseLockManager {
    pool: PgPool,
    settings: LockSettings,
    session: String,
    closed: AtomicBool,
}

impl PostgresLeaseLockManager {
    /// Expects the `distributed_locks` table from the service migrations.
    pub fn new(pool: PgPool, settings: LockSettings) -> Self {
        Self {
            pool,
            settings,
            session: new_token(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }
}

#[async_trait]
impl LockManager for PostgresLeaseLockManager {
    async fn new_lock(&self, key: &str, ttl: Duration) -> Result<Box<dyn DistributedLock>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::Closed);
        }
        Ok(Box::new(LeaseLock {
            key: self.settings.full_key(key),
            ttl,
            holder: format!("{}:{}", self.session, new_token()),
            pool: self.pool.clone(),
            held: AtomicBool::new(false),
            settings: self.settings.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let released = sqlx::query("DELETE FROM distributed_locks WHERE holder LIKE $1")
            .bind(format!("{}:%", self.session))
            .execute(&self.pool)
            .await?
            .rows_affected();
        tracing::info!(session = %self.session, released, "lease session closed");
        Ok(())
    }

    async fn check_health(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::Closed);
        }
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

struct LeaseLock {
    key: String,
    ttl: Duration,
    holder: String,
    pool: PgPool,
    held: AtomicBool,
    settings: LockSettings,
}

#[async_trait]
impl DistributedLock for LeaseLock {
    fn key(&self) -> &str {
        &self.key
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn try_lock(&self, ctx: &RequestContext) -> Result<bool> {
        ctx.check()?;
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO distributed_locks (lock_key, holder, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (lock_key) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE distributed_locks.expires_at < NOW()
            RETURNING holder
            "#,
        )
        .bind(&self.key)
        .bind(&self.holder)
        .bind(self.ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let acquired = claimed.is_some();
        if acquired {
            self.held.store(true, Ordering::SeqCst);
        }
        record_attempt("postgres", acquired);
        Ok(acquired)
    }

    async fn lock(&self, ctx: &RequestContext) -> Result<()> {
        acquire_with_retry(self, ctx, &self.settings).await
    }

    async fn unlock(&self, _ctx: &RequestContext) -> Result<()> {
        if !self.held.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        sqlx::query("DELETE FROM distributed_locks WHERE lock_key = $1 AND holder = $2")
            .bind(&self.key)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
