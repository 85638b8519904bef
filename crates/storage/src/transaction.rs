//! Local transaction execution with an optional saga barrier.
//!
//! The barrier makes a saga branch safe against the coordinator's retries.
//! Every branch call first claims a row in `saga_barriers` inside the same
//! local transaction as its business work:
//!
//! - a call whose row already exists is a duplicate and is skipped;
//! - a compensation that manages to claim the action's row proves the action
//!   never ran, so the compensation is empty;
//! - an action arriving after that finds its row taken and is skipped, so a
//!   late action can never hang after its compensation.
//!
//! Because the rows live in the business transaction, a failed branch rolls
//! its barrier back too and can be retried.

use common::{RequestContext, SagaBranch};
use futures_util::future::BoxFuture;

use crate::{
    Result, StorageError,
    store::{Storage, StorageTx},
};

/// Future returned by a transactional closure, borrowing the transaction.
pub type TxFuture<'t, T, E> = BoxFuture<'t, std::result::Result<T, E>>;

/// What happened to a barrier-guarded branch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierOutcome<T> {
    /// The closure ran and its transaction committed.
    Executed(T),
    /// This branch call was already applied.
    Duplicate,
    /// Compensation for an action that never ran.
    NullCompensation,
}

impl<T> BarrierOutcome<T> {
    pub fn executed(self) -> Option<T> {
        match self {
            Self::Executed(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        !matches!(self, Self::Executed(_))
    }

    fn skip_reason(&self) -> &'static str {
        match self {
            Self::Executed(_) => "executed",
            Self::Duplicate => "duplicate",
            Self::NullCompensation => "null_compensation",
        }
    }
}

/// Runs closures inside local transactions of `S`.
#[derive(Clone)]
pub struct TransactionManager<S> {
    storage: S,
}

impl<S: Storage> TransactionManager<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Begins a transaction, runs `f`, commits on `Ok` and rolls back on `Err`.
    ///
    /// Cancelling `ctx` while `f` runs drops `f`, rolls back and returns a
    /// storage `Interrupted` error.
    #[tracing::instrument(skip_all, fields(trace_id = %ctx.trace_id()))]
    pub async fn execute<T, E, F>(&self, ctx: &RequestContext, f: F) -> std::result::Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut S::Tx) -> TxFuture<'t, T, E> + Send,
        T: Send,
        E: From<StorageError> + Send,
    {
        ctx.check()
            .map_err(|e| E::from(StorageError::Interrupted(e)))?;
        let mut tx = self.storage.begin().await.map_err(E::from)?;
        let outcome = run_in_tx(ctx, &mut tx, f).await;
        finish(tx, outcome).await
    }

    /// Like [`execute`](Self::execute), guarded by the saga barrier of the
    /// branch carried in `ctx`.
    #[tracing::instrument(skip_all, fields(trace_id = %ctx.trace_id()))]
    pub async fn execute_with_barrier<T, E, F>(
        &self,
        ctx: &RequestContext,
        f: F,
    ) -> std::result::Result<BarrierOutcome<T>, E>
    where
        F: for<'t> FnOnce(&'t mut S::Tx) -> TxFuture<'t, T, E> + Send,
        T: Send,
        E: From<StorageError> + Send,
    {
        let branch = ctx
            .saga_branch()
            .cloned()
            .ok_or_else(|| E::from(StorageError::MissingSagaBranch))?;
        ctx.check()
            .map_err(|e| E::from(StorageError::Interrupted(e)))?;

        let mut tx = self.storage.begin().await.map_err(E::from)?;
        let claim = match claim_barrier(&mut tx, &branch).await {
            Ok(claim) => claim,
            Err(err) => {
                rollback_quietly(tx).await;
                return Err(E::from(err));
            }
        };

        if claim.is_skipped() {
            tx.commit().await.map_err(E::from)?;
            tracing::info!(
                gid = %branch.gid,
                branch_id = %branch.branch_id,
                op = %branch.op,
                reason = claim.skip_reason(),
                "saga barrier skipped branch call"
            );
            metrics::counter!("saga_barrier_skips_total", "reason" => claim.skip_reason())
                .increment(1);
            return Ok(match claim {
                BarrierOutcome::NullCompensation => BarrierOutcome::NullCompensation,
                _ => BarrierOutcome::Duplicate,
            });
        }

        let outcome = run_in_tx(ctx, &mut tx, f).await;
        finish(tx, outcome).await.map(BarrierOutcome::Executed)
    }
}

async fn claim_barrier<Tx: StorageTx>(tx: &mut Tx, branch: &SagaBranch) -> Result<BarrierOutcome<()>> {
    let origin_claimed = match branch.op.origin() {
        Some(origin) => tx.insert_barrier(branch, origin).await?,
        None => false,
    };
    let current_claimed = tx.insert_barrier(branch, branch.op).await?;

    Ok(if origin_claimed {
        BarrierOutcome::NullCompensation
    } else if !current_claimed {
        BarrierOutcome::Duplicate
    } else {
        BarrierOutcome::Executed(())
    })
}

async fn run_in_tx<Tx, T, E, F>(
    ctx: &RequestContext,
    tx: &mut Tx,
    f: F,
) -> std::result::Result<T, E>
where
    F: for<'t> FnOnce(&'t mut Tx) -> TxFuture<'t, T, E>,
    E: From<StorageError>,
{
    match ctx.run(f(tx)).await {
        Ok(result) => result,
        Err(interrupted) => Err(E::from(StorageError::Interrupted(interrupted))),
    }
}

async fn finish<Tx, T, E>(tx: Tx, outcome: std::result::Result<T, E>) -> std::result::Result<T, E>
where
    Tx: StorageTx,
    E: From<StorageError>,
{
    match outcome {
        Ok(value) => {
            tx.commit().await.map_err(E::from)?;
            metrics::counter!("storage_transactions_total", "outcome" => "committed").increment(1);
            Ok(value)
        }
        Err(err) => {
            rollback_quietly(tx).await;
            metrics::counter!("storage_transactions_total", "outcome" => "rolled_back")
                .increment(1);
            Err(err)
        }
    }
}

async fn rollback_quietly<Tx: StorageTx>(tx: Tx) {
    if let Err(err) = tx.rollback().await {
        tracing::warn!(error = %err, "transaction rollback failed");
    }
}
