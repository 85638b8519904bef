//! Deduction and compensation flows for one order.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{ErrorClassification, OrderId, ProductId, RequestContext, VariantId, headers};
use lock::LockManager;
use messaging::{Envelope, EventListener, now_millis};
use storage::{
    BarrierOutcome, IdempotencyLedger, LedgerKind, NewIdempotencyRecord, StockTarget, Storage,
    StorageError, StorageTx, TransactionManager, TxFuture,
};
use uuid::Uuid;

use crate::events::topics;
use crate::request::{ProductLine, VariantLine};
use crate::{InventoryDeductionRequest, InventoryError, Result};

pub fn deduct_lock_key(order_id: OrderId) -> String {
    format!("deduct-inventory:{order_id}")
}

pub fn revert_lock_key(order_id: OrderId) -> String {
    format!("deduct-inventory-revert:{order_id}")
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Lease on the order lock; bounds how long a crashed worker blocks the order.
    pub lock_ttl: Duration,
    pub confirmation_topic: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            confirmation_topic: topics::ON_INVENTORY_DEDUCT_SUCCESS.to_string(),
        }
    }
}

/// What a deduction or compensation call did. Every variant is a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductionOutcome {
    /// Stock was changed and the ledger record written.
    Applied,
    /// The ledger already holds a record of this kind for the order.
    AlreadyProcessed,
    /// A deduction arrived after the order was compensated; nothing deducted.
    AlreadyCompensated,
    /// A compensation for a deduction that never happened.
    NullCompensation,
    /// The saga barrier recognised a repeated branch call.
    BarrierSkipped,
}

impl DeductionOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::AlreadyProcessed => "already_processed",
            Self::AlreadyCompensated => "already_compensated",
            Self::NullCompensation => "null_compensation",
            Self::BarrierSkipped => "barrier_skipped",
        }
    }
}

pub struct InventoryOrchestrator<S> {
    transactions: TransactionManager<S>,
    ledger: IdempotencyLedger<S>,
    locks: Arc<dyn LockManager>,
    listener: Arc<EventListener>,
    settings: OrchestratorSettings,
}

impl<S: Storage + Clone> InventoryOrchestrator<S> {
    pub fn new(
        storage: S,
        locks: Arc<dyn LockManager>,
        listener: Arc<EventListener>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            transactions: TransactionManager::new(storage.clone()),
            ledger: IdempotencyLedger::new(storage),
            locks,
            listener,
            settings,
        }
    }

    pub fn storage(&self) -> &S {
        self.transactions.storage()
    }

    /// Deducts the request's stock exactly once per order and publishes the
    /// confirmation.
    ///
    /// Fails with `DuplicateNotification` when another worker is handling
    /// the same order. A request whose stock cannot be fully deducted
    /// changes nothing.
    #[tracing::instrument(
        skip_all,
        fields(order_id = %request.order_id, trace_id = %ctx.trace_id())
    )]
    pub async fn deduct_inventory(
        &self,
        ctx: &RequestContext,
        request: &InventoryDeductionRequest,
    ) -> Result<DeductionOutcome> {
        let started = Instant::now();
        let result = async {
            request.validate()?;
            let key = deduct_lock_key(request.order_id);
            self.with_order_lock(ctx, &key, request.order_id, || {
                self.deduct_locked(ctx, request)
            })
            .await
        }
        .await;
        record_operation("deduct", &result, started);
        result
    }

    /// Restores the stock of a previous deduction exactly once per order.
    ///
    /// Without a deduction on record only the revert marker is written, so a
    /// late deduction for the same order is refused.
    #[tracing::instrument(
        skip_all,
        fields(order_id = %request.order_id, trace_id = %ctx.trace_id())
    )]
    pub async fn deduct_inventory_revert(
        &self,
        ctx: &RequestContext,
        request: &InventoryDeductionRequest,
    ) -> Result<DeductionOutcome> {
        let started = Instant::now();
        let result = async {
            request.validate()?;
            let key = revert_lock_key(request.order_id);
            self.with_order_lock(ctx, &key, request.order_id, || {
                self.revert_locked(ctx, request)
            })
            .await
        }
        .await;
        record_operation("revert", &result, started);
        result
    }

    async fn with_order_lock<F, Fut>(
        &self,
        ctx: &RequestContext,
        key: &str,
        order_id: OrderId,
        body: F,
    ) -> Result<DeductionOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DeductionOutcome>>,
    {
        let lock = self.locks.new_lock(key, self.settings.lock_ttl).await?;
        if !lock.try_lock(ctx).await? {
            tracing::warn!(lock_key = key, "order is being handled elsewhere");
            return Err(InventoryError::DuplicateNotification(order_id));
        }

        let result = body().await;

        // Released under a fresh context so a cancelled caller still unlocks.
        let release = RequestContext::from_metadata(ctx.metadata().clone());
        if let Err(err) = lock.unlock(&release).await {
            tracing::warn!(lock_key = key, error = %err, "failed to release order lock");
        }
        result
    }

    async fn deduct_locked(
        &self,
        ctx: &RequestContext,
        request: &InventoryDeductionRequest,
    ) -> Result<DeductionOutcome> {
        let order_id = request.order_id;
        if self.ledger.find_by_order_id(order_id, LedgerKind::Deduct).await? {
            tracing::info!("inventory already deducted for order");
            return Ok(DeductionOutcome::AlreadyProcessed);
        }
        if self.ledger.find_by_order_id(order_id, LedgerKind::Revert).await? {
            tracing::warn!("order already compensated; deduction skipped");
            return Ok(DeductionOutcome::AlreadyCompensated);
        }

        let ledger = self.ledger.clone();
        let products = request.products.clone();
        let variants = request.variants.clone();
        let event_id = inbound_event_id(ctx);
        let outcome = self
            .run_tx(ctx, move |tx| {
                Box::pin(async move {
                    lock_rows(tx, &products, &variants).await?;
                    if ledger.exists_in(tx, order_id, LedgerKind::Revert).await? {
                        return Ok(DeductionOutcome::AlreadyCompensated);
                    }
                    if ledger.exists_in(tx, order_id, LedgerKind::Deduct).await? {
                        return Ok(DeductionOutcome::AlreadyProcessed);
                    }
                    for line in &products {
                        tx.deduct_product_stock(line.product_id, line.quantity).await?;
                    }
                    for line in &variants {
                        tx.deduct_variant_stock(line.variant_id, line.quantity).await?;
                    }
                    ledger
                        .create(tx, NewIdempotencyRecord::new(event_id, order_id, LedgerKind::Deduct))
                        .await?;
                    Ok::<_, InventoryError>(DeductionOutcome::Applied)
                })
            })
            .await?;

        if outcome == DeductionOutcome::Applied {
            self.confirm(ctx, request).await;
        }
        Ok(outcome)
    }

    async fn revert_locked(
        &self,
        ctx: &RequestContext,
        request: &InventoryDeductionRequest,
    ) -> Result<DeductionOutcome> {
        let order_id = request.order_id;
        if self.ledger.find_by_order_id(order_id, LedgerKind::Revert).await? {
            tracing::info!("inventory already restored for order");
            return Ok(DeductionOutcome::AlreadyProcessed);
        }

        let ledger = self.ledger.clone();
        let products = request.products.clone();
        let variants = request.variants.clone();
        let event_id = inbound_event_id(ctx);
        self.run_tx(ctx, move |tx| {
            Box::pin(async move {
                lock_rows(tx, &products, &variants).await?;
                if ledger.exists_in(tx, order_id, LedgerKind::Revert).await? {
                    return Ok(DeductionOutcome::AlreadyProcessed);
                }
                let deducted = ledger.exists_in(tx, order_id, LedgerKind::Deduct).await?;
                if deducted {
                    for line in &products {
                        tx.increment_product_stock(line.product_id, line.quantity).await?;
                    }
                    for line in &variants {
                        tx.increment_variant_stock(line.variant_id, line.quantity).await?;
                    }
                }
                ledger
                    .create(tx, NewIdempotencyRecord::new(event_id, order_id, LedgerKind::Revert))
                    .await?;
                Ok::<_, InventoryError>(if deducted {
                    DeductionOutcome::Applied
                } else {
                    DeductionOutcome::NullCompensation
                })
            })
        })
        .await
    }

    /// Runs `work` in a local transaction, guarded by the saga barrier when
    /// `ctx` carries a branch.
    async fn run_tx<F>(&self, ctx: &RequestContext, work: F) -> Result<DeductionOutcome>
    where
        F: for<'t> FnOnce(&'t mut S::Tx) -> TxFuture<'t, DeductionOutcome, InventoryError> + Send,
    {
        let result = if ctx.saga_branch().is_some() {
            self.transactions.execute_with_barrier(ctx, work).await
        } else {
            self.transactions
                .execute(ctx, work)
                .await
                .map(BarrierOutcome::Executed)
        };

        match result {
            Ok(BarrierOutcome::Executed(outcome)) => Ok(outcome),
            Ok(BarrierOutcome::Duplicate) => Ok(DeductionOutcome::BarrierSkipped),
            Ok(BarrierOutcome::NullCompensation) => Ok(DeductionOutcome::NullCompensation),
            // A concurrent call committed the same record first.
            Err(InventoryError::Storage(StorageError::DuplicateRecord { .. })) => {
                Ok(DeductionOutcome::AlreadyProcessed)
            }
            Err(err) => Err(err),
        }
    }

    /// Publishes the deduction confirmation. The deduction stands whatever
    /// happens here; a rejected publish goes straight to the dead-letter topic.
    async fn confirm(&self, ctx: &RequestContext, request: &InventoryDeductionRequest) {
        let event = request.to_deducted_event();
        let key = request.order_id.to_string();
        let topic = self.settings.confirmation_topic.as_str();

        let err = match self.listener.publish(ctx, topic, &event, Some(&key)).await {
            Ok(event_id) => {
                tracing::info!(topic, event_id = %event_id, "deduction confirmation published");
                return;
            }
            Err(err) => err,
        };
        tracing::error!(topic, error = %err, "deduction confirmation not accepted by transport");

        let envelope = match Envelope::json(topic, &event) {
            Ok(envelope) => envelope
                .with_header(headers::TRACE_ID, ctx.trace_id())
                .with_header(headers::EVENT_ID, Uuid::new_v4().to_string())
                .with_header(headers::TIMESTAMP, now_millis().to_string())
                .with_header(headers::PARTITION_KEY, key),
            Err(encode_err) => {
                tracing::error!(error = %encode_err, "failed to encode deduction confirmation");
                return;
            }
        };
        let router = self.listener.dead_letter_router();
        if let Err(route_err) = router.route(&envelope, &err.to_string(), "producer").await {
            tracing::error!(
                topic,
                error = %route_err,
                "deduction confirmation lost: dead-letter publish rejected"
            );
        }
    }
}

/// Id of the message that triggered the call, or a fresh one for direct calls.
fn inbound_event_id(ctx: &RequestContext) -> String {
    ctx.metadata()
        .get(headers::EVENT_ID)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Row-locks every product and variant of the request, failing on unknown ids.
async fn lock_rows<Tx: StorageTx>(
    tx: &mut Tx,
    products: &[ProductLine],
    variants: &[VariantLine],
) -> storage::Result<()> {
    if !products.is_empty() {
        let mut ids: Vec<ProductId> = products.iter().map(|l| l.product_id).collect();
        ids.sort();
        let locked = tx.lock_products(&ids).await?;
        if let Some(missing) = ids.iter().find(|id| !locked.iter().any(|p| p.id == **id)) {
            return Err(StorageError::NotFound(StockTarget::Product(*missing)));
        }
    }
    if !variants.is_empty() {
        let mut ids: Vec<VariantId> = variants.iter().map(|l| l.variant_id).collect();
        ids.sort();
        let locked = tx.lock_variants(&ids).await?;
        if let Some(missing) = ids.iter().find(|id| !locked.iter().any(|v| v.id == **id)) {
            return Err(StorageError::NotFound(StockTarget::Variant(*missing)));
        }
    }
    Ok(())
}

fn record_operation(operation: &'static str, result: &Result<DeductionOutcome>, started: Instant) {
    let outcome = match result {
        Ok(outcome) => outcome.as_str(),
        Err(err) => err.kind().as_str(),
    };
    let elapsed = started.elapsed();
    metrics::counter!(
        "inventory_operations_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("inventory_operation_duration_seconds", "operation" => operation)
        .record(elapsed.as_secs_f64());

    match result {
        Ok(outcome) => tracing::info!(
            operation,
            outcome = outcome.as_str(),
            duration_ms = elapsed.as_millis() as u64,
            "inventory operation finished"
        ),
        Err(err) => tracing::warn!(
            operation,
            kind = %err.kind(),
            error = %err,
            duration_ms = elapsed.as_millis() as u64,
            "inventory operation failed"
        ),
    }
}
