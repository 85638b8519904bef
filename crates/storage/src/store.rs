use async_trait::async_trait;
use common::{BranchOp, OrderId, ProductId, SagaBranch, VariantId};

use crate::{
    IdempotencyRecord, LedgerKind, NewIdempotencyRecord, Product, ProductVariant, Result,
};

/// Entry point to stock storage.
///
/// Reads outside a transaction are snapshot reads and take no row locks.
/// Every mutation goes through a [`StorageTx`] obtained from [`Storage::begin`].
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    type Tx: StorageTx;

    /// Opens a new local transaction.
    async fn begin(&self) -> Result<Self::Tx>;

    async fn find_product_by_id(&self, id: ProductId) -> Result<Option<Product>>;

    /// Returns the variants that exist among `ids`, ordered by id.
    async fn find_variants_by_ids(&self, ids: &[VariantId]) -> Result<Vec<ProductVariant>>;

    async fn find_idempotency_record(
        &self,
        order_id: OrderId,
        kind: LedgerKind,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Cheap connectivity probe used by readiness checks.
    async fn ping(&self) -> Result<()>;
}

/// A single local transaction.
///
/// Dropping a transaction without calling [`commit`](StorageTx::commit)
/// discards its changes.
#[async_trait]
pub trait StorageTx: Send + 'static {
    /// Row-locks the given products until the transaction ends.
    ///
    /// Rows are locked in id order so concurrent transactions touching the
    /// same products cannot deadlock.
    async fn lock_products(&mut self, ids: &[ProductId]) -> Result<Vec<Product>>;

    /// Row-locks the given variants until the transaction ends.
    async fn lock_variants(&mut self, ids: &[VariantId]) -> Result<Vec<ProductVariant>>;

    /// Decrements product stock, failing with `InsufficientStock` rather than
    /// going negative.
    async fn deduct_product_stock(&mut self, id: ProductId, quantity: i64) -> Result<()>;

    async fn increment_product_stock(&mut self, id: ProductId, quantity: i64) -> Result<()>;

    async fn deduct_variant_stock(&mut self, id: VariantId, quantity: i64) -> Result<()>;

    async fn increment_variant_stock(&mut self, id: VariantId, quantity: i64) -> Result<()>;

    async fn find_idempotency_record(
        &mut self,
        order_id: OrderId,
        kind: LedgerKind,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Fails with `DuplicateRecord` when the order already has a record of
    /// the same kind.
    async fn create_idempotency_record(
        &mut self,
        record: NewIdempotencyRecord,
    ) -> Result<IdempotencyRecord>;

    /// Inserts the barrier row for `(branch, op)` with the branch's own op as
    /// the reason. Returns `false` when the row already exists.
    async fn insert_barrier(&mut self, branch: &SagaBranch, op: BranchOp) -> Result<bool>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

pub(crate) fn ensure_positive(
    target: crate::StockTarget,
    quantity: i64,
) -> Result<()> {
    if quantity <= 0 {
        return Err(crate::StorageError::InvalidQuantity { target, quantity });
    }
    Ok(())
}
