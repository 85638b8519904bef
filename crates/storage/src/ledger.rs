//! Idempotency ledger: one durable marker per (order, kind).

use common::OrderId;

use crate::{
    IdempotencyRecord, LedgerKind, NewIdempotencyRecord, Result,
    store::{Storage, StorageTx},
};

/// Thin facade over the `order_inventory_events` table.
///
/// Lookups outside a transaction are advisory: the caller must hold the
/// order-scoped lock, and the unique constraint catches anything that still
/// slips through when the record is created inside the mutating transaction.
#[derive(Clone)]
pub struct IdempotencyLedger<S> {
    storage: S,
}

impl<S: Storage> IdempotencyLedger<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Returns true when a record of `kind` already exists for the order.
    pub async fn find_by_order_id(&self, order_id: OrderId, kind: LedgerKind) -> Result<bool> {
        Ok(self
            .storage
            .find_idempotency_record(order_id, kind)
            .await?
            .is_some())
    }

    /// Same as [`find_by_order_id`](Self::find_by_order_id) but reads inside
    /// an open transaction.
    pub async fn exists_in(
        &self,
        tx: &mut S::Tx,
        order_id: OrderId,
        kind: LedgerKind,
    ) -> Result<bool> {
        Ok(tx.find_idempotency_record(order_id, kind).await?.is_some())
    }

    /// Writes the record in the caller's transaction so it commits atomically
    /// with the stock mutation it marks.
    pub async fn create(
        &self,
        tx: &mut S::Tx,
        record: NewIdempotencyRecord,
    ) -> Result<IdempotencyRecord> {
        let created = tx.create_idempotency_record(record).await?;
        metrics::counter!("idempotency_records_created_total", "kind" => created.kind.as_str())
            .increment(1);
        Ok(created)
    }
}
