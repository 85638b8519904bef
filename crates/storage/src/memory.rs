use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::{BranchOp, OrderId, ProductId, SagaBranch, VariantId};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    IdempotencyRecord, LedgerKind, NewIdempotencyRecord, NewProduct, NewVariant, Product,
    ProductVariant, Result, StockTarget, StorageError,
    store::{Storage, StorageTx, ensure_positive},
};

type BarrierKey = (String, String, &'static str, String);

#[derive(Debug, Clone, Default)]
struct Tables {
    products: BTreeMap<ProductId, Product>,
    variants: BTreeMap<VariantId, ProductVariant>,
    ledger: Vec<IdempotencyRecord>,
    barriers: HashSet<BarrierKey>,
    next_product_id: i64,
    next_variant_id: i64,
    next_record_id: i64,
}

impl Tables {
    fn find_record(&self, order_id: OrderId, kind: LedgerKind) -> Option<&IdempotencyRecord> {
        self.ledger
            .iter()
            .find(|r| r.order_id == order_id && r.kind == kind)
    }

    fn product_mut(&mut self, id: ProductId) -> Result<&mut Product> {
        self.products
            .get_mut(&id)
            .ok_or(StorageError::NotFound(StockTarget::Product(id)))
    }

    fn variant_mut(&mut self, id: VariantId) -> Result<&mut ProductVariant> {
        self.variants
            .get_mut(&id)
            .ok_or(StorageError::NotFound(StockTarget::Variant(id)))
    }
}

fn apply_delta(stock: &mut i64, target: StockTarget, delta: i64) -> Result<()> {
    let next = stock
        .checked_add(delta)
        .ok_or(StorageError::InvalidQuantity {
            target,
            quantity: delta.saturating_abs(),
        })?;
    if next < 0 {
        return Err(StorageError::InsufficientStock {
            target,
            requested: -delta,
            available: *stock,
        });
    }
    *stock = next;
    Ok(())
}

/// In-memory storage for tests and single-process runs.
///
/// Transactions are serialised: `begin` takes the table lock and holds it
/// until the transaction commits or is dropped, mutating a private copy in
/// between. Non-transactional reads wait for the open transaction.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<Mutex<Tables>>,
    unavailable: Arc<AtomicBool>,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_product(&self, new: NewProduct) -> Product {
        let mut tables = self.tables.lock().await;
        tables.next_product_id += 1;
        let now = Utc::now();
        let product = Product {
            id: ProductId::new(tables.next_product_id),
            name: new.name,
            sku: new.sku,
            price_cents: new.price_cents,
            description: new.description,
            stock: new.stock,
            created_at: now,
            updated_at: now,
        };
        tables.products.insert(product.id, product.clone());
        product
    }

    pub async fn insert_variant(&self, new: NewVariant) -> ProductVariant {
        let mut tables = self.tables.lock().await;
        tables.next_variant_id += 1;
        let now = Utc::now();
        let variant = ProductVariant {
            id: VariantId::new(tables.next_variant_id),
            code: new.code,
            product_id: new.product_id,
            name: new.name,
            stock: new.stock,
            price_cents: new.price_cents,
            created_at: now,
            updated_at: now,
        };
        tables.variants.insert(variant.id, variant.clone());
        variant
    }

    pub async fn product_stock(&self, id: ProductId) -> Option<i64> {
        self.tables.lock().await.products.get(&id).map(|p| p.stock)
    }

    pub async fn variant_stock(&self, id: VariantId) -> Option<i64> {
        self.tables.lock().await.variants.get(&id).map(|v| v.stock)
    }

    /// Returns the number of ledger records.
    pub async fn record_count(&self) -> usize {
        self.tables.lock().await.ledger.len()
    }

    pub async fn barrier_count(&self) -> usize {
        self.tables.lock().await.barriers.len()
    }

    /// Makes `begin` and `ping` fail with a transport error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next commit fail and discard its changes.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("in-memory storage switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx> {
        self.check_available()?;
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(InMemoryTx {
            guard,
            staged,
            fail_commit: self.fail_next_commit.clone(),
        })
    }

    async fn find_product_by_id(&self, id: ProductId) -> Result<Option<Product>> {
        Ok(self.tables.lock().await.products.get(&id).cloned())
    }

    async fn find_variants_by_ids(&self, ids: &[VariantId]) -> Result<Vec<ProductVariant>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .variants
            .values()
            .filter(|v| ids.contains(&v.id))
            .cloned()
            .collect())
    }

    async fn find_idempotency_record(
        &self,
        order_id: OrderId,
        kind: LedgerKind,
    ) -> Result<Option<IdempotencyRecord>> {
        Ok(self.tables.lock().await.find_record(order_id, kind).cloned())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

/// Transaction over [`InMemoryStorage`].
pub struct InMemoryTx {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
    fail_commit: Arc<AtomicBool>,
}

#[async_trait]
impl StorageTx for InMemoryTx {
    async fn lock_products(&mut self, ids: &[ProductId]) -> Result<Vec<Product>> {
        Ok(self
            .staged
            .products
            .values()
            .filter(|p| ids.contains(&p.id))
            .cloned()
            .collect())
    }

    async fn lock_variants(&mut self, ids: &[VariantId]) -> Result<Vec<ProductVariant>> {
        Ok(self
            .staged
            .variants
            .values()
            .filter(|v| ids.contains(&v.id))
            .cloned()
            .collect())
    }

    async fn deduct_product_stock(&mut self, id: ProductId, quantity: i64) -> Result<()> {
        let target = StockTarget::Product(id);
        ensure_positive(target, quantity)?;
        let product = self.staged.product_mut(id)?;
        apply_delta(&mut product.stock, target, -quantity)?;
        product.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_product_stock(&mut self, id: ProductId, quantity: i64) -> Result<()> {
        let target = StockTarget::Product(id);
        ensure_positive(target, quantity)?;
        let product = self.staged.product_mut(id)?;
        apply_delta(&mut product.stock, target, quantity)?;
        product.updated_at = Utc::now();
        Ok(())
    }

    async fn deduct_variant_stock(&mut self, id: VariantId, quantity: i64) -> Result<()> {
        let target = StockTarget::Variant(id);
        ensure_positive(target, quantity)?;
        let variant = self.staged.variant_mut(id)?;
        apply_delta(&mut variant.stock, target, -quantity)?;
        variant.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_variant_stock(&mut self, id: VariantId, quantity: i64) -> Result<()> {
        let target = StockTarget::Variant(id);
        ensure_positive(target, quantity)?;
        let variant = self.staged.variant_mut(id)?;
        apply_delta(&mut variant.stock, target, quantity)?;
        variant.updated_at = Utc::now();
        Ok(())
    }

    async fn find_idempotency_record(
        &mut self,
        order_id: OrderId,
        kind: LedgerKind,
    ) -> Result<Option<IdempotencyRecord>> {
        Ok(self.staged.find_record(order_id, kind).cloned())
    }

    async fn create_idempotency_record(
        &mut self,
        record: NewIdempotencyRecord,
    ) -> Result<IdempotencyRecord> {
        if self.staged.find_record(record.order_id, record.kind).is_some() {
            return Err(StorageError::DuplicateRecord {
                order_id: record.order_id,
                kind: record.kind,
            });
        }
        self.staged.next_record_id += 1;
        let now = Utc::now();
        let stored = IdempotencyRecord {
            id: self.staged.next_record_id,
            event_id: record.event_id,
            order_id: record.order_id,
            kind: record.kind,
            created_at: now,
            updated_at: now,
        };
        self.staged.ledger.push(stored.clone());
        Ok(stored)
    }

    async fn insert_barrier(&mut self, branch: &SagaBranch, op: BranchOp) -> Result<bool> {
        let key = (
            branch.gid.clone(),
            branch.branch_id.clone(),
            op.as_str(),
            branch.barrier_id.clone(),
        );
        Ok(self.staged.barriers.insert(key))
    }

    async fn commit(self) -> Result<()> {
        let InMemoryTx {
            mut guard,
            staged,
            fail_commit,
        } = self;
        if fail_commit.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Unavailable("commit failed".into()));
        }
        *guard = staged;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}
