use std::time::Duration;

use async_trait::async_trait;
use common::{BranchOp, OrderId, ProductId, SagaBranch, VariantId};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::{
    IdempotencyRecord, LedgerKind, NewIdempotencyRecord, NewProduct, NewVariant, Product,
    ProductVariant, Result, StockTarget, StorageError,
    store::{Storage, StorageTx, ensure_positive},
};

const LEDGER_UNIQUE_CONSTRAINT: &str = "order_inventory_events_order_kind_key";

/// Connection pool sizing.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 20,
            min_connections: 2,
            max_lifetime: Duration::from_secs(30 * 60),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// PostgreSQL-backed stock storage.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool sized by `settings`.
    pub async fn connect(settings: &PoolSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .max_lifetime(settings.max_lifetime)
            .acquire_timeout(settings.acquire_timeout)
            .connect(&settings.url)
            .await?;
        tracing::info!(
            max_connections = settings.max_connections,
            min_connections = settings.min_connections,
            "connected to postgres"
        );
        Ok(Self { pool })
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn create_product(&self, new: NewProduct) -> Result<Product> {
        let row = sqlx::query(
            r#"
            INSERT INTO products (name, sku, price_cents, description, stock)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, sku, price_cents, description, stock, created_at, updated_at
            "#,
        )
        .bind(&new.name)
        .bind(&new.sku)
        .bind(new.price_cents)
        .bind(&new.description)
        .bind(new.stock)
        .fetch_one(&self.pool)
        .await?;
        row_to_product(&row)
    }

    pub async fn create_variant(&self, new: NewVariant) -> Result<ProductVariant> {
        let row = sqlx::query(
            r#"
            INSERT INTO product_variants (code, product_id, name, stock, price_cents)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, code, product_id, name, stock, price_cents, created_at, updated_at
            "#,
        )
        .bind(&new.code)
        .bind(new.product_id.as_i64())
        .bind(&new.name)
        .bind(new.stock)
        .bind(new.price_cents)
        .fetch_one(&self.pool)
        .await?;
        row_to_variant(&row)
    }
}

fn row_to_product(row: &PgRow) -> Result<Product> {
    Ok(Product {
        id: ProductId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        sku: row.try_get("sku")?,
        price_cents: row.try_get("price_cents")?,
        description: row.try_get("description")?,
        stock: row.try_get("stock")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_variant(row: &PgRow) -> Result<ProductVariant> {
    Ok(ProductVariant {
        id: VariantId::new(row.try_get("id")?),
        code: row.try_get("code")?,
        product_id: ProductId::new(row.try_get("product_id")?),
        name: row.try_get("name")?,
        stock: row.try_get("stock")?,
        price_cents: row.try_get("price_cents")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_record(row: &PgRow) -> Result<IdempotencyRecord> {
    let kind: String = row.try_get("kind")?;
    Ok(IdempotencyRecord {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        order_id: OrderId::new(row.try_get("order_id")?),
        kind: kind.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn raw_ids<T: Copy + Into<i64>>(ids: &[T]) -> Vec<i64> {
    ids.iter().map(|id| (*id).into()).collect()
}

#[async_trait]
impl Storage for PostgresStorage {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<PostgresTx> {
        let tx = self.pool.begin().await?;
        Ok(PostgresTx { tx })
    }

    async fn find_product_by_id(&self, id: ProductId) -> Result<Option<Product>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, sku, price_cents, description, stock, created_at, updated_at
            FROM products
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_product).transpose()
    }

    async fn find_variants_by_ids(&self, ids: &[VariantId]) -> Result<Vec<ProductVariant>> {
        let rows = sqlx::query(
            r#"
            SELECT id, code, product_id, name, stock, price_cents, created_at, updated_at
            FROM product_variants
            WHERE id = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(raw_ids(ids))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_variant).collect()
    }

    async fn find_idempotency_record(
        &self,
        order_id: OrderId,
        kind: LedgerKind,
    ) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, event_id, order_id, kind, created_at, updated_at
            FROM order_inventory_events
            WHERE order_id = $1 AND kind = $2
            "#,
        )
        .bind(order_id.as_i64())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Transaction over [`PostgresStorage`].
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

impl PostgresTx {
    /// Explains why a guarded update touched no row.
    async fn explain_miss(
        &mut self,
        table: &'static str,
        target: StockTarget,
        id: i64,
        requested: i64,
    ) -> StorageError {
        let query = format!("SELECT stock FROM {table} WHERE id = $1");
        match sqlx::query_scalar::<_, i64>(&query)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
        {
            Ok(Some(available)) => StorageError::InsufficientStock {
                target,
                requested,
                available,
            },
            Ok(None) => StorageError::NotFound(target),
            Err(e) => StorageError::Database(e),
        }
    }

    async fn adjust_stock(
        &mut self,
        table: &'static str,
        target: StockTarget,
        id: i64,
        delta: i64,
    ) -> Result<()> {
        // Deductions only match rows that can cover them; increments always match.
        let query = format!(
            "UPDATE {table} SET stock = stock + $2, updated_at = NOW() \
             WHERE id = $1 AND stock + $2 >= 0"
        );
        let affected = sqlx::query(&query)
            .bind(id)
            .bind(delta)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(self.explain_miss(table, target, id, -delta).await);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageTx for PostgresTx {
    async fn lock_products(&mut self, ids: &[ProductId]) -> Result<Vec<Product>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, sku, price_cents, description, stock, created_at, updated_at
            FROM products
            WHERE id = ANY($1)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(raw_ids(ids))
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(row_to_product).collect()
    }

    async fn lock_variants(&mut self, ids: &[VariantId]) -> Result<Vec<ProductVariant>> {
        let rows = sqlx::query(
            r#"
            SELECT id, code, product_id, name, stock, price_cents, created_at, updated_at
            FROM product_variants
            WHERE id = ANY($1)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(raw_ids(ids))
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(row_to_variant).collect()
    }

    async fn deduct_product_stock(&mut self, id: ProductId, quantity: i64) -> Result<()> {
        let target = StockTarget::Product(id);
        ensure_positive(target, quantity)?;
        self.adjust_stock("products", target, id.as_i64(), -quantity)
            .await
    }

    async fn increment_product_stock(&mut self, id: ProductId, quantity: i64) -> Result<()> {
        let target = StockTarget::Product(id);
        ensure_positive(target, quantity)?;
        self.adjust_stock("products", target, id.as_i64(), quantity)
            .await
    }

    async fn deduct_variant_stock(&mut self, id: VariantId, quantity: i64) -> Result<()> {
        let target = StockTarget::Variant(id);
        ensure_positive(target, quantity)?;
        self.adjust_stock("product_variants", target, id.as_i64(), -quantity)
            .await
    }

    async fn increment_variant_stock(&mut self, id: VariantId, quantity: i64) -> Result<()> {
        let target = StockTarget::Variant(id);
        ensure_positive(target, quantity)?;
        self.adjust_stock("product_variants", target, id.as_i64(), quantity)
            .await
    }

    async fn find_idempotency_record(
        &mut self,
        order_id: OrderId,
        kind: LedgerKind,
    ) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, event_id, order_id, kind, created_at, updated_at
            FROM order_inventory_events
            WHERE order_id = $1 AND kind = $2
            "#,
        )
        .bind(order_id.as_i64())
        .bind(kind.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn create_idempotency_record(
        &mut self,
        record: NewIdempotencyRecord,
    ) -> Result<IdempotencyRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO order_inventory_events (event_id, order_id, kind)
            VALUES ($1, $2, $3)
            RETURNING id, event_id, order_id, kind, created_at, updated_at
            "#,
        )
        .bind(&record.event_id)
        .bind(record.order_id.as_i64())
        .bind(record.kind.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some(LEDGER_UNIQUE_CONSTRAINT)
            {
                return StorageError::DuplicateRecord {
                    order_id: record.order_id,
                    kind: record.kind,
                };
            }
            StorageError::Database(e)
        })?;
        row_to_record(&row)
    }

    async fn insert_barrier(&mut self, branch: &SagaBranch, op: BranchOp) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            INSERT INTO saga_barriers (trans_type, gid, branch_id, op, barrier_id, reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (gid, branch_id, op, barrier_id) DO NOTHING
            "#,
        )
        .bind(&branch.trans_type)
        .bind(&branch.gid)
        .bind(&branch.branch_id)
        .bind(op.as_str())
        .bind(&branch.barrier_id)
        .bind(branch.op.as_str())
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
