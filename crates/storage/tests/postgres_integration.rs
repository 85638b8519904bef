//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and need a Docker daemon.
//! Run with:
//!
//! ```bash
//! cargo test -p storage --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use common::{BranchOp, OrderId, RequestContext, SagaBranch};
use serial_test::serial;
use sqlx::PgPool;
use storage::{
    BarrierOutcome, IdempotencyLedger, LedgerKind, NewIdempotencyRecord, NewProduct, NewVariant,
    PostgresStorage, Storage, StorageError, StorageTx, TransactionManager,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_inventory_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Fresh pool with cleared tables.
async fn get_test_storage() -> PostgresStorage {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE product_variants, products, order_inventory_events, saga_barriers, \
         distributed_locks RESTART IDENTITY CASCADE",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresStorage::new(pool)
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn deduct_and_increment_round_trip() {
    let storage = get_test_storage().await;
    let product = storage
        .create_product(NewProduct::new("SKU-1", 10))
        .await
        .unwrap();
    let variant = storage
        .create_variant(NewVariant::new(product.id, "SKU-1-L", 5))
        .await
        .unwrap();

    let mut tx = storage.begin().await.unwrap();
    let locked = tx.lock_products(&[product.id]).await.unwrap();
    assert_eq!(locked.len(), 1);
    tx.deduct_product_stock(product.id, 3).await.unwrap();
    tx.deduct_variant_stock(variant.id, 2).await.unwrap();
    tx.commit().await.unwrap();

    let reloaded = storage.find_product_by_id(product.id).await.unwrap().unwrap();
    assert_eq!(reloaded.stock, 7);
    let variants = storage.find_variants_by_ids(&[variant.id]).await.unwrap();
    assert_eq!(variants[0].stock, 3);

    let mut tx = storage.begin().await.unwrap();
    tx.increment_product_stock(product.id, 3).await.unwrap();
    tx.commit().await.unwrap();
    let reloaded = storage.find_product_by_id(product.id).await.unwrap().unwrap();
    assert_eq!(reloaded.stock, 10);
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn insufficient_stock_reports_available_quantity() {
    let storage = get_test_storage().await;
    let product = storage
        .create_product(NewProduct::new("SKU-2", 2))
        .await
        .unwrap();

    let mut tx = storage.begin().await.unwrap();
    let err = tx.deduct_product_stock(product.id, 5).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::InsufficientStock {
            requested: 5,
            available: 2,
            ..
        }
    ));
    tx.rollback().await.unwrap();

    let mut tx = storage.begin().await.unwrap();
    let err = tx
        .deduct_product_stock(common::ProductId::new(9999), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn ledger_unique_violation_maps_to_duplicate() {
    let storage = get_test_storage().await;
    let ledger = IdempotencyLedger::new(storage.clone());
    let order = OrderId::new(77);

    let mut tx = storage.begin().await.unwrap();
    ledger
        .create(&mut tx, NewIdempotencyRecord::new("e1", order, LedgerKind::Deduct))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = storage.begin().await.unwrap();
    let err = ledger
        .create(&mut tx, NewIdempotencyRecord::new("e2", order, LedgerKind::Deduct))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateRecord { .. }));

    assert!(ledger.find_by_order_id(order, LedgerKind::Deduct).await.unwrap());
    assert!(!ledger.find_by_order_id(order, LedgerKind::Revert).await.unwrap());
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn barrier_blocks_duplicate_branch_calls() {
    let storage = get_test_storage().await;
    let product = storage
        .create_product(NewProduct::new("SKU-3", 10))
        .await
        .unwrap();
    let manager = TransactionManager::new(storage.clone());
    let id = product.id;
    let ctx =
        RequestContext::new().with_saga_branch(SagaBranch::new("gid-pg", "01", BranchOp::Action));

    for expected in [BarrierOutcome::Executed(()), BarrierOutcome::Duplicate] {
        let outcome = manager
            .execute_with_barrier(&ctx, move |tx| {
                Box::pin(async move { tx.deduct_product_stock(id, 4).await })
            })
            .await
            .unwrap();
        assert_eq!(outcome, expected);
    }

    let reloaded = storage.find_product_by_id(id).await.unwrap().unwrap();
    assert_eq!(reloaded.stock, 6);
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn ping_succeeds_against_live_database() {
    let storage = get_test_storage().await;
    storage.ping().await.unwrap();
}
